//! Connection to the other replicas of a session.
//!
//! A transport sends `WireMessage`s to every other participant of the
//! session and reports what it receives, together with connection status
//! changes, as `TransportEvent`s on the engine's channel.
//!
//! `WsTransport` runs blocking tungstenite I/O on its own thread and
//! reconnects with exponential backoff. `MemoryHub` wires transports
//! together in-process for tests.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::doc::{ReplicaId, Update, Versions};
use super::presence::PresenceState;
use crate::debug;

/// How long a connected socket blocks on read before checking its outbox.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

// =============================================================================
// Wire Protocol
// =============================================================================

/// Messages exchanged between replicas, JSON encoded.
///
/// ```text
///   A                               B
///   ── SyncStep1{from: A, vA} ──►
///                                 ◄── SyncStep2{to: A, diff(vA), vB}
///   ── Update{diff(vB)} ────────►
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// "This is what I have": asks peers for anything newer.
    SyncStep1 { from: ReplicaId, versions: Versions },
    /// Answer to a step 1. Only `to` answers the attached versions.
    SyncStep2 {
        from: ReplicaId,
        to: ReplicaId,
        update: Update,
        versions: Versions,
    },
    Update { update: Update },
    Awareness {
        client: u64,
        clock: u64,
        state: Option<PresenceState>,
    },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStep1 { .. } => "syncStep1",
            Self::SyncStep2 { .. } => "syncStep2",
            Self::Update { .. } => "update",
            Self::Awareness { .. } => "awareness",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    Message(WireMessage),
}

pub type EventSender = UnboundedSender<TransportEvent>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("invalid server url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Contract of a session connection.
pub trait Transport: Send + Sync {
    /// Queue `msg` for every other participant. Dropped while disconnected.
    fn send(&self, msg: WireMessage) -> Result<(), TransportError>;

    fn status(&self) -> ConnectionStatus;

    /// Disconnect for good. No events are emitted afterwards.
    fn close(&self);
}

/// Address of a session on a relay: `<server>/map/<session>`.
pub fn session_url(server: &str, session: &str) -> Result<Url, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: server.to_string(),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(server).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "ws" => {}
        // tungstenite is built without a TLS backend
        "wss" => return Err(invalid("wss is not supported, use ws behind a TLS proxy")),
        _ => return Err(invalid("scheme must be ws")),
    }
    url.path_segments_mut()
        .map_err(|()| invalid("url cannot be a base"))?
        .pop_if_empty()
        .push("map")
        .push(session);
    Ok(url)
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential reconnect delay, doubled per failure up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    outbox: Sender<WireMessage>,
    shutdown: Sender<()>,
    status: Arc<Mutex<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WsTransport {
    /// Start connecting to `url` in the background.
    pub fn connect(url: Url, backoff: Backoff, events: EventSender) -> Self {
        let (outbox, outbox_rx) = channel::unbounded();
        let (shutdown, shutdown_rx) = channel::bounded(1);
        let status = Arc::new(Mutex::new(ConnectionStatus::Connecting));
        let closed = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            url,
            backoff,
            outbox: outbox_rx,
            shutdown: shutdown_rx,
            status: Arc::clone(&status),
            closed: Arc::clone(&closed),
            events,
        };
        let handle = thread::spawn(move || worker.run());

        Self {
            outbox,
            shutdown,
            status,
            closed,
            handle: Mutex::new(Some(handle)),
        }
    }
}

impl Transport for WsTransport {
    fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbox.send(msg).map_err(|_| TransportError::Closed)
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    url: Url,
    backoff: Backoff,
    outbox: Receiver<WireMessage>,
    shutdown: Receiver<()>,
    status: Arc<Mutex<ConnectionStatus>>,
    closed: Arc<AtomicBool>,
    events: EventSender,
}

/// Why a connected session ended.
enum Ended {
    Shutdown,
    Lost,
}

impl Worker {
    fn run(mut self) {
        loop {
            self.report(ConnectionStatus::Connecting);
            match tungstenite::connect(self.url.as_str()) {
                Ok((mut socket, _)) => {
                    set_poll_timeout(&socket);
                    self.backoff.reset();
                    self.report(ConnectionStatus::Connected);
                    debug!("ws"; "connected to {}", self.url);

                    let ended = self.pump(&mut socket);
                    let _ = socket.close(None);
                    let _ = socket.flush();
                    if matches!(ended, Ended::Shutdown) {
                        return;
                    }
                }
                Err(e) => debug!("ws"; "connect to {} failed: {}", self.url, e),
            }
            self.report(ConnectionStatus::Disconnected);

            // Anything queued while offline is covered by the next resync
            while self.outbox.try_recv().is_ok() {}

            let delay = self.backoff.next_delay();
            debug!("ws"; "reconnecting in {:?}", delay);
            match self.shutdown.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Move messages both ways until the socket drops or shutdown is asked.
    fn pump(&mut self, socket: &mut Socket) -> Ended {
        loop {
            match self.shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => return Ended::Shutdown,
            }

            while let Ok(msg) = self.outbox.try_recv() {
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if let Err(e) = socket.send(Message::Text(text.into())) {
                    debug!("ws"; "send failed: {}", e);
                    return Ended::Lost;
                }
            }

            match socket.read() {
                Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                    Ok(msg) => self.emit(TransportEvent::Message(msg)),
                    Err(e) => debug!("ws"; "ignoring malformed message: {}", e),
                },
                Ok(Message::Close(_)) => return Ended::Lost,
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    debug!("ws"; "connection lost: {}", e);
                    return Ended::Lost;
                }
            }
        }
    }

    fn report(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
        self.emit(TransportEvent::Status(status));
    }

    fn emit(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }
}

fn set_poll_timeout(socket: &Socket) {
    if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
        let _ = stream.set_read_timeout(Some(POLL_INTERVAL));
    }
}

// =============================================================================
// In-Memory Transport
// =============================================================================

struct HubPeer {
    id: u64,
    online: Arc<AtomicBool>,
    events: EventSender,
}

/// In-process relay connecting `MemoryTransport`s.
#[derive(Default)]
pub struct MemoryHub {
    peers: Mutex<Vec<HubPeer>>,
    next_id: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the hub. The transport starts connected.
    pub fn connect(self: &Arc<Self>, events: EventSender) -> MemoryTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let online = Arc::new(AtomicBool::new(true));
        self.peers.lock().push(HubPeer {
            id,
            online: Arc::clone(&online),
            events: events.clone(),
        });
        let _ = events.send(TransportEvent::Status(ConnectionStatus::Connected));
        MemoryTransport {
            hub: Arc::clone(self),
            id,
            online,
            closed: AtomicBool::new(false),
            events,
        }
    }

    fn broadcast(&self, from: u64, msg: &WireMessage) {
        for peer in self.peers.lock().iter() {
            if peer.id != from && peer.online.load(Ordering::SeqCst) {
                let _ = peer.events.send(TransportEvent::Message(msg.clone()));
            }
        }
    }

    fn leave(&self, id: u64) {
        self.peers.lock().retain(|peer| peer.id != id);
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    id: u64,
    online: Arc<AtomicBool>,
    closed: AtomicBool,
    events: EventSender,
}

impl MemoryTransport {
    /// Simulate losing or regaining the connection.
    pub fn set_online(&self, online: bool) {
        if self.closed.load(Ordering::SeqCst) || self.online.swap(online, Ordering::SeqCst) == online
        {
            return;
        }
        let status = if online {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        let _ = self.events.send(TransportEvent::Status(status));
    }
}

impl Transport for MemoryTransport {
    fn send(&self, msg: WireMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.online.load(Ordering::SeqCst) {
            self.hub.broadcast(self.id, &msg);
        }
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        if self.online.load(Ordering::SeqCst) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.online.store(false, Ordering::SeqCst);
            self.hub.leave(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_session_url() {
        let url = session_url("ws://127.0.0.1:4005", "team map").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:4005/map/team%20map");

        let url = session_url("ws://example.com/sync/", "s1").unwrap();
        assert_eq!(url.as_str(), "ws://example.com/sync/map/s1");

        assert!(matches!(
            session_url("http://example.com", "s1"),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_session_url_rejects_tls() {
        let err = session_url("wss://example.com", "s1").unwrap_err();
        let TransportError::InvalidUrl { url, reason } = err else {
            panic!("expected invalid url");
        };
        assert_eq!(url, "wss://example.com");
        assert!(reason.contains("wss"));
    }

    #[test]
    fn test_wire_message_json_shape() {
        let msg = WireMessage::Awareness {
            client: 7,
            clock: 2,
            state: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "awareness");
        assert_eq!(json["state"], serde_json::Value::Null);
        let back: WireMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_memory_hub_delivers_to_others() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.connect(tx_a);
        let _b = hub.connect(tx_b);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            TransportEvent::Status(ConnectionStatus::Connected)
        );
        rx_b.try_recv().unwrap();

        let msg = WireMessage::Update {
            update: Update::new(),
        };
        a.send(msg.clone()).unwrap();
        assert_eq!(rx_b.try_recv().unwrap(), TransportEvent::Message(msg));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_memory_transport_offline_drops_messages() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.connect(tx_a);
        let _b = hub.connect(tx_b);
        rx_a.try_recv().unwrap();
        rx_b.try_recv().unwrap();

        a.set_online(false);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            TransportEvent::Status(ConnectionStatus::Disconnected)
        );
        a.send(WireMessage::Update {
            update: Update::new(),
        })
        .unwrap();
        assert!(rx_b.try_recv().is_err());

        a.close();
        assert!(matches!(
            a.send(WireMessage::Update {
                update: Update::new()
            }),
            Err(TransportError::Closed)
        ));
    }
}
