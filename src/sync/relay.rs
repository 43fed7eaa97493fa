//! Session relay server.
//!
//! Clients connect to `/map/<session>`. Every text message a client sends
//! is forwarded unchanged to all other clients of the same session. The
//! relay keeps no document state; it only remembers the presence client id
//! each connection announced, so it can clear that presence for the others
//! when the connection goes away.
//!
//! # Architecture
//!
//! ```text
//! acceptor thread --[handshake, session]--> clients <--poll-- pump thread
//! ```

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::{Message, WebSocket};

use super::transport::WireMessage;
use crate::{debug, log};

/// Maximum port retry attempts
const MAX_PORT_RETRIES: u16 = 10;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PUMP_POLL: Duration = Duration::from_millis(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    ws: WebSocket<TcpStream>,
    addr: SocketAddr,
    session: String,
    /// Last presence announcement seen: (client id, clock).
    presence: Option<(u64, u64)>,
}

type Clients = Arc<Mutex<Vec<Client>>>;

/// A running relay. Stops when dropped.
pub struct Relay {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Relay {
    /// Bind `interface:port` (trying the next ports if taken) and start serving.
    pub fn start(interface: &str, port: u16) -> Result<Self> {
        let listener = try_bind_port(interface, port, MAX_PORT_RETRIES)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let clients: Clients = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let stop = Arc::clone(&stop);
            let clients = Arc::clone(&clients);
            thread::spawn(move || accept_loop(listener, clients, stop))
        };
        let pump = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || pump_loop(clients, stop))
        };

        log!("relay"; "listening on ws://{}/map/<session>", addr);
        Ok(Self {
            addr,
            stop,
            threads: vec![acceptor, pump],
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Accept
// =============================================================================

fn accept_loop(listener: TcpListener, clients: Clients, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => match handshake(stream) {
                Ok((ws, session)) => {
                    debug!("relay"; "{} joined {}", addr, session);
                    clients.lock().push(Client {
                        ws,
                        addr,
                        session,
                        presence: None,
                    });
                }
                Err(e) => debug!("relay"; "rejected {}: {}", addr, e),
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log!("relay"; "accept error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Blocking handshake; the socket is switched to non-blocking afterwards.
fn handshake(stream: TcpStream) -> Result<(WebSocket<TcpStream>, String)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut session = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match session_of(request.uri().path()) {
            Some(name) => {
                session = Some(name);
                Ok(response)
            }
            None => {
                let mut error = ErrorResponse::new(Some("expected /map/<session>".into()));
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        }
    };
    let ws = tungstenite::accept_hdr(stream, callback)
        .map_err(|e| anyhow::anyhow!("handshake failed: {e}"))?;
    let session = session.context("handshake finished without a session")?;

    ws.get_ref().set_read_timeout(None)?;
    ws.get_ref().set_nonblocking(true)?;
    Ok((ws, session))
}

/// Session name from a `/map/<session>` request path.
fn session_of(path: &str) -> Option<String> {
    let raw = path.strip_prefix("/map/")?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

// =============================================================================
// Forward
// =============================================================================

fn pump_loop(clients: Clients, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(PUMP_POLL);
        pump_once(&mut clients.lock());
    }
    for client in clients.lock().iter_mut() {
        let _ = client.ws.close(None);
        let _ = client.ws.flush();
    }
}

/// Read everything available, forward it, and drop dead connections.
fn pump_once(clients: &mut Vec<Client>) {
    let mut inbound: Vec<(usize, String)> = Vec::new();
    let mut gone = vec![false; clients.len()];

    for (i, client) in clients.iter_mut().enumerate() {
        loop {
            match client.ws.read() {
                Ok(Message::Text(text)) => {
                    let text = text.as_str().to_string();
                    if let Some(presence) = presence_of(&text) {
                        client.presence = Some(presence);
                    }
                    inbound.push((i, text));
                }
                Ok(Message::Close(_)) => {
                    gone[i] = true;
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    break;
                }
                Err(_) => {
                    gone[i] = true;
                    break;
                }
            }
        }
    }

    // Peers of a dropped connection learn that its presence is gone
    for (i, client) in clients.iter().enumerate() {
        if let (true, Some((id, clock))) = (gone[i], client.presence) {
            let leave = WireMessage::Awareness {
                client: id,
                clock: clock + 1,
                state: None,
            };
            if let Ok(text) = serde_json::to_string(&leave) {
                inbound.push((i, text));
            }
        }
    }

    for (from, text) in inbound {
        let session = clients[from].session.clone();
        for (i, client) in clients.iter_mut().enumerate() {
            if i == from || gone[i] || client.session != session {
                continue;
            }
            if let Err(e) = client.ws.send(Message::Text(text.clone().into()))
                && !is_would_block(&e)
            {
                gone[i] = true;
            }
        }
    }

    for client in clients.iter_mut() {
        let _ = client.ws.flush();
    }

    let mut index = 0;
    clients.retain(|client| {
        let keep = !gone[index];
        if !keep {
            debug!("relay"; "{} left {}", client.addr, client.session);
        }
        index += 1;
        keep
    });
}

/// Presence id and clock of an awareness message.
fn presence_of(text: &str) -> Option<(u64, u64)> {
    match serde_json::from_str(text).ok()? {
        WireMessage::Awareness { client, clock, .. } => Some((client, clock)),
        _ => None,
    }
}

fn is_would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io) if io.kind() == io::ErrorKind::WouldBlock)
}

// =============================================================================
// Helpers
// =============================================================================

/// Try binding to port, retry with incremented port if in use
fn try_bind_port(interface: &str, base_port: u16, max_retries: u16) -> Result<TcpListener> {
    let mut last_error = None;

    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        match TcpListener::bind((interface, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }

    Err(anyhow::anyhow!(
        "failed to bind relay on {} after {} attempts: {}",
        interface,
        max_retries,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
