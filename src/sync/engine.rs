//! SyncEngine: keeps one replica's `Store` convergent with its session.
//!
//! # Lifecycle
//!
//! ```text
//! open ──► replay cache ──► seed doc ──► spawn actor ──► ... ──► close
//!                                          │
//!        Store transitions ──────────────► │ publish / presence
//!        TransportEvents ────────────────► │ absorb / status / handshake
//!        resync + presence timers ───────► │
//! ```
//!
//! The actor owns the document, the presence state and the cache writer.
//! Everything reaches it through channels, so the store subscriber never
//! blocks and the actor is the only writer of the document.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use uuid::Uuid;

use super::cache::{CacheWriter, DurableCache};
use super::doc::{LwwDoc, ReplicaId, ReplicatedDoc, Update};
use super::presence::Awareness;
use super::projection::{self, SyncPatch};
use super::transport::{ConnectionStatus, EventSender, Transport, TransportEvent, WireMessage};
use crate::state::{Action, Origin, Store, SubscriptionId, SyncData, Transition};
use crate::{debug, log};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Full resync period while connected.
    pub resync_interval: Duration,
    /// Peers silent for this long are dropped from presence.
    pub presence_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            presence_timeout: Duration::from_secs(30),
        }
    }
}

/// A running replica of one session.
pub struct SyncEngine {
    session: String,
    replica: ReplicaId,
    store: Arc<Store>,
    subscription: SubscriptionId,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Start replicating `store` for `session`.
    ///
    /// `connect` receives the channel the transport reports on and returns
    /// the connection. Must be called from within a tokio runtime.
    pub fn open(
        store: Arc<Store>,
        session: &str,
        options: SyncOptions,
        cache: Option<Box<dyn DurableCache>>,
        connect: impl FnOnce(EventSender) -> Arc<dyn Transport>,
    ) -> Self {
        let replica = Uuid::new_v4().as_u64_pair().0;
        let mut doc = LwwDoc::new(replica);

        let writer = cache.map(|cache| {
            replay_cache(cache.as_ref(), &mut doc, &store, session);
            CacheWriter::spawn(cache)
        });

        // Later transitions are diffed against this snapshot, so changes
        // committed before the subscription below are still published
        let published = store.state().sync.clone();

        // Local data the document has never seen, e.g. default layers
        let versions = doc.versions();
        let seed: Vec<_> = projection::publish_writes(&SyncData::default(), &published)
            .into_iter()
            .filter(|(key, _)| !versions.contains_key(key))
            .collect();
        let seeded = !doc.apply_local(seed).is_empty();

        let (transitions_tx, transitions) = mpsc::unbounded_channel();
        let subscription = store.subscribe(move |t: &Transition| {
            let _ = transitions_tx.send(t.clone());
        });

        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = connect(events_tx);

        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let actor = Actor {
            session: session.to_string(),
            replica,
            doc,
            awareness: Awareness::new(replica),
            published,
            store: Arc::clone(&store),
            transport,
            writer,
            status: status_tx,
            options,
            transitions,
        };
        if seeded {
            actor.persist();
        }
        let task = tokio::spawn(actor.run(events, shutdown_rx));

        log!("sync"; "joined session {}", session);
        Self {
            session: session.to_string(),
            replica,
            store,
            subscription,
            status,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Connection status, updated on every change.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Leave the session and release transport, document and cache.
    ///
    /// Once this returns no publish, absorb or presence callback runs again.
    pub async fn close(mut self) {
        self.shutdown_now();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        log!("sync"; "left session {}", self.session);
    }

    fn shutdown_now(&mut self) {
        self.store.unsubscribe(self.subscription);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        // The actor tears down on its own once signalled
        self.shutdown_now();
    }
}

fn replay_cache(cache: &dyn DurableCache, doc: &mut LwwDoc, store: &Store, session: &str) {
    match cache.load() {
        Ok(Some(state)) => {
            let changed = doc.apply_remote(&state);
            let patch = projection::absorb(&*doc, &changed);
            debug!("cache"; "replaying {} keys for {}", changed.len(), session);
            dispatch_patch(store, patch);
        }
        Ok(None) => {}
        Err(e) => log!("cache"; "ignoring unreadable cache for {}: {}", session, e),
    }
}

fn dispatch_patch(store: &Store, patch: SyncPatch) {
    let result = store.dispatch_with(|state| {
        let patch = patch.against(&state.sync);
        (!patch.is_empty()).then_some(Action::RemoteUpdate(patch))
    });
    if let Err(e) = result {
        log!("sync"; "cannot apply remote change: {}", e);
    }
}

// =============================================================================
// Actor
// =============================================================================

struct Actor {
    session: String,
    replica: ReplicaId,
    doc: LwwDoc,
    awareness: Awareness,
    /// Replicated state as last written to (or read from) the document.
    published: SyncData,
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    writer: Option<CacheWriter>,
    status: watch::Sender<ConnectionStatus>,
    options: SyncOptions,
    /// Committed store transitions, queued by the store subscriber.
    transitions: mpsc::UnboundedReceiver<Transition>,
}

impl Actor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut resync = interval(self.options.resync_interval);
        let mut renew = interval(self.options.presence_timeout / 2);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Some(transition) = self.transitions.recv() => self.on_transition(&transition),

                Some(event) = events.recv() => self.on_event(event, &mut resync),

                _ = resync.tick() => {
                    if self.connected() {
                        debug!("sync"; "periodic resync");
                        self.send(self.sync_step1());
                    }
                }

                _ = renew.tick() => self.renew_presence(),

                else => break,
            }
        }

        self.teardown().await;
    }

    fn connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    fn send(&self, msg: WireMessage) {
        let kind = msg.kind();
        if let Err(e) = self.transport.send(msg) {
            debug!("sync"; "dropped {}: {}", kind, e);
        }
    }

    fn sync_step1(&self) -> WireMessage {
        WireMessage::SyncStep1 {
            from: self.replica,
            versions: self.doc.versions(),
        }
    }

    fn persist(&self) {
        if let Some(writer) = &self.writer {
            writer.write(self.doc.encode_state());
        }
    }

    // =========================================================================
    // Publish
    // =========================================================================

    fn on_transition(&mut self, transition: &Transition) {
        let next = &transition.next;
        match transition.origin {
            Origin::Local => {
                let writes = projection::publish_writes(&self.published, &next.sync);
                self.published = next.sync.clone();
                if !writes.is_empty() {
                    let update = self.doc.apply_local(writes);
                    if !update.is_empty() {
                        debug!("sync"; "publishing {} keys ({})", update.len(), transition.action);
                        self.persist();
                        self.send(WireMessage::Update { update });
                    }
                }
            }
            // Already in the document
            Origin::Remote => self.published = next.sync.clone(),
        }

        if transition.prev.active != next.active
            && let Some(msg) = self.awareness.set_local(next.presence())
        {
            self.send(msg);
        }
    }

    // =========================================================================
    // Absorb
    // =========================================================================

    fn on_event(&mut self, event: TransportEvent, resync: &mut Interval) {
        match event {
            TransportEvent::Status(status) => self.on_status(status, resync),
            TransportEvent::Message(msg) => self.on_message(msg),
        }
    }

    fn on_status(&mut self, status: ConnectionStatus, resync: &mut Interval) {
        if *self.status.borrow() == status {
            return;
        }
        debug!("ws"; "{}: {:?}", self.session, status);
        if let Err(e) = self.store.dispatch(Action::WsReportStatus(status)) {
            log!("sync"; "cannot report status: {}", e);
        }
        self.status.send_replace(status);

        if status == ConnectionStatus::Connected {
            log!("sync"; "connected to session {}", self.session);
            resync.reset();
            self.send(self.sync_step1());
            self.send(self.awareness.encode_local());
        }
    }

    fn on_message(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::SyncStep1 { from, versions } => {
                if from == self.replica {
                    return;
                }
                self.send(WireMessage::SyncStep2 {
                    from: self.replica,
                    to: from,
                    update: self.doc.diff_since(&versions),
                    versions: self.doc.versions(),
                });
            }
            WireMessage::SyncStep2 {
                from,
                to,
                update,
                versions,
            } => {
                if from == self.replica {
                    return;
                }
                self.absorb(&update);
                if to == self.replica {
                    let missing = self.doc.diff_since(&versions);
                    if !missing.is_empty() {
                        self.send(WireMessage::Update { update: missing });
                    }
                }
            }
            WireMessage::Update { update } => self.absorb(&update),
            WireMessage::Awareness {
                client,
                clock,
                state,
            } => {
                if self
                    .awareness
                    .apply_remote(client, clock, state, Instant::now())
                {
                    self.report_peers();
                }
            }
        }
    }

    /// Merge a remote update into the document and the store.
    ///
    /// Runs inside the store queue. Every committed transition has been
    /// queued by then, so local edits not yet published go into the document
    /// first and the merge sees them. The store then receives exactly what
    /// the document holds for the changed keys.
    fn absorb(&mut self, update: &Update) {
        let store = Arc::clone(&self.store);
        let result = store.dispatch_with(|state| {
            self.drain_transitions();
            let changed = self.doc.apply_remote(update);
            if changed.is_empty() {
                return None;
            }
            debug!("sync"; "absorbed {} changed keys", changed.len());
            self.persist();
            let patch = projection::absorb(&self.doc, &changed).against(&state.sync);
            (!patch.is_empty()).then_some(Action::RemoteUpdate(patch))
        });
        if let Err(e) = result {
            log!("sync"; "cannot apply remote change: {}", e);
        }
    }

    fn drain_transitions(&mut self) {
        while let Ok(transition) = self.transitions.try_recv() {
            self.on_transition(&transition);
        }
    }

    // =========================================================================
    // Presence
    // =========================================================================

    fn renew_presence(&mut self) {
        if self.connected() {
            self.send(self.awareness.encode_local());
        }
        if self
            .awareness
            .expire(Instant::now(), self.options.presence_timeout)
        {
            self.report_peers();
        }
    }

    fn report_peers(&self) {
        if let Err(e) = self
            .store
            .dispatch(Action::RemoteAwareUpdate(self.awareness.peers()))
        {
            log!("sync"; "cannot report peers: {}", e);
        }
    }

    async fn teardown(mut self) {
        if self.connected() {
            let leave = self.awareness.leave();
            self.send(leave);
        }
        let transport = self.transport;
        let mut writer = self.writer.take();
        let closed = tokio::task::spawn_blocking(move || {
            transport.close();
            if let Some(writer) = writer.as_mut() {
                writer.close();
            }
        })
        .await;
        if let Err(e) = closed {
            log!("sync"; "teardown failed: {}", e);
        }
    }
}

fn interval(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
