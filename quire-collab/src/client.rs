//! WebSocket client driving a [`SyncSession`].
//!
//! Provides:
//! - Connection lifecycle with exponential-backoff reconnect
//! - Local edits applied immediately, shipped live or on next handshake
//! - Awareness updates and heartbeat ticks
//! - An event stream for the UI ([`SyncEvent`])
//!
//! ```text
//!            ┌──────────── driver task ─────────────┐
//! edits ───► │ session (Mutex) ◄── reader / ticker   │
//!            │      │                               │
//!            │      └──► outgoing mpsc ──► writer ──┼──► hub
//!            └──────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use quire_core::{AwarenessState, AwarenessUpdate, Snapshot};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::notify::{ChannelObserver, SyncEvent};
use crate::protocol::{PeerInfo, SyncMessage, SyncPayload};
use crate::session::{SessionConfig, SessionError, SyncSession, SyncState};

/// Transport-level state, separate from the session's sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; editing continues offline.
    Degraded,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up
    pub max_retries: u32,
    pub connect_timeout: Duration,
    /// How often the session gets `tick()` (heartbeat, expiry, gaps)
    pub tick_interval: Duration,
    pub outgoing_capacity: usize,
    pub event_capacity: usize,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            max_retries: 10,
            connect_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(500),
            outgoing_capacity: 256,
            event_capacity: 256,
            session: SessionConfig::default(),
        }
    }

    /// Fast retries and short timeouts.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            max_retries: 3,
            connect_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(20),
            outgoing_capacity: 256,
            event_capacity: 1024,
            session: SessionConfig::for_testing(),
        }
    }
}

struct Shared {
    session: Mutex<SyncSession>,
    connection: RwLock<ConnectionState>,
    /// Sender into the current connection's writer task
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// An outgoing delta was dropped; re-request hub state on the next tick
    resync_needed: AtomicBool,
}

impl Shared {
    async fn set_connection(&self, state: ConnectionState) {
        *self.connection.write().await = state;
    }

    async fn outgoing(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outgoing.lock().await.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    Lost,
    Shutdown,
}

/// The sync client.
pub struct SyncClient {
    peer_id: Uuid,
    doc_id: Uuid,
    shared: Arc<Shared>,
    config: ClientConfig,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    shutdown_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Create a client for an empty document. Call [`start`](Self::start)
    /// to connect.
    pub fn new(peer_info: PeerInfo, doc_id: Uuid, config: ClientConfig) -> Self {
        let session = SyncSession::new(doc_id, peer_info, config.session.clone());
        Self::with_session(session, config)
    }

    /// Resume from a locally saved snapshot.
    pub fn from_snapshot(
        peer_info: PeerInfo,
        doc_id: Uuid,
        snapshot: &Snapshot,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        let session = SyncSession::from_snapshot(doc_id, peer_info, snapshot, config.session.clone())?;
        Ok(Self::with_session(session, config))
    }

    fn with_session(mut session: SyncSession, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        session.add_observer(Box::new(ChannelObserver::new(event_tx.clone())));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            peer_id: session.peer_info().peer_id,
            doc_id: session.doc_id(),
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                connection: RwLock::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                resync_needed: AtomicBool::new(false),
            }),
            config,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            driver: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection driver. Calling it again after `Degraded`
    /// starts a fresh round of reconnect attempts.
    pub fn start(&mut self) {
        if let Some(driver) = &self.driver {
            if !driver.is_finished() {
                return;
            }
        }
        self.shutdown_tx.send_replace(false);
        let shared = self.shared.clone();
        let config = self.config.clone();
        let events = self.event_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.driver = Some(tokio::spawn(drive(shared, config, events, shutdown)));
    }

    /// Leave the document: send the farewell if connected, stop the driver,
    /// drop anything still queued.
    pub async fn close(&mut self) {
        let farewell = self.shared.session.lock().await.close();
        if let Some(tx) = self.shared.outgoing().await {
            try_enqueue(&tx, farewell);
        }

        self.shutdown_tx.send_replace(true);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        self.shared.set_connection(ConnectionState::Closed).await;
    }

    // ─── Local edits ────────────────────────────────────────────

    pub async fn insert(&self, position: usize, content: &str) -> Result<(), SessionError> {
        let result = self.shared.session.lock().await.insert(position, content);
        self.ship(result).await
    }

    pub async fn delete(&self, range: std::ops::Range<usize>) -> Result<(), SessionError> {
        let result = self.shared.session.lock().await.delete(range);
        self.ship(result).await
    }

    pub async fn replace_all(&self, content: &str) -> Result<(), SessionError> {
        let result = self.shared.session.lock().await.replace_all(content);
        self.ship(result).await
    }

    pub async fn update_awareness(&self, update: AwarenessUpdate) -> Result<(), SessionError> {
        let result = self.shared.session.lock().await.update_awareness(update, Instant::now());
        self.ship(result).await
    }

    /// Continue under a new replica identity after `CounterOverflow`.
    pub async fn renew_replica(&self) -> Result<(), SessionError> {
        let result = self.shared.session.lock().await.renew_replica();
        self.ship(result).await
    }

    async fn ship(&self, result: Result<Vec<SyncMessage>, SessionError>) -> Result<(), SessionError> {
        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                if matches!(e, SessionError::CounterOverflow { .. }) {
                    log::error!("{e}");
                    match self.event_tx.try_send(SyncEvent::Error(e.clone())) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::warn!("Event queue full, UI not told about: {e}");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => log::trace!("Event receiver gone"),
                    }
                }
                return Err(e);
            }
        };
        if messages.is_empty() {
            return Ok(());
        }
        if let Some(tx) = self.shared.outgoing().await {
            if try_enqueue(&tx, messages) {
                self.shared.resync_needed.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────

    pub async fn text(&self) -> String {
        self.shared.session.lock().await.text()
    }

    pub async fn sync_state(&self) -> SyncState {
        self.shared.session.lock().await.state()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.read().await
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.shared.session.lock().await.snapshot()
    }

    pub async fn remote_users(&self) -> usize {
        self.shared.session.lock().await.awareness().remote_count()
    }

    /// Presence of one remote user, if currently known.
    pub async fn remote_user(&self, user_id: Uuid) -> Option<AwarenessState> {
        self.shared.session.lock().await.awareness().get(&user_id).cloned()
    }

    /// Local user first, then remote users.
    pub async fn active_users(&self) -> Vec<AwarenessState> {
        self.shared.session.lock().await.awareness().active_users()
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

// ─── Driver ─────────────────────────────────────────────────────

async fn drive(
    shared: Arc<Shared>,
    config: ClientConfig,
    events: mpsc::Sender<SyncEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    let mut backoff = config.initial_backoff;

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared
            .set_connection(if failures == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            })
            .await;

        let attempt =
            tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(config.server_url.as_str())).await;
        match attempt {
            Ok(Ok((ws, _))) => {
                log::info!("Connected to {}", config.server_url);
                failures = 0;
                backoff = config.initial_backoff;

                let end = run_connection(ws, &shared, &config, &mut shutdown).await;
                shared.session.lock().await.on_disconnected();
                shared.set_connection(ConnectionState::Disconnected).await;
                if end == ConnectionEnd::Shutdown {
                    break;
                }
                log::warn!("Connection to {} lost", config.server_url);
            }
            Ok(Err(e)) => log::warn!("Connect to {} failed: {e}", config.server_url),
            Err(_) => log::warn!("Connect to {} timed out", config.server_url),
        }

        failures += 1;
        if failures > config.max_retries {
            log::error!(
                "Giving up on {} after {failures} attempts; continuing offline",
                config.server_url
            );
            shared.set_connection(ConnectionState::Degraded).await;
            if events.send(SyncEvent::Degraded { attempts: failures }).await.is_err() {
                log::trace!("Event receiver gone");
            }
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

async fn run_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shared: &Shared,
    config: &ClientConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut ws_writer, mut ws_reader) = ws.split();

    // Writer task: forward outgoing channel to WebSocket
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.outgoing_capacity);
    let writer = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    *shared.outgoing.lock().await = Some(out_tx.clone());
    shared.resync_needed.store(false, Ordering::Release);
    shared.set_connection(ConnectionState::Connected).await;

    let hello = shared.session.lock().await.on_connected(Instant::now());
    enqueue(&out_tx, hello).await;

    let mut ticker = tokio::time::interval(config.tick_interval);
    let end = loop {
        tokio::select! {
            frame = ws_reader.next() => match frame {
                Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                    Ok(msg) => {
                        let replies = shared.session.lock().await.handle(msg, Instant::now());
                        enqueue(&out_tx, replies).await;
                    }
                    Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break ConnectionEnd::Lost,
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {e}");
                    break ConnectionEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
            _ = ticker.tick() => {
                let messages = {
                    let mut session = shared.session.lock().await;
                    let mut messages = session.tick(Instant::now());
                    if shared.resync_needed.swap(false, Ordering::AcqRel) {
                        messages.extend(session.request_resync());
                    }
                    messages
                };
                enqueue(&out_tx, messages).await;
            }
            _ = shutdown.changed() => break ConnectionEnd::Shutdown,
        }
    };

    *shared.outgoing.lock().await = None;
    drop(out_tx);
    match end {
        // Let the writer flush the farewell, but don't hang on a dead socket.
        ConnectionEnd::Shutdown => {
            let _ = tokio::time::timeout(Duration::from_millis(500), writer).await;
        }
        ConnectionEnd::Lost => writer.abort(),
    }
    end
}

/// Local edits never wait on the socket. Returns true if a frame carrying
/// operations was dropped on a full queue; the caller must re-request hub
/// state so the operations get shipped again.
fn try_enqueue(tx: &mpsc::Sender<Vec<u8>>, messages: Vec<SyncMessage>) -> bool {
    let mut dropped_ops = false;
    for msg in messages {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", msg.msg_type());
                continue;
            }
        };
        match tx.try_send(bytes) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outgoing queue full, dropping {:?}", msg.msg_type());
                dropped_ops |= matches!(msg.payload, SyncPayload::Delta { .. } | SyncPayload::SyncStep2 { .. });
            }
            // Connection gone; the next handshake ships everything.
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
    dropped_ops
}

async fn enqueue(tx: &mpsc::Sender<Vec<u8>>, messages: Vec<SyncMessage>) {
    for msg in messages {
        match msg.encode() {
            Ok(bytes) => {
                if tx.send(bytes).await.is_err() {
                    log::debug!("Writer gone, dropping {:?}", msg.msg_type());
                    return;
                }
            }
            Err(e) => log::error!("Failed to encode {:?}: {e}", msg.msg_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_url() -> String {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.sync_state().await, SyncState::Connecting);
        assert_eq!(client.text().await, "");
    }

    #[tokio::test]
    async fn test_offline_edits_apply_locally() {
        let mut client = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        let mut events = client.take_event_rx().unwrap();

        client.insert(0, "offline").await.unwrap();
        client.delete(0..3).await.unwrap();
        assert_eq!(client.text().await, "line");

        match events.recv().await {
            Some(SyncEvent::DocumentChanged { text, .. }) => assert_eq!(text, "offline"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_bounds_edit_rejected() {
        let client = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        let result = client.insert(5, "x").await;
        assert!(matches!(result, Err(SessionError::Edit(_))));
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_degraded_after_max_retries() {
        let mut client = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        let mut events = client.take_event_rx().unwrap();
        client.start();

        let attempts = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(SyncEvent::Degraded { attempts }) => return attempts,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("client never degraded");

        assert_eq!(attempts, client.config().max_retries + 1);
        assert_eq!(client.connection_state().await, ConnectionState::Degraded);

        // Still editable offline.
        client.insert(0, "still here").await.unwrap();
        assert_eq!(client.text().await, "still here");
    }

    #[tokio::test]
    async fn test_close_without_start() {
        let mut client = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        client.close().await;
        assert_eq!(client.connection_state().await, ConnectionState::Closed);
        assert_eq!(client.sync_state().await, SyncState::Closed);
        assert!(matches!(client.insert(0, "x").await, Err(SessionError::Closed)));
    }

    fn delta_with_op() -> SyncMessage {
        let mut replica = quire_core::Replica::new(quire_core::ReplicaConfig::default());
        let ops = replica.insert(0, "x").unwrap().operations;
        SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), ops, 0)
    }

    #[test]
    fn test_full_queue_reports_dropped_delta() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(!try_enqueue(&tx, vec![delta_with_op()]));
        assert!(try_enqueue(&tx, vec![delta_with_op()]));

        // Presence is re-sent by heartbeats; losing it needs no resync.
        assert!(!try_enqueue(&tx, vec![SyncMessage::ping(Uuid::new_v4(), Uuid::new_v4())]));
    }

    #[test]
    fn test_closed_queue_does_not_flag_resync() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!try_enqueue(&tx, vec![delta_with_op()]));
    }

    #[tokio::test]
    async fn test_dropped_delta_flags_resync() {
        let doc = Uuid::new_v4();
        let client = SyncClient::new(PeerInfo::new("Alice"), doc, ClientConfig::for_testing(dead_url()));
        {
            let mut session = client.shared.session.lock().await;
            let now = Instant::now();
            session.on_connected(now);
            let step2 = SyncMessage::sync_step2(crate::server::HUB_PEER_ID, doc, quire_core::StateVector::new(), Vec::new());
            session.handle(step2, now);
            assert_eq!(session.state(), SyncState::Synced);
        }
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Vec::new()).unwrap();
        *client.shared.outgoing.lock().await = Some(tx);

        client.insert(0, "x").await.unwrap();
        assert!(client.shared.resync_needed.load(Ordering::Acquire));

        let pull = client.shared.session.lock().await.request_resync();
        assert!(matches!(pull[0].payload, SyncPayload::SyncStep1 { .. }));
    }

    #[tokio::test]
    async fn test_from_snapshot() {
        let source = SyncClient::new(PeerInfo::new("Alice"), Uuid::new_v4(), ClientConfig::for_testing(dead_url()));
        source.insert(0, "saved locally").await.unwrap();
        let snapshot = source.snapshot().await;

        let restored = SyncClient::from_snapshot(
            PeerInfo::new("Alice"),
            Uuid::new_v4(),
            &snapshot,
            ClientConfig::for_testing(dead_url()),
        )
        .unwrap();
        assert_eq!(restored.text().await, "saved locally");
    }
}
