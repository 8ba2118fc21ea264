//! WebSocket relay hub with one room per document.
//!
//! ```text
//! Session A ──┐                                    ┌──► Session B
//!              ├── Room (doc_id) ── hub Replica ───┤
//! Session C ──┘        │                           └──► Session C
//!                      ├── BroadcastGroup (fan-out, echo filtered)
//!                      ├── presence (latest awareness per user)
//!                      └── SnapshotStore (checkpoint / room close)
//! ```
//!
//! The hub keeps its own replica of every open document. It answers
//! `SyncStep1` from that replica, integrates incoming operations, and relays
//! only the ones it had not seen. Operations it must buffer are relayed too.
//! Whenever its replica is left with buffered operations or counter gaps,
//! the hub pulls the missing history from the sender with its own
//! `SyncStep1`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quire_core::{IntegrateOutcome, Operation, Replica, ReplicaConfig, ReplicaId, Snapshot, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage, SyncPayload};
use crate::storage::{RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};

/// Peer id the hub uses for its own handshake messages.
pub const HUB_PEER_ID: Uuid = Uuid::nil();

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames a slow peer may lag before it is disconnected
    pub broadcast_capacity: usize,
    /// Snapshot dirty rooms this often (requires storage)
    pub checkpoint_interval: Option<Duration>,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Bounds for each room's causal buffer
    pub replica: ReplicaConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            checkpoint_interval: Some(Duration::from_secs(30)),
            storage_path: None,
            replica: ReplicaConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
            checkpoint_interval: None,
            storage_path: None,
            replica: ReplicaConfig::for_testing(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub relayed_operations: u64,
    pub rejected_operations: u64,
    pub persisted_snapshots: u64,
}

struct DocumentRoom {
    replica: Replica,
    broadcast: Arc<BroadcastGroup>,
    /// Latest awareness frame per user, replayed to peers after handshake
    presence: HashMap<UserId, (u64, SyncMessage)>,
    /// Changed since the last snapshot
    dirty: bool,
    /// Bumped whenever new operations land
    revision: u64,
}

impl DocumentRoom {
    fn new(replica: Replica, config: &ServerConfig) -> Self {
        Self {
            replica,
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity, config.max_peers_per_room)),
            presence: HashMap::new(),
            dirty: false,
            revision: 0,
        }
    }
}

/// What one connection has bound itself to.
#[derive(Default)]
struct PeerConnection {
    peer: Option<PeerInfo>,
    doc_id: Option<Uuid>,
    /// Users this connection announced presence for
    announced: HashSet<UserId>,
}

impl PeerConnection {
    fn peer_id(&self) -> Option<Uuid> {
        self.peer.as_ref().map(|p| p.peer_id)
    }
}

enum Flow {
    Reply(Vec<SyncMessage>),
    Disconnect,
}

/// The relay hub. Cheap to clone; clones share rooms, stats and store.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<Uuid, DocumentRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<dyn SnapshotStore>>,
    /// Held while snapshots are written and while rooms are loaded from the
    /// store, so a room is never evicted mid-restore.
    persist_lock: Arc<Mutex<()>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Option<Arc<dyn SnapshotStore>> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(RocksSnapshotStore::open(store_config)?))
            }
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::build(ServerConfig::default(), None)
    }

    /// Use an already opened store (ignores `storage_path`).
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Load every persisted document into a room.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let doc_ids = store.list_documents()?;
        let mut recovered = 0;
        for doc_id in &doc_ids {
            if self.rooms.read().await.contains_key(doc_id) {
                continue;
            }
            let Some(replica) = self.restore_replica(*doc_id) else {
                continue;
            };
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(*doc_id)
                .or_insert_with(|| DocumentRoom::new(replica, &self.config));
            recovered += 1;
        }

        let room_count = self.rooms.read().await.len();
        self.stats.write().await.active_rooms = room_count;
        log::info!("Recovery complete: {recovered}/{} documents restored", doc_ids.len());
        Ok(recovered)
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync hub listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        if let (Some(interval), Some(_)) = (self.config.checkpoint_interval, &self.store) {
            let server = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    server.checkpoint().await;
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Snapshot every room changed since its last snapshot. Returns how many
    /// were saved.
    pub async fn checkpoint(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let _persisting = self.persist_lock.lock().await;
        let dirty: Vec<_> = {
            let mut rooms = self.rooms.write().await;
            rooms
                .iter_mut()
                .filter(|(_, room)| room.dirty)
                .map(|(doc_id, room)| {
                    room.dirty = false;
                    (*doc_id, room.replica.snapshot())
                })
                .collect()
        };

        let mut saved = 0;
        for (doc_id, snapshot) in dirty {
            match persist(store.clone(), doc_id, snapshot).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    log::error!("Checkpoint of doc {doc_id} failed: {e}");
                    if let Some(room) = self.rooms.write().await.get_mut(&doc_id) {
                        room.dirty = true;
                    }
                }
            }
        }

        if saved > 0 {
            self.stats.write().await.persisted_snapshots += saved as u64;
            log::debug!("Checkpointed {saved} documents");
        }
        saved
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<dyn SnapshotStore>> {
        self.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Visible text of an open room.
    pub async fn room_text(&self, doc_id: Uuid) -> Option<String> {
        self.rooms.read().await.get(&doc_id).map(|room| room.replica.text())
    }

    // ─── Rooms ──────────────────────────────────────────────────

    fn restore_replica(&self, doc_id: Uuid) -> Option<Replica> {
        let store = self.store.as_ref()?;
        match store.load_snapshot(doc_id) {
            Ok(Some(snapshot)) => {
                match Replica::from_snapshot(ReplicaId::random(), &snapshot, self.config.replica.clone()) {
                    Ok(replica) => {
                        log::info!("Loaded persisted snapshot for doc {doc_id}");
                        Some(replica)
                    }
                    Err(e) => {
                        log::error!("Stored snapshot for doc {doc_id} is unusable: {e}");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("Failed to load snapshot for doc {doc_id}: {e}");
                None
            }
        }
    }

    /// Register `info` with the room's broadcast group while holding the
    /// rooms lock, so eviction never sees a half-joined peer. With
    /// `restored: None` only an open room is joined; otherwise a missing
    /// room is created from the restored replica, or empty.
    async fn add_to_room(
        &self,
        doc_id: Uuid,
        info: &PeerInfo,
        restored: Option<Option<Replica>>,
    ) -> Option<(Option<broadcast::Receiver<Frame>>, usize)> {
        let mut rooms = self.rooms.write().await;
        let room = match restored {
            Some(restored) => rooms.entry(doc_id).or_insert_with(|| {
                let replica = restored.unwrap_or_else(|| Replica::new(self.config.replica.clone()));
                DocumentRoom::new(replica, &self.config)
            }),
            None => rooms.get_mut(&doc_id)?,
        };
        let rx = room.broadcast.add_peer(info.clone()).await;
        Some((rx, rooms.len()))
    }

    // ─── Connections ────────────────────────────────────────────

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = PeerConnection::default();
        let result = self.serve_peer(&mut ws_sender, &mut ws_receiver, &mut conn, addr).await;
        self.disconnect(&conn).await;

        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn serve_peer(
        &self,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        conn: &mut PeerConnection,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            match self.dispatch(sync_msg, conn, &mut broadcast_rx).await? {
                                Flow::Reply(replies) => {
                                    for reply in replies {
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                                Flow::Disconnect => {
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                frame = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok((origin, data)) => {
                            if Some(origin) == conn.peer_id() {
                                continue;
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Lost frames are unrecoverable on this connection;
                            // the session resyncs on reconnect.
                            log::warn!("Peer {:?} lagged by {n} frames, disconnecting", conn.peer_id());
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        msg: SyncMessage,
        conn: &mut PeerConnection,
        broadcast_rx: &mut Option<broadcast::Receiver<Frame>>,
    ) -> Result<Flow, ProtocolError> {
        if let SyncPayload::Join { info } = msg.payload {
            return Ok(self.join(msg.doc_id, info, conn, broadcast_rx).await);
        }

        let (Some(doc_id), Some(peer_id)) = (conn.doc_id, conn.peer_id()) else {
            log::warn!("{:?} before join, ignoring", msg.msg_type());
            return Ok(Flow::Reply(Vec::new()));
        };
        if msg.doc_id != doc_id {
            log::warn!("Peer {peer_id} sent {:?} for doc {} while bound to {doc_id}", msg.msg_type(), msg.doc_id);
            return Ok(Flow::Reply(Vec::new()));
        }

        let replies = match msg.payload {
            SyncPayload::SyncStep1 { state_vector } => {
                let rooms = self.rooms.read().await;
                match rooms.get(&doc_id) {
                    Some(room) => {
                        let missing = room.replica.compute_delta(&state_vector);
                        log::debug!("Handshake with {peer_id}: sending {} operations", missing.len());
                        let mut out = vec![SyncMessage::sync_step2(
                            HUB_PEER_ID,
                            doc_id,
                            room.replica.state_vector().clone(),
                            missing,
                        )];
                        out.extend(
                            room.presence
                                .iter()
                                .filter(|(user, _)| !conn.announced.contains(*user))
                                .map(|(_, (_, frame))| frame.clone()),
                        );
                        out
                    }
                    None => {
                        log::warn!("Doc {doc_id} closed under peer {peer_id}, disconnecting");
                        return Ok(Flow::Disconnect);
                    }
                }
            }
            SyncPayload::SyncStep2 { operations, .. } | SyncPayload::Delta { operations, .. } => {
                match self.integrate(doc_id, peer_id, operations).await? {
                    Some(out) => out,
                    None => {
                        log::warn!("Doc {doc_id} closed under peer {peer_id}, disconnecting");
                        return Ok(Flow::Disconnect);
                    }
                }
            }
            SyncPayload::Awareness { user_id, state, timestamp } => {
                let frame = SyncMessage::new(msg.peer_id, doc_id, SyncPayload::Awareness { user_id, state, timestamp });
                let broadcast = {
                    let mut rooms = self.rooms.write().await;
                    rooms.get_mut(&doc_id).map(|room| {
                        let newer = room.presence.get(&user_id).map_or(true, |(seen, _)| timestamp > *seen);
                        if newer {
                            room.presence.insert(user_id, (timestamp, frame.clone()));
                        }
                        room.broadcast.clone()
                    })
                };
                conn.announced.insert(user_id);
                log::trace!("Presence update from {user_id} in doc {doc_id}");
                if let Some(broadcast) = broadcast {
                    broadcast.relay(&frame)?;
                }
                Vec::new()
            }
            SyncPayload::AwarenessLeave { user_id } => {
                let frame = SyncMessage::new(msg.peer_id, doc_id, SyncPayload::AwarenessLeave { user_id });
                let broadcast = {
                    let mut rooms = self.rooms.write().await;
                    rooms.get_mut(&doc_id).map(|room| {
                        room.presence.remove(&user_id);
                        room.broadcast.clone()
                    })
                };
                conn.announced.remove(&user_id);
                log::info!("Presence: {user_id} left doc {doc_id}");
                if let Some(broadcast) = broadcast {
                    broadcast.relay(&frame)?;
                }
                Vec::new()
            }
            SyncPayload::Ping => vec![SyncMessage::pong(HUB_PEER_ID, doc_id)],
            SyncPayload::Pong => Vec::new(),
            SyncPayload::Join { .. } => Vec::new(),
        };
        Ok(Flow::Reply(replies))
    }

    async fn join(
        &self,
        doc_id: Uuid,
        info: PeerInfo,
        conn: &mut PeerConnection,
        broadcast_rx: &mut Option<broadcast::Receiver<Frame>>,
    ) -> Flow {
        if let Some(bound) = conn.doc_id {
            log::warn!("Peer {} already joined doc {bound}, ignoring second join", info.peer_id);
            return Flow::Reply(Vec::new());
        }

        let joined = match self.add_to_room(doc_id, &info, None).await {
            Some(joined) => joined,
            None => {
                let _persisting = self.persist_lock.lock().await;
                let restored = self.restore_replica(doc_id);
                match self.add_to_room(doc_id, &info, Some(restored)).await {
                    Some(joined) => joined,
                    None => return Flow::Disconnect,
                }
            }
        };
        let (rx, room_count) = joined;
        self.stats.write().await.active_rooms = room_count;
        match rx {
            Some(rx) => *broadcast_rx = Some(rx),
            None => return Flow::Disconnect,
        }

        log::info!("Peer {} ({}) joined doc {doc_id}", info.name, info.peer_id);
        conn.peer = Some(info);
        conn.doc_id = Some(doc_id);
        Flow::Reply(Vec::new())
    }

    /// Integrate into the room replica and relay what was new. Returns a
    /// `SyncStep1` pull when the replica is left with a gap the sender may
    /// fill, and `None` when the room no longer exists.
    async fn integrate(
        &self,
        doc_id: Uuid,
        peer_id: Uuid,
        operations: Vec<Operation>,
    ) -> Result<Option<Vec<SyncMessage>>, ProtocolError> {
        let (broadcast, relay, rejected, digest, pull) = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(&doc_id) else {
                return Ok(None);
            };
            if operations.is_empty() {
                return Ok(Some(Vec::new()));
            }

            let now = Instant::now();
            let mut relay = Vec::new();
            let mut rejected = 0u64;
            let mut buffered = false;
            for operation in operations {
                let id = operation.id();
                match room.replica.integrate(operation.clone(), now) {
                    Ok(IntegrateOutcome::Applied { .. }) => relay.push(operation),
                    Ok(IntegrateOutcome::Buffered { .. }) => {
                        buffered = true;
                        relay.push(operation);
                    }
                    Ok(IntegrateOutcome::Duplicate) => {}
                    Err(e) => {
                        log::warn!("Doc {doc_id}: rejected {id} from {peer_id}: {e}");
                        rejected += 1;
                    }
                }
            }
            if let Err(e) = room.replica.buffer_health(now) {
                log::warn!("Doc {doc_id}: {e}; dropping hub buffer");
                room.replica.clear_buffer();
                buffered = true;
            }
            if !relay.is_empty() {
                room.dirty = true;
                room.revision += 1;
            }

            // A lost frame leaves a counter gap with nothing buffered. Only
            // batches that brought new ops trigger that pull.
            let gap = !relay.is_empty() && room.replica.has_gaps();
            if gap && !buffered {
                log::debug!("Doc {doc_id}: counter gap after ops from {peer_id}, pulling");
            }
            let pull = (buffered || gap).then(|| room.replica.state_vector().clone());
            (room.broadcast.clone(), relay, rejected, room.replica.state_vector().digest(), pull)
        };

        {
            let mut s = self.stats.write().await;
            s.relayed_operations += relay.len() as u64;
            s.rejected_operations += rejected;
        }

        if !relay.is_empty() {
            broadcast.relay(&SyncMessage::delta(peer_id, doc_id, relay, digest))?;
        }

        Ok(Some(
            pull.map(|sv| vec![SyncMessage::sync_step1(HUB_PEER_ID, doc_id, sv)])
                .unwrap_or_default(),
        ))
    }

    /// Leave the room: announce departures, and persist and evict the room
    /// once the last peer is gone.
    async fn disconnect(&self, conn: &PeerConnection) {
        let (Some(peer_id), Some(doc_id)) = (conn.peer_id(), conn.doc_id) else {
            return;
        };

        let empty = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(&doc_id) else {
                return;
            };

            room.broadcast.remove_peer(&peer_id).await;
            for user_id in &conn.announced {
                room.presence.remove(user_id);
                let leave = SyncMessage::new(peer_id, doc_id, SyncPayload::AwarenessLeave { user_id: *user_id });
                if let Err(e) = room.broadcast.relay(&leave) {
                    log::warn!("Failed to announce departure of {user_id}: {e}");
                }
            }
            log::info!("Peer {peer_id} left doc {doc_id}");
            room.broadcast.peer_count().await == 0
        };

        if empty {
            self.close_room(doc_id).await;
        }
    }

    /// Persist an idle room, then evict it unless someone joined or edited
    /// while the snapshot was written. In-memory hubs keep empty rooms so
    /// the document survives.
    async fn close_room(&self, doc_id: Uuid) {
        let Some(store) = self.store.clone() else {
            return;
        };

        let _persisting = self.persist_lock.lock().await;
        let (revision, snapshot) = {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(&doc_id) else {
                return;
            };
            if room.broadcast.peer_count().await > 0 {
                return;
            }
            (room.revision, room.replica.snapshot())
        };

        if let Err(e) = persist(store, doc_id, snapshot).await {
            log::error!("Failed to persist doc {doc_id} on room close: {e}");
            if let Some(room) = self.rooms.write().await.get_mut(&doc_id) {
                room.dirty = true;
            }
            return;
        }

        let mut rooms = self.rooms.write().await;
        let idle = match rooms.get_mut(&doc_id) {
            Some(room) if room.revision == revision => {
                room.dirty = false;
                room.broadcast.peer_count().await == 0
            }
            _ => false,
        };
        if idle {
            rooms.remove(&doc_id);
            log::info!("Persisted doc {doc_id} and closed its room");
        } else {
            log::debug!("Doc {doc_id} became active while persisting, keeping its room");
        }
        let room_count = rooms.len();
        drop(rooms);

        let mut s = self.stats.write().await;
        s.persisted_snapshots += 1;
        s.active_rooms = room_count;
    }
}

/// Write a snapshot on the blocking pool.
async fn persist(store: Arc<dyn SnapshotStore>, doc_id: Uuid, snapshot: Snapshot) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || store.save_snapshot(doc_id, &snapshot))
        .await
        .map_err(|e| StoreError::DatabaseError(format!("snapshot task failed: {e}")))?
}
