//! Sans-IO sync session: one replica of one document talking to one hub.
//!
//! The session owns the replica, the awareness table and the observers.
//! It never touches the network: every entry point returns the messages
//! the transport must send, so the same state machine runs under the
//! WebSocket client, in tests, and in benches.
//!
//! ```text
//!             on_connected                SyncStep2
//! Connecting ─────────────► Handshaking ─────────────► Synced
//!     ▲                        ▲   ▲                     │
//!     │                        │   └──── gap timeout ────┤
//!     │                        │         (Resyncing)     │
//!     │                        └──── on_connected ───────┤
//!     │                                                  │ on_disconnected
//!     └──────────────────────── Resyncing ◄──────────────┘
//!
//!  any state ── close() ──► Closed
//! ```
//!
//! Local edits are applied immediately. They go out as a `Delta` only while
//! `Synced`; otherwise the next handshake ships them, since the hub's
//! `SyncStep2` state vector tells us exactly what it lacks.

use std::ops::Range;
use std::time::{Duration, Instant};

use quire_core::{
    AwarenessConfig, AwarenessMessage, AwarenessTable, AwarenessUpdate, ChangeRange, CoreError, IntegrateOutcome,
    LocalEdit, Operation, Replica, ReplicaConfig, ReplicaId, Snapshot, StateVector,
};
use thiserror::Error;
use uuid::Uuid;

use crate::notify::{Observers, SessionObserver};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage, SyncPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No connection yet, or waiting to reconnect for the first time.
    Connecting,
    /// Connected; our SyncStep1 is out, waiting for SyncStep2.
    Handshaking,
    /// Handshake complete; live deltas flow both ways.
    Synced,
    /// Connection lost or gaps detected; a fresh handshake is needed.
    Resyncing,
    Closed,
}

/// Errors surfaced by a sync session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    #[error("{buffered} operations stuck on unknown dependencies (oldest for {oldest_age:?})")]
    UnknownDependencyTimeout { buffered: usize, oldest_age: Duration },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    Degraded { attempts: u32 },

    /// Fatal for the replica; see [`SyncSession::renew_replica`].
    #[error("Operation counter exhausted for replica {replica}")]
    CounterOverflow { replica: ReplicaId },

    #[error("Session closed")]
    Closed,

    /// Rejected local edit (out-of-bounds position, empty edit, bad snapshot).
    #[error("Edit rejected: {0}")]
    Edit(CoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<CoreError> for SessionError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::MalformedOperation(reason) => SessionError::MalformedOperation(reason),
            CoreError::UnknownDependencyTimeout { buffered, oldest_age } => {
                SessionError::UnknownDependencyTimeout { buffered, oldest_age }
            }
            CoreError::CounterOverflow { replica } => SessionError::CounterOverflow { replica },
            other => SessionError::Edit(other),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub replica: ReplicaConfig,
    pub awareness: AwarenessConfig,
    /// How long state-vector gaps may persist before a forced resync.
    pub gap_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replica: ReplicaConfig::default(),
            awareness: AwarenessConfig::default(),
            gap_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            replica: ReplicaConfig::for_testing(),
            awareness: AwarenessConfig::for_testing(),
            gap_timeout: Duration::from_millis(300),
        }
    }
}

pub struct SyncSession {
    doc_id: Uuid,
    info: PeerInfo,
    replica: Replica,
    awareness: AwarenessTable,
    state: SyncState,
    /// Hub state vector from the last SyncStep2 on this connection.
    peer_state_vector: Option<StateVector>,
    gaps_since: Option<Instant>,
    observers: Observers,
    config: SessionConfig,
}

impl SyncSession {
    /// Start a session on an empty document with a fresh replica identity.
    pub fn new(doc_id: Uuid, info: PeerInfo, config: SessionConfig) -> Self {
        let replica = Replica::new(config.replica.clone());
        Self::with_replica(doc_id, info, replica, config)
    }

    /// Start from a previously saved snapshot. The replica always gets a new
    /// identity; the snapshot's history is kept.
    pub fn from_snapshot(
        doc_id: Uuid,
        info: PeerInfo,
        snapshot: &Snapshot,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let replica = Replica::from_snapshot(ReplicaId::random(), snapshot, config.replica.clone())?;
        Ok(Self::with_replica(doc_id, info, replica, config))
    }

    fn with_replica(doc_id: Uuid, info: PeerInfo, replica: Replica, config: SessionConfig) -> Self {
        let mut awareness = AwarenessTable::new(info.peer_id, info.name.clone(), config.awareness.clone());
        awareness.set_local(
            AwarenessUpdate {
                display_color: Some(info.color.clone()),
                ..AwarenessUpdate::default()
            },
            Instant::now(),
        );
        log::debug!("Session for doc {} uses replica {}", doc_id, replica.id());

        Self {
            doc_id,
            info,
            replica,
            awareness,
            state: SyncState::Connecting,
            peer_state_vector: None,
            gaps_since: None,
            observers: Observers::new(),
            config,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn text(&self) -> String {
        self.replica.text()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn awareness(&self) -> &AwarenessTable {
        &self.awareness
    }

    /// Hub state vector from the last completed handshake on this connection.
    pub fn peer_state_vector(&self) -> Option<&StateVector> {
        self.peer_state_vector.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Snapshot {
        self.replica.snapshot()
    }

    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.register(observer);
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, SyncState::Handshaking | SyncState::Synced)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SyncState::Closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state == state {
            return;
        }
        log::debug!("Doc {} session {:?} -> {:?}", self.doc_id, self.state, state);
        self.state = state;
        self.observers.state_changed(state);
    }

    // ─── Connection lifecycle ───────────────────────────────────

    /// Transport connected: join the room, start the handshake and announce
    /// presence.
    pub fn on_connected(&mut self, now: Instant) -> Vec<SyncMessage> {
        if self.state == SyncState::Closed {
            return Vec::new();
        }
        self.peer_state_vector = None;
        self.gaps_since = None;
        self.set_state(SyncState::Handshaking);

        let presence = self.awareness.local_message(now);
        vec![
            SyncMessage::join(self.doc_id, self.info.clone()),
            self.sync_step1(),
            self.awareness_message(presence),
        ]
    }

    /// Transport lost. Local edits keep working; the next `on_connected`
    /// ships them.
    pub fn on_disconnected(&mut self) {
        if self.state == SyncState::Closed {
            return;
        }
        self.peer_state_vector = None;
        self.set_state(SyncState::Resyncing);
    }

    /// Leave the document. Drops buffered operations and remote presence.
    /// Returns the farewell to send if still connected.
    pub fn close(&mut self) -> Vec<SyncMessage> {
        if self.state == SyncState::Closed {
            return Vec::new();
        }
        let farewell = if self.is_connected() {
            vec![self.awareness_message(self.awareness.leave_message())]
        } else {
            Vec::new()
        };

        self.replica.clear_buffer();
        self.awareness.clear_remote();
        self.peer_state_vector = None;
        self.set_state(SyncState::Closed);
        farewell
    }

    /// Periodic upkeep: presence expiry, heartbeat and gap detection.
    pub fn tick(&mut self, now: Instant) -> Vec<SyncMessage> {
        if self.state == SyncState::Closed {
            return Vec::new();
        }
        let mut out = Vec::new();

        if !self.awareness.expire(now).is_empty() {
            self.notify_awareness();
        }
        if self.is_connected() {
            if let Some(heartbeat) = self.awareness.heartbeat_due(now) {
                out.push(self.awareness_message(heartbeat));
            }
        }
        out.extend(self.check_gaps(now));
        out
    }

    // ─── Incoming ───────────────────────────────────────────────

    /// Handle one message from the hub. Returns the replies.
    pub fn handle(&mut self, message: SyncMessage, now: Instant) -> Vec<SyncMessage> {
        if self.state == SyncState::Closed {
            log::trace!("Doc {} closed, ignoring {:?}", self.doc_id, message.msg_type());
            return Vec::new();
        }
        if message.doc_id != self.doc_id {
            log::warn!(
                "Ignoring {:?} for doc {} on session for doc {}",
                message.msg_type(),
                message.doc_id,
                self.doc_id
            );
            return Vec::new();
        }

        let mut out = Vec::new();
        match message.payload {
            SyncPayload::SyncStep1 { state_vector } => {
                let operations = self.replica.compute_delta(&state_vector);
                out.push(SyncMessage::sync_step2(
                    self.info.peer_id,
                    self.doc_id,
                    self.replica.state_vector().clone(),
                    operations,
                ));
            }
            SyncPayload::SyncStep2 { state_vector, operations } => {
                self.integrate_batch(operations, now);

                let missing = self.replica.compute_delta(&state_vector);
                if !missing.is_empty() {
                    log::debug!("Doc {}: shipping {} operations the hub lacks", self.doc_id, missing.len());
                    out.push(self.delta_message(missing));
                }
                self.peer_state_vector = Some(state_vector);
                if self.state == SyncState::Handshaking {
                    self.set_state(SyncState::Synced);
                }
            }
            SyncPayload::Delta { operations, source_state_vector_digest } => {
                self.integrate_batch(operations, now);
                if self.replica.state_vector().digest() == source_state_vector_digest {
                    log::trace!("Doc {} matches sender {} after delta", self.doc_id, message.peer_id);
                }
            }
            SyncPayload::Awareness { user_id, state, timestamp } => {
                if self.awareness.apply_remote(user_id, state, timestamp, now) {
                    self.notify_awareness();
                }
            }
            SyncPayload::AwarenessLeave { user_id } => {
                if self.awareness.remove(&user_id, now) {
                    self.notify_awareness();
                }
            }
            SyncPayload::Ping => out.push(SyncMessage::pong(self.info.peer_id, self.doc_id)),
            SyncPayload::Pong => log::trace!("Pong from {}", message.peer_id),
            SyncPayload::Join { info } => {
                log::debug!("Session ignoring join from {} ({})", info.name, info.peer_id);
            }
        }

        out.extend(self.check_gaps(now));
        out
    }

    /// Integrate remote operations one by one. A malformed operation is
    /// logged and skipped; the rest of the batch still applies.
    fn integrate_batch(&mut self, operations: Vec<Operation>, now: Instant) {
        let mut changes = Vec::new();
        for operation in operations {
            let id = operation.id();
            match self.replica.integrate(operation, now) {
                Ok(IntegrateOutcome::Applied { changes: applied, released }) => {
                    if released > 0 {
                        log::debug!("{} unblocked {} buffered operations", id, released);
                    }
                    changes.extend(applied);
                }
                Ok(IntegrateOutcome::Buffered { missing }) => {
                    log::debug!("Doc {}: {} waits for {}", self.doc_id, id, missing);
                }
                Ok(IntegrateOutcome::Duplicate) => log::trace!("Duplicate {}", id),
                Err(e) => log::warn!("Doc {}: rejected {}: {}", self.doc_id, id, e),
            }
        }
        if !changes.is_empty() {
            self.notify_document(&changes);
        }
    }

    // ─── Gap detection ──────────────────────────────────────────

    fn check_gaps(&mut self, now: Instant) -> Vec<SyncMessage> {
        if let Err(e) = self.replica.buffer_health(now) {
            log::warn!("Doc {}: {}; forcing resync", self.doc_id, e);
            return self.resync();
        }
        if !self.replica.has_gaps() {
            self.gaps_since = None;
            return Vec::new();
        }

        let since = *self.gaps_since.get_or_insert(now);
        if now.saturating_duration_since(since) > self.config.gap_timeout {
            log::warn!(
                "Doc {}: gaps persisted for more than {:?}; forcing resync",
                self.doc_id,
                self.config.gap_timeout
            );
            return self.resync();
        }
        Vec::new()
    }

    /// Drop the causal buffer and re-run the handshake if connected.
    fn resync(&mut self) -> Vec<SyncMessage> {
        let connected = self.is_connected();
        self.replica.clear_buffer();
        self.gaps_since = None;
        self.peer_state_vector = None;
        self.set_state(SyncState::Resyncing);

        if !connected {
            return Vec::new();
        }
        self.set_state(SyncState::Handshaking);
        vec![self.sync_step1()]
    }

    /// Ask the hub for its state vector again; its `SyncStep2` makes this
    /// side ship whatever the hub lacks. Used after an outgoing frame was
    /// lost. A handshake already in flight covers the same ground.
    pub fn request_resync(&mut self) -> Vec<SyncMessage> {
        if self.state != SyncState::Synced {
            return Vec::new();
        }
        log::debug!("Doc {}: re-requesting hub state", self.doc_id);
        vec![self.sync_step1()]
    }

    // ─── Local edits ────────────────────────────────────────────

    pub fn insert(&mut self, position: usize, content: &str) -> Result<Vec<SyncMessage>, SessionError> {
        self.ensure_open()?;
        let edit = self.replica.insert(position, content)?;
        Ok(self.publish(edit))
    }

    pub fn delete(&mut self, range: Range<usize>) -> Result<Vec<SyncMessage>, SessionError> {
        self.ensure_open()?;
        let edit = self.replica.delete(range)?;
        Ok(self.publish(edit))
    }

    /// Replace the whole visible text (e.g. paste-over or external reload).
    pub fn replace_all(&mut self, content: &str) -> Result<Vec<SyncMessage>, SessionError> {
        self.ensure_open()?;
        let edit = self.replica.replace_all(content)?;
        Ok(self.publish(edit))
    }

    /// Change local presence. Broadcast immediately when connected.
    pub fn update_awareness(&mut self, update: AwarenessUpdate, now: Instant) -> Result<Vec<SyncMessage>, SessionError> {
        self.ensure_open()?;
        let message = self.awareness.set_local(update, now);
        self.notify_awareness();
        if self.is_connected() {
            Ok(vec![self.awareness_message(message)])
        } else {
            Ok(Vec::new())
        }
    }

    fn publish(&mut self, edit: LocalEdit) -> Vec<SyncMessage> {
        self.notify_document(&edit.changes);
        if self.state == SyncState::Synced && !edit.operations.is_empty() {
            vec![self.delta_message(edit.operations)]
        } else {
            Vec::new()
        }
    }

    /// Continue under a fresh replica identity after `CounterOverflow`.
    ///
    /// The document is rebuilt from a snapshot of the current state, buffered
    /// operations are dropped, and a handshake is started if connected.
    pub fn renew_replica(&mut self) -> Result<Vec<SyncMessage>, SessionError> {
        self.ensure_open()?;
        let snapshot = self.replica.snapshot();
        let replica = Replica::from_snapshot(ReplicaId::random(), &snapshot, self.config.replica.clone())?;
        log::warn!(
            "Doc {}: replica {} replaced by {}",
            self.doc_id,
            self.replica.id(),
            replica.id()
        );
        self.replica = replica;
        Ok(self.resync())
    }

    // ─── Helpers ────────────────────────────────────────────────

    fn sync_step1(&self) -> SyncMessage {
        SyncMessage::sync_step1(self.info.peer_id, self.doc_id, self.replica.state_vector().clone())
    }

    fn delta_message(&self, operations: Vec<Operation>) -> SyncMessage {
        SyncMessage::delta(
            self.info.peer_id,
            self.doc_id,
            operations,
            self.replica.state_vector().digest(),
        )
    }

    fn awareness_message(&self, message: AwarenessMessage) -> SyncMessage {
        SyncMessage::awareness(self.info.peer_id, self.doc_id, message)
    }

    fn notify_document(&mut self, changes: &[ChangeRange]) {
        if self.observers.is_empty() || changes.is_empty() {
            return;
        }
        let text = self.replica.text();
        self.observers.document_changed(&text, changes);
    }

    fn notify_awareness(&mut self) {
        if self.observers.is_empty() {
            return;
        }
        let users = self.awareness.active_users();
        self.observers.awareness_changed(&users);
    }
}
