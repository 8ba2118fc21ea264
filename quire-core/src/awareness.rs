//! Awareness: who is in the document and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor/selection change
//!       │
//!       ▼
//! AwarenessTable::set_local()  ──►  AwarenessMessage::Update (full state)
//!       │                                   │
//!       │  heartbeat_due() every interval   ▼   (awareness channel)
//!       └──────────────────────────► Remote AwarenessTable::apply_remote()
//!                                           │  last-writer-wins by timestamp
//!                                           ▼
//!                                    expire() after `timeout` of silence
//! ```
//!
//! Awareness is ephemeral: it is never logged, persisted or buffered for
//! causality. A newer message simply replaces the older one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type UserId = Uuid;

/// Display colors handed out to collaborators.
pub const PALETTE: [&str; 8] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEEAD", "#D4A5A5", "#9FA8DA", "#CE93D8",
];

/// Stable palette color for a user.
pub fn color_for(user_id: UserId) -> &'static str {
    PALETTE[(user_id.as_u128() % PALETTE.len() as u128) as usize]
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

/// A selection in visible character positions. `head` is where the cursor
/// sits; it may be before `anchor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: usize,
    pub head: usize,
}

impl SelectionRange {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_id: UserId,
    pub display_name: String,
    pub display_color: String,
    pub cursor: Option<usize>,
    pub selection: Option<SelectionRange>,
    /// Sender wall-clock milliseconds, strictly increasing per sender.
    pub last_updated_at: u64,
}

impl AwarenessState {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            display_color: color_for(user_id).to_string(),
            cursor: None,
            selection: None,
            last_updated_at: 0,
        }
    }
}

/// Partial change to the local state. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub display_name: Option<String>,
    pub display_color: Option<String>,
    pub cursor: Option<Option<usize>>,
    pub selection: Option<Option<SelectionRange>>,
}

impl AwarenessUpdate {
    pub fn cursor(position: usize) -> Self {
        Self { cursor: Some(Some(position)), ..Default::default() }
    }

    pub fn selection(range: SelectionRange) -> Self {
        Self {
            cursor: Some(Some(range.head)),
            selection: Some(Some(range)),
            ..Default::default()
        }
    }

    /// Clear both cursor and selection (e.g. editor lost focus).
    pub fn blur() -> Self {
        Self { cursor: Some(None), selection: Some(None), ..Default::default() }
    }

    pub fn display_name(name: impl Into<String>) -> Self {
        Self { display_name: Some(name.into()), ..Default::default() }
    }
}

/// What goes over the awareness channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full state of one user.
    Update { user_id: UserId, state: AwarenessState, timestamp: u64 },
    /// Clean departure.
    Leave { user_id: UserId },
}

impl AwarenessMessage {
    pub fn user_id(&self) -> UserId {
        match self {
            AwarenessMessage::Update { user_id, .. } | AwarenessMessage::Leave { user_id } => *user_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Table
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// Full local state is re-sent at least this often.
    pub heartbeat_interval: Duration,
    /// Remote users silent for longer than this are dropped.
    pub timeout: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self::with_heartbeat(Duration::from_secs(15))
    }
}

impl AwarenessConfig {
    /// Timeout defaults to three heartbeats.
    pub fn with_heartbeat(heartbeat_interval: Duration) -> Self {
        Self { heartbeat_interval, timeout: heartbeat_interval * 3 }
    }

    pub fn for_testing() -> Self {
        Self::with_heartbeat(Duration::from_millis(50))
    }
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    state: AwarenessState,
    timestamp: u64,
    /// Local receipt time of the last accepted message.
    last_seen: Instant,
}

/// A user who left, kept until `timeout` so reordered older updates can't
/// bring them back.
#[derive(Debug, Clone, Copy)]
struct Departure {
    timestamp: u64,
    at: Instant,
}

/// Local awareness state plus everything heard from remote users.
pub struct AwarenessTable {
    local: AwarenessState,
    remote: HashMap<UserId, RemoteEntry>,
    departed: HashMap<UserId, Departure>,
    config: AwarenessConfig,
    last_broadcast: Option<Instant>,
}

impl AwarenessTable {
    pub fn new(user_id: UserId, display_name: impl Into<String>, config: AwarenessConfig) -> Self {
        Self {
            local: AwarenessState::new(user_id, display_name),
            remote: HashMap::new(),
            departed: HashMap::new(),
            config,
            last_broadcast: None,
        }
    }

    pub fn local_user_id(&self) -> UserId {
        self.local.user_id
    }

    pub fn local(&self) -> &AwarenessState {
        &self.local
    }

    pub fn config(&self) -> &AwarenessConfig {
        &self.config
    }

    /// Apply a local change and return the full state to broadcast.
    pub fn set_local(&mut self, update: AwarenessUpdate, now: Instant) -> AwarenessMessage {
        if let Some(name) = update.display_name {
            self.local.display_name = name;
        }
        if let Some(color) = update.display_color {
            self.local.display_color = color;
        }
        if let Some(cursor) = update.cursor {
            self.local.cursor = cursor;
        }
        if let Some(selection) = update.selection {
            self.local.selection = selection;
        }
        self.local_message(now)
    }

    /// Current local state stamped with a fresh timestamp.
    pub fn local_message(&mut self, now: Instant) -> AwarenessMessage {
        let timestamp = wall_clock_millis().max(self.local.last_updated_at + 1);
        self.local.last_updated_at = timestamp;
        self.last_broadcast = Some(now);
        AwarenessMessage::Update {
            user_id: self.local.user_id,
            state: self.local.clone(),
            timestamp,
        }
    }

    /// The heartbeat to send if `heartbeat_interval` has passed since the
    /// last broadcast.
    pub fn heartbeat_due(&mut self, now: Instant) -> Option<AwarenessMessage> {
        let due = match self.last_broadcast {
            Some(last) => now.saturating_duration_since(last) >= self.config.heartbeat_interval,
            None => true,
        };
        due.then(|| self.local_message(now))
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave { user_id: self.local.user_id }
    }

    /// Last-writer-wins merge of a remote state. Returns true if the table
    /// changed.
    pub fn apply_remote(&mut self, user_id: UserId, state: AwarenessState, timestamp: u64, now: Instant) -> bool {
        if user_id == self.local.user_id {
            return false;
        }
        if state.user_id != user_id {
            log::warn!("Awareness state for {} carried mismatched user id {}", user_id, state.user_id);
            return false;
        }
        if let Some(existing) = self.remote.get(&user_id) {
            if timestamp <= existing.timestamp {
                log::trace!("Ignoring stale awareness for {} ({} <= {})", user_id, timestamp, existing.timestamp);
                return false;
            }
        }
        if let Some(departure) = self.departed.get(&user_id) {
            if timestamp <= departure.timestamp {
                log::trace!("Ignoring awareness for {} sent before they left", user_id);
                return false;
            }
            self.departed.remove(&user_id);
        }

        self.remote.insert(user_id, RemoteEntry { state, timestamp, last_seen: now });
        true
    }

    /// Apply an incoming awareness message. Returns true if the table changed.
    pub fn handle_message(&mut self, message: AwarenessMessage, now: Instant) -> bool {
        match message {
            AwarenessMessage::Update { user_id, state, timestamp } => self.apply_remote(user_id, state, timestamp, now),
            AwarenessMessage::Leave { user_id } => self.remove(&user_id, now),
        }
    }

    /// Explicit leave. Updates no newer than the last one seen from this
    /// user are ignored until `timeout` has passed.
    pub fn remove(&mut self, user_id: &UserId, now: Instant) -> bool {
        match self.remote.remove(user_id) {
            Some(entry) => {
                self.departed.insert(*user_id, Departure { timestamp: entry.timestamp, at: now });
                true
            }
            None => false,
        }
    }

    /// Drop users not heard from within `timeout`. Returns who was dropped.
    pub fn expire(&mut self, now: Instant) -> Vec<UserId> {
        let timeout = self.config.timeout;
        let stale: Vec<UserId> = self
            .remote
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.remote.remove(id);
            log::debug!("Awareness for {} timed out", id);
        }
        self.departed
            .retain(|_, departure| now.saturating_duration_since(departure.at) <= timeout);
        stale
    }

    /// Forget every remote user (session closed).
    pub fn clear_remote(&mut self) {
        self.remote.clear();
        self.departed.clear();
    }

    pub fn get(&self, user_id: &UserId) -> Option<&AwarenessState> {
        self.remote.get(user_id).map(|entry| &entry.state)
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Local user first, then remote users ordered by id.
    pub fn active_users(&self) -> Vec<AwarenessState> {
        let mut remote: Vec<&RemoteEntry> = self.remote.values().collect();
        remote.sort_by_key(|entry| entry.state.user_id);

        std::iter::once(self.local.clone())
            .chain(remote.into_iter().map(|entry| entry.state.clone()))
            .collect()
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
