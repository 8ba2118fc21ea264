//! UI notification hooks.
//!
//! A [`SyncSession`](crate::session::SyncSession) reports document, presence
//! and connection changes to registered observers synchronously, right after
//! the mutation that caused them. Observers must not block; anything slow
//! belongs behind a channel, which is what [`ChannelObserver`] provides.

use quire_core::{AwarenessState, ChangeRange};
use tokio::sync::mpsc;

use crate::session::{SessionError, SyncState};

/// Callbacks for an embedding UI. Every method defaults to a no-op.
pub trait SessionObserver: Send {
    /// Visible text changed. `changes` use sequential semantics: each range
    /// is relative to the document after the previous range was applied.
    fn on_document_changed(&mut self, _text: &str, _changes: &[ChangeRange]) {}

    /// Presence changed. Local user first, then remote users by id.
    fn on_awareness_changed(&mut self, _users: &[AwarenessState]) {}

    fn on_state_changed(&mut self, _state: SyncState) {}
}

/// The registered observers of one session.
#[derive(Default)]
pub struct Observers {
    observers: Vec<Box<dyn SessionObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn document_changed(&mut self, text: &str, changes: &[ChangeRange]) {
        for observer in self.observers.iter_mut() {
            observer.on_document_changed(text, changes);
        }
    }

    pub fn awareness_changed(&mut self, users: &[AwarenessState]) {
        for observer in self.observers.iter_mut() {
            observer.on_awareness_changed(users);
        }
    }

    pub fn state_changed(&mut self, state: SyncState) {
        for observer in self.observers.iter_mut() {
            observer.on_state_changed(state);
        }
    }
}

/// Events surfaced to the application by a running client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    DocumentChanged { text: String, changes: Vec<ChangeRange> },
    AwarenessChanged(Vec<AwarenessState>),
    /// Reconnection gave up; the document stays editable offline.
    Degraded { attempts: u32 },
    /// Unrecoverable session error (e.g. counter overflow).
    Error(SessionError),
}

/// Forwards observer callbacks into a bounded channel.
///
/// Callbacks run with the session lock held, so this never waits: when the
/// application falls behind, events are dropped with a warning.
pub struct ChannelObserver {
    tx: mpsc::Sender<SyncEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: SyncEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    log::warn!("Event channel full, dropping {:?}", event_name(&event));
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::trace!("Event receiver gone");
                }
            }
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_document_changed(&mut self, text: &str, changes: &[ChangeRange]) {
        self.forward(SyncEvent::DocumentChanged {
            text: text.to_string(),
            changes: changes.to_vec(),
        });
    }

    fn on_awareness_changed(&mut self, users: &[AwarenessState]) {
        self.forward(SyncEvent::AwarenessChanged(users.to_vec()));
    }

    fn on_state_changed(&mut self, state: SyncState) {
        self.forward(SyncEvent::StateChanged(state));
    }
}

fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::StateChanged(_) => "StateChanged",
        SyncEvent::DocumentChanged { .. } => "DocumentChanged",
        SyncEvent::AwarenessChanged(_) => "AwarenessChanged",
        SyncEvent::Degraded { .. } => "Degraded",
        SyncEvent::Error(_) => "Error",
    }
}
