//! Quire core: replicated plain text for real-time collaboration.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Replica                           │
//! │                                                          │
//! │  IdGenerator ──► TextDocument (YATA sequence)            │
//! │                        ▲                                 │
//! │                        │ apply when deps present         │
//! │  remote op ──► CausalBuffer ──► OpLog ──► StateVector    │
//! │                                                          │
//! │  snapshot() / from_snapshot()                            │
//! └──────────────────────────────────────────────────────────┘
//!
//! ┌───────────────────────┐
//! │    AwarenessTable     │  ephemeral, last-writer-wins
//! └───────────────────────┘
//! ```
//!
//! The crate does no I/O. `quire-collab` drives it over the network.
//!
//! ## Modules
//!
//! - [`id`]: replica ids, operation ids, counter generation
//! - [`operation`]: insert runs and deletes as exchanged between replicas
//! - [`text`]: the replicated character sequence
//! - [`oplog`]: integration-ordered log and contiguous state vector upkeep
//! - [`state_vector`]: per-replica high-water marks
//! - [`buffer`]: operations waiting for missing dependencies
//! - [`replica`]: ties the above together
//! - [`snapshot`]: full-document snapshots
//! - [`awareness`]: presence (cursor, selection, display name/color)

pub mod awareness;
pub mod buffer;
pub mod error;
pub mod id;
pub mod operation;
pub mod oplog;
pub mod replica;
pub mod snapshot;
pub mod state_vector;
pub mod text;

pub use awareness::{
    AwarenessConfig, AwarenessMessage, AwarenessState, AwarenessTable, AwarenessUpdate, SelectionRange, UserId,
};
pub use error::CoreError;
pub use id::{IdGenerator, OperationId, ReplicaId};
pub use operation::Operation;
pub use replica::{IntegrateOutcome, LocalEdit, Replica, ReplicaConfig};
pub use snapshot::{DeleteRecord, Snapshot};
pub use state_vector::StateVector;
pub use text::{ChangeKind, ChangeRange, CharacterElement, TextDocument};
