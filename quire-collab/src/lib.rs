//! # quire-collab: network layer for Quire
//!
//! Drives `quire-core` replicas over WebSockets through a relay hub.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (hub)       │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SyncSession │                     │ Replica     │
//! │ (sans I/O)  │                     │ (per room)  │──► SnapshotStore
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode-encoded `SyncMessage` and the handshake payloads
//! - [`session`]: per-document sync state machine, no I/O
//! - [`notify`]: observer hooks and the `SyncEvent` stream
//! - [`broadcast`]: per-room fan-out
//! - [`server`]: the relay hub
//! - [`client`]: reconnecting client around a session
//! - [`storage`]: snapshot persistence (RocksDB, in-memory)

pub mod broadcast;
pub mod client;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ConnectionState, SyncClient};
pub use notify::{ChannelObserver, SessionObserver, SyncEvent};
pub use protocol::{Channel, MessageType, PeerInfo, ProtocolError, SyncMessage, SyncPayload};
pub use server::{ServerConfig, ServerStats, SyncServer, HUB_PEER_ID};
pub use session::{SessionConfig, SessionError, SyncSession, SyncState};
pub use storage::{
    DocumentMetadata, MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError,
};
