//! # instant-collab — Relay, protocol and edit coordination
//!
//! Everything between the replicated document model and the network.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ RelayServer │ ◄────────────────► │ SyncClient  │
//! │ (host)      │    JSON arrays     │ (router)    │    JSON arrays     │ (guest)     │
//! └──────┬──────┘                    └─────────────┘                    └──────┬──────┘
//!        │                                                                     │
//!        ▼                                                                     ▼
//! ┌─────────────┐                                                       ┌─────────────┐
//! │ Coordinator │ ◄── EditSurface                       EditSurface ──► │ Coordinator │
//! │ + Document  │                                                       │ + Document  │
//! └─────────────┘                                                       └─────────────┘
//! ```
//!
//! The relay keeps no document state. Each client owns one replica and
//! converges through identifier-addressed insert/delete.
//!
//! ## Modules
//!
//! - [`protocol`] — Tagged JSON message codec and schema validation
//! - [`router`] — Connection registry and per-type routing rules
//! - [`server`] — WebSocket relay server
//! - [`surface`] — Editing-surface interface and in-memory buffer
//! - [`coordinator`] — Local/remote edit serialization with echo suppression
//! - [`client`] — Session client task
//! - [`session`] — Buffer-name → session registry

pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod surface;

// Re-exports for convenience
pub use client::{
    parse_session_url, Role, SessionCommand, SessionConfig, SessionError, SessionEvent, SyncClient,
};
pub use coordinator::{ActiveEdit, Coordinator, CoordinatorError, RemoteOp};
pub use protocol::{validate, BufferId, ClientId, Message, MessageType, OpKind, ProtocolError, TextOp};
pub use router::{ConnectionId, ConnectionRecord, Outbound, RelayStats, Router};
pub use server::{ConnectionCommand, RelayEvent, RelayServer, ServerConfig, DEFAULT_PORT};
pub use session::SessionManager;
pub use surface::{EditSurface, RangeError, SurfaceChange, SurfaceEdit, TextBuffer};
