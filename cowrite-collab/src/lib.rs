//! # cowrite-collab — Real-time collaborative text editing core
//!
//! Conflict-free multi-writer text editing over WebSocket rooms.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │  (per user)  │    Binary Proto    │  (central)   │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Reconciler   │                    │ TextReplica  │
//! │  TextReplica │                    │ (per room)   │
//! │  (local)     │                    └──────┬───────┘
//! └──────────────┘                           │
//!                                    ┌───────┴───────┐
//!                                    │  RoomChannel  │
//!                                    │  (fan-out)    │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`] — Replicated text CRDT (element ids, tombstones)
//! - [`reconcile`] — Editor deltas ↔ CRDT operations, divergence repair
//! - [`presence`] — Cursor/typing awareness with expiry
//! - [`ownership`] — Advisory per-file claims, last write wins
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`server`] — WebSocket room server
//! - [`client`] — WebSocket room client with offline queue
//!
//! ## Guarantees
//!
//! - Replicas that see the same set of operations render the same text,
//!   regardless of arrival order or duplication
//! - A member's own edits apply immediately; remote edits merge without
//!   conflict windows or manual resolution
//! - Presence and ownership are advisory overlays; they never block an
//!   edit

pub mod replica;
pub mod reconcile;
pub mod presence;
pub mod ownership;
pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use replica::{hash_text, Element, ElementId, Operation, TextReplica};
pub use reconcile::{EditorDelta, RangeEdit, Reconciler};
pub use presence::{
    ClientPresence, CursorPos, PresenceColor, PresenceRegistry, PresenceTick,
};
pub use ownership::{OwnershipArbitrator, OwnershipRecord, OwnershipStatus};
pub use protocol::{ParticipantInfo, ProtocolError, WireMessage};
pub use broadcast::{ChannelStats, RoomChannel, RoomRegistry};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{CollabClient, CollabEvent, ConnectionState, OfflineQueue};
