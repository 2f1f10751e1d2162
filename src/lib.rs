//! Real-time synchronization engine for a multi-user kanban board.
//!
//! The authority (HTTP API + WebSocket broadcaster) persists mutations and
//! is the final arbiter of entity state; this crate keeps a client's local
//! view converged with it. Edits apply optimistically for instant feedback
//! and roll back exactly when the authority rejects them; remote edits
//! arrive as broadcast events and reconcile idempotently, so concurrent
//! sessions converge to the authority's state without merge logic.
//!
//! Entry point is [`Session`]: one per connected user, any number per
//! process.

pub mod api;
pub mod board;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mutation;
pub mod presence;
pub mod session;

pub use board::{BoardStore, MoveOutcome, Project, Task, TaskPatch, TaskPriority, TaskStatus};
pub use channel::{ChannelState, ClientEvent, ServerEvent};
pub use config::EngineConfig;
pub use dispatch::SyncSignal;
pub use error::{Result, SyncError};
pub use session::Session;
