//! Sync core for a lead pipeline dashboard.
//!
//! The remote store is the source of truth and an automated agent writes to it
//! concurrently. This crate keeps a local board and one open conversation
//! consistent with it: polling and change-feed refreshes, optimistic writes
//! with rollback, and the agent/operator handoff rule for replies.

pub mod board;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handoff;
pub mod scheduler;
pub mod session;
pub mod timeline;
pub mod types;

pub use board::{Board, BoardColumn, BucketKey};
pub use config::DeskConfig;
pub use error::SyncError;
pub use gateway::{MemoryStore, RemoteStore};
pub use handoff::HandoffState;
pub use session::{DashboardSession, DeskSignal, TimelineView};
pub use types::{Author, Direction, Lead, LeadPatch, Message};
