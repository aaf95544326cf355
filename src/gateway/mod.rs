//! Remote store contract.
//!
//! The core only talks to the store through `RemoteStore`. Transport and
//! persistence live behind it; `memory::MemoryStore` is the in-process
//! implementation used by tests and the headless binary.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::types::{ChangeEvent, ChangeFilter, Lead, LeadPatch, Message, NewMessage, Table};

pub use memory::MemoryStore;

/// Table-oriented remote store with an optional change feed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All leads, in store order.
    async fn list_leads(&self) -> Result<Vec<Lead>, SyncError>;

    /// Pipeline stage names, in board column order.
    async fn list_stages(&self) -> Result<Vec<String>, SyncError>;

    async fn update_lead(&self, id: &str, patch: &LeadPatch) -> Result<(), SyncError>;

    /// Messages for one lead, ascending by timestamp.
    async fn list_messages(&self, lead_id: &str) -> Result<Vec<Message>, SyncError>;

    /// Insert an outbound message. Returns the stored row with its server id.
    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SyncError>;

    /// Subscribe to row changes on `table`, optionally filtered by one column.
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<ChangeFilter>,
    ) -> Result<Subscription, SyncError> {
        let _ = (table, filter);
        Err(SyncError::Unsupported)
    }
}

/// Live change-feed subscription. Released on `unsubscribe()` or drop.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Next change event, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        self.events.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("released", &self.release.is_none())
            .finish()
    }
}
