//! In-process `RemoteStore`.
//!
//! Holds leads, stages and messages in memory and fans change events out to
//! subscribers. Also exposes the knobs tests need: injected read/write
//! failures, a server clock offset, and gates that stall reads or writes.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{RemoteStore, Subscription};
use crate::error::SyncError;
use crate::types::{
    Author, ChangeEvent, ChangeFilter, ChangeOp, ConversationRow, Direction, Lead, LeadPatch,
    Message, NewMessage, Table,
};

struct Subscriber {
    id: u64,
    table: Table,
    filter: Option<ChangeFilter>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct ReadCounts {
    leads: usize,
    stages: usize,
    messages: usize,
}

#[derive(Default)]
struct MemoryInner {
    leads: Vec<Lead>,
    stages: Vec<String>,
    messages: Vec<Message>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    next_message: u64,
    fail_reads: u32,
    fail_writes: u32,
    clock_offset: chrono::Duration,
    reads: ReadCounts,
}

impl MemoryInner {
    fn take_read_fault(&mut self) -> Result<(), SyncError> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(SyncError::TransientFetch("injected read failure".to_string()));
        }
        Ok(())
    }

    fn take_write_fault(&mut self) -> Result<(), SyncError> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(SyncError::WriteConflict("injected write failure".to_string()));
        }
        Ok(())
    }

    fn publish(&mut self, table: Table, row: serde_json::Value, op: ChangeOp) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for sub in &self.subscribers {
            if sub.table != table {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter.matches(&row) {
                    continue;
                }
            }
            let _ = sub.tx.send(ChangeEvent {
                table,
                row: row.clone(),
                op,
            });
        }
    }

    fn append_message(&mut self, mut message: Message) -> Message {
        self.next_message += 1;
        message.id = format!("m-{}", self.next_message);
        self.messages.push(message.clone());
        let row = serde_json::to_value(ConversationRow::from(&message)).unwrap_or_default();
        self.publish(Table::Conversations, row, ChangeOp::Insert);
        message
    }
}

/// Cloneable handle to an in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    read_gate: Arc<watch::Sender<bool>>,
    write_gate: Arc<watch::Sender<bool>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (read_gate, _) = watch::channel(true);
        let (write_gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            read_gate: Arc::new(read_gate),
            write_gate: Arc::new(write_gate),
        }
    }

    pub fn with_stages(self, stages: &[&str]) -> Self {
        self.inner.lock().stages = stages.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_leads(self, leads: Vec<Lead>) -> Self {
        self.inner.lock().leads = leads;
        self
    }

    /// Seed a message without publishing a change event.
    pub fn seed_message(&self, message: Message) {
        self.inner.lock().messages.push(message);
    }

    /// A customer writes in. Publishes an insert event.
    pub fn receive_inbound(&self, lead_id: &str, text: &str, at: DateTime<Utc>) -> Message {
        self.inner.lock().append_message(Message {
            id: String::new(),
            lead_id: lead_id.to_string(),
            direction: Direction::Inbound,
            text: text.to_string(),
            timestamp: at,
            author: None,
        })
    }

    /// The automated agent replies. Publishes an insert event.
    pub fn agent_reply(&self, lead_id: &str, text: &str, at: DateTime<Utc>) -> Message {
        self.inner.lock().append_message(Message {
            id: String::new(),
            lead_id: lead_id.to_string(),
            direction: Direction::Outbound,
            text: text.to_string(),
            timestamp: at,
            author: Some(Author::Agent),
        })
    }

    /// Another actor changes a lead directly. Publishes an update event.
    pub fn external_update(&self, id: &str, patch: &LeadPatch) -> bool {
        let mut inner = self.inner.lock();
        let Some(lead) = inner.leads.iter_mut().find(|l| l.id == id) else {
            return false;
        };
        patch.apply_to(lead);
        let row = serde_json::to_value(&*lead).unwrap_or_default();
        inner.publish(Table::Leads, row, ChangeOp::Update);
        true
    }

    /// Remove a lead as another actor would. Publishes a delete event.
    pub fn external_delete(&self, id: &str) {
        let mut inner = self.inner.lock();
        let before = inner.leads.len();
        inner.leads.retain(|l| l.id != id);
        if inner.leads.len() != before {
            inner.publish(Table::Leads, serde_json::json!({ "id": id }), ChangeOp::Delete);
        }
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.inner.lock().fail_reads = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().fail_writes = count;
    }

    /// Offset the store applies to client send times on insert.
    pub fn set_clock_offset(&self, offset: chrono::Duration) {
        self.inner.lock().clock_offset = offset;
    }

    /// Stall every read until `resume_reads` is called.
    pub fn pause_reads(&self) {
        self.read_gate.send_replace(false);
    }

    pub fn resume_reads(&self) {
        self.read_gate.send_replace(true);
    }

    /// Stall `update_lead` and `insert_message` until `resume_writes`.
    pub fn pause_writes(&self) {
        self.write_gate.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.write_gate.send_replace(true);
    }

    pub fn lead(&self, id: &str) -> Option<Lead> {
        self.inner.lock().leads.iter().find(|l| l.id == id).cloned()
    }

    pub fn messages(&self, lead_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.lead_id == lead_id)
            .cloned()
            .collect()
    }

    /// Number of `list_leads` calls so far, including stalled ones.
    pub fn lead_reads(&self) -> usize {
        self.inner.lock().reads.leads
    }

    pub fn stage_reads(&self) -> usize {
        self.inner.lock().reads.stages
    }

    /// Number of `list_messages` calls so far, including stalled ones.
    pub fn message_reads(&self) -> usize {
        self.inner.lock().reads.messages
    }

    /// Live subscriptions, after pruning released ones.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }

    async fn wait_for_reads(&self) {
        let mut gate = self.read_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    async fn wait_for_writes(&self) {
        let mut gate = self.write_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_leads(&self) -> Result<Vec<Lead>, SyncError> {
        self.inner.lock().reads.leads += 1;
        self.wait_for_reads().await;
        let mut inner = self.inner.lock();
        inner.take_read_fault()?;
        Ok(inner.leads.clone())
    }

    async fn list_stages(&self) -> Result<Vec<String>, SyncError> {
        self.inner.lock().reads.stages += 1;
        self.wait_for_reads().await;
        let mut inner = self.inner.lock();
        inner.take_read_fault()?;
        Ok(inner.stages.clone())
    }

    async fn update_lead(&self, id: &str, patch: &LeadPatch) -> Result<(), SyncError> {
        self.wait_for_writes().await;
        let mut inner = self.inner.lock();
        inner.take_write_fault()?;
        let lead = inner
            .leads
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        patch.apply_to(lead);
        let row = serde_json::to_value(&*lead)?;
        inner.publish(Table::Leads, row, ChangeOp::Update);
        Ok(())
    }

    async fn list_messages(&self, lead_id: &str) -> Result<Vec<Message>, SyncError> {
        self.inner.lock().reads.messages += 1;
        self.wait_for_reads().await;
        let mut inner = self.inner.lock();
        inner.take_read_fault()?;
        if !inner.leads.iter().any(|l| l.id == lead_id) {
            return Err(SyncError::NotFound(lead_id.to_string()));
        }
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.lead_id == lead_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SyncError> {
        self.wait_for_writes().await;
        let mut inner = self.inner.lock();
        inner.take_write_fault()?;
        if !inner.leads.iter().any(|l| l.id == message.lead_id) {
            return Err(SyncError::NotFound(message.lead_id.clone()));
        }
        let timestamp = message.sent_at + inner.clock_offset;
        Ok(inner.append_message(Message {
            id: String::new(),
            lead_id: message.lead_id.clone(),
            direction: Direction::Outbound,
            text: message.text.clone(),
            timestamp,
            author: Some(message.author),
        }))
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Option<ChangeFilter>,
    ) -> Result<Subscription, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            inner.next_subscriber += 1;
            let id = inner.next_subscriber;
            inner.subscribers.push(Subscriber {
                id,
                table,
                filter,
                tx,
            });
            id
        };

        let registry: Weak<Mutex<MemoryInner>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = registry.upgrade() {
                inner.lock().subscribers.retain(|s| s.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, min, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_offset() {
        let store = MemoryStore::new().with_leads(vec![Lead::new("L1")]);
        store.set_clock_offset(chrono::Duration::seconds(2));

        let stored = store
            .insert_message(&NewMessage {
                lead_id: "L1".into(),
                text: "hola".into(),
                author: Author::Operator,
                sent_at: at(1),
            })
            .await
            .unwrap();

        assert_eq!(stored.id, "m-1");
        assert_eq!(stored.timestamp, at(1) + chrono::Duration::seconds(2));
        assert_eq!(stored.author, Some(Author::Operator));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new().with_leads(vec![Lead::new("L1")]);
        store.fail_next_reads(1);
        assert!(store.list_leads().await.is_err());
        assert_eq!(store.list_leads().await.unwrap().len(), 1);

        store.fail_next_writes(1);
        assert!(store.update_lead("L1", &LeadPatch::status("A")).await.is_err());
        store.update_lead("L1", &LeadPatch::status("A")).await.unwrap();
        assert_eq!(store.lead("L1").unwrap().status.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_subscription_filters_and_releases() {
        let store = MemoryStore::new().with_leads(vec![Lead::new("L1"), Lead::new("L2")]);
        let mut sub = store
            .subscribe(Table::Conversations, Some(ChangeFilter::eq("lead_id", "L1")))
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 1);

        store.receive_inbound("L2", "otro", at(0));
        store.receive_inbound("L1", "hola", at(1));

        let event = sub.next().await.unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.row["mensaje_in"], "hola");

        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_list_messages_unknown_lead_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.list_messages("nope").await.unwrap_err(),
            SyncError::NotFound("nope".into())
        );
    }
}
