//! Conversation timeline merge.
//!
//! The server snapshot for a lead is authoritative and rebuilt on every
//! refresh. Replies the operator just sent live in a pending list until a
//! snapshot contains them; the merge splices them in without ever showing a
//! reply twice.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::Duration;

use crate::error::SyncError;
use crate::types::{Direction, Message};

/// Prefix for ids of optimistic entries that have no server id yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Total order for a lead's messages: timestamp, then inbound before outbound.
///
/// Used with a stable sort, so equal keys keep insertion order.
pub fn message_order(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.direction.rank().cmp(&b.direction.rank()))
}

pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(message_order);
}

pub fn is_ordered(messages: &[Message]) -> bool {
    messages
        .windows(2)
        .all(|w| message_order(&w[0], &w[1]) != Ordering::Greater)
}

/// Whether `server` is the stored copy of the optimistic entry `pending`.
///
/// Once the insert has returned, the pending entry carries the server id and
/// only an id match counts. Before that, a server row confirms it when it is
/// an outbound row for the same lead with the same text, stamped at or after
/// the send time and within `window` of it.
pub fn is_confirmed_by(pending: &Message, server: &Message, window: Duration) -> bool {
    if !pending.id.starts_with(LOCAL_ID_PREFIX) {
        return pending.id == server.id;
    }
    server.lead_id == pending.lead_id
        && server.direction == Direction::Outbound
        && server.text == pending.text
        && server.timestamp >= pending.timestamp
        && server.timestamp - pending.timestamp <= window
}

/// Which pending entries the snapshot confirms, index for index.
///
/// Each server row confirms at most one entry. Entries pinned to a server id
/// claim their row first, then the rest in send order take the earliest
/// unclaimed row that matches.
pub fn confirmations(server: &[Message], pending: &[Message], window: Duration) -> Vec<bool> {
    match_pending(server, pending, window, &HashSet::new())
}

/// Merge an authoritative snapshot with pending optimistic entries.
pub fn merge(server: &[Message], pending: &[Message], window: Duration) -> Vec<Message> {
    merge_pending(server, pending, window, &HashSet::new())
}

/// `settled` holds ids of rows that cannot be the stored copy of any
/// unpinned entry, because they existed before it was sent.
fn match_pending(
    server: &[Message],
    pending: &[Message],
    window: Duration,
    settled: &HashSet<String>,
) -> Vec<bool> {
    let mut claimed: Vec<bool> = server
        .iter()
        .map(|s| settled.contains(&s.id))
        .collect();
    let mut confirmed = vec![false; pending.len()];

    let mut order: Vec<usize> = (0..pending.len()).collect();
    order.sort_by_key(|&i| (pending[i].id.starts_with(LOCAL_ID_PREFIX), pending[i].timestamp));

    for i in order {
        let pinned = !pending[i].id.starts_with(LOCAL_ID_PREFIX);
        let hit = (0..server.len()).find(|&j| {
            (pinned || !claimed[j]) && is_confirmed_by(&pending[i], &server[j], window)
        });
        if let Some(j) = hit {
            claimed[j] = true;
            confirmed[i] = true;
        }
    }
    confirmed
}

fn merge_pending(
    server: &[Message],
    pending: &[Message],
    window: Duration,
    settled: &HashSet<String>,
) -> Vec<Message> {
    let mut merged = server.to_vec();
    sort_messages(&mut merged);

    let confirmed = match_pending(&merged, pending, window, settled);
    let unconfirmed = pending
        .iter()
        .zip(confirmed)
        .filter(|(_, confirmed)| !confirmed)
        .map(|(p, _)| p.clone());
    merged.extend(unconfirmed);

    sort_messages(&mut merged);
    merged
}

/// Materialized timeline for the open lead.
#[derive(Debug, Clone)]
pub struct Timeline {
    lead_id: String,
    server: Vec<Message>,
    pending: Vec<Message>,
    /// Server rows already present when a still-pending reply was sent.
    settled: HashSet<String>,
    messages: Vec<Message>,
    loaded: bool,
    window: Duration,
}

impl Timeline {
    pub fn new(lead_id: &str, window: Duration) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            server: Vec::new(),
            pending: Vec::new(),
            settled: HashSet::new(),
            messages: Vec::new(),
            loaded: false,
            window,
        }
    }

    pub fn lead_id(&self) -> &str {
        &self.lead_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending(&self) -> &[Message] {
        &self.pending
    }

    /// True once a snapshot has been applied.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Fold a fetch result in. Returns whether the visible sequence changed.
    ///
    /// A failed fetch leaves the timeline exactly as it was.
    pub fn apply_snapshot(&mut self, result: Result<Vec<Message>, SyncError>) -> Result<bool, SyncError> {
        let mut server = match result {
            Ok(server) => server,
            Err(e) => {
                log::warn!("Timeline: refresh for {} failed, keeping last view: {}", self.lead_id, e);
                return Err(e);
            }
        };

        let before = server.len();
        server.retain(|m| m.lead_id == self.lead_id);
        if server.len() != before {
            log::debug!(
                "Timeline: dropped {} rows for other leads from {} snapshot",
                before - server.len(),
                self.lead_id
            );
        }
        sort_messages(&mut server);

        self.server = server;
        self.prune_confirmed();
        self.loaded = true;
        Ok(self.rebuild())
    }

    /// Show an optimistic reply until the server confirms it.
    pub fn push_pending(&mut self, message: Message) {
        self.settled.extend(self.server.iter().map(|m| m.id.clone()));
        self.pending.push(message);
        self.rebuild();
    }

    /// The insert returned: pin the pending entry to its server id and time.
    pub fn confirm_pending(&mut self, local_id: &str, stored: &Message) {
        if let Some(entry) = self.pending.iter_mut().find(|m| m.id == local_id) {
            entry.id = stored.id.clone();
            entry.timestamp = stored.timestamp;
        }
        self.prune_confirmed();
        self.rebuild();
    }

    /// The insert failed: the reply was never stored.
    pub fn drop_pending(&mut self, local_id: &str) {
        self.pending.retain(|m| m.id != local_id);
        self.rebuild();
    }

    fn prune_confirmed(&mut self) {
        let mut confirmed =
            match_pending(&self.server, &self.pending, self.window, &self.settled).into_iter();
        self.pending.retain(|_| !confirmed.next().unwrap_or(false));
        if self.pending.is_empty() {
            self.settled.clear();
        }
    }

    fn rebuild(&mut self) -> bool {
        let merged = merge_pending(&self.server, &self.pending, self.window, &self.settled);
        let changed = merged != self.messages;
        self.messages = merged;
        changed
    }
}
