//! Pipeline board model.
//!
//! Leads are grouped into one column per pipeline stage plus a reserved
//! unclassified column. Moves are applied locally first and rolled back if
//! the store rejects them; a fresh lead snapshot otherwise wins.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::SyncError;
use crate::types::Lead;

/// Identifies a board column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "stage", rename_all = "camelCase")]
pub enum BucketKey {
    Unclassified,
    Stage(String),
}

impl BucketKey {
    /// Column for a status, given the known stages.
    pub fn for_status(status: Option<&str>, stages: &[String]) -> Self {
        match status {
            Some(s) if stages.iter().any(|stage| stage == s) => BucketKey::Stage(s.to_string()),
            _ => BucketKey::Unclassified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardColumn {
    pub key: BucketKey,
    pub title: String,
    pub leads: Vec<Lead>,
}

/// Read-only board view. Unclassified column first, then stages in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Board {
    pub columns: Vec<BoardColumn>,
}

impl Board {
    pub fn build(stages: &[String], leads: &[Lead], unclassified_label: &str) -> Self {
        let mut columns = vec![BoardColumn {
            key: BucketKey::Unclassified,
            title: unclassified_label.to_string(),
            leads: Vec::new(),
        }];
        let mut index: HashMap<BucketKey, usize> = HashMap::new();
        index.insert(BucketKey::Unclassified, 0);

        for stage in stages {
            let key = BucketKey::Stage(stage.clone());
            if index.contains_key(&key) {
                continue;
            }
            index.insert(key.clone(), columns.len());
            columns.push(BoardColumn {
                key,
                title: stage.clone(),
                leads: Vec::new(),
            });
        }

        for lead in leads {
            let key = BucketKey::for_status(lead.status.as_deref(), stages);
            let slot = index.get(&key).copied().unwrap_or(0);
            columns[slot].leads.push(lead.clone());
        }

        Self { columns }
    }

    pub fn column(&self, key: &BucketKey) -> Option<&BoardColumn> {
        self.columns.iter().find(|c| &c.key == key)
    }

    /// Column holding `lead_id`, if the lead is on the board.
    pub fn bucket_of(&self, lead_id: &str) -> Option<&BucketKey> {
        self.columns
            .iter()
            .find(|c| c.leads.iter().any(|l| l.id == lead_id))
            .map(|c| &c.key)
    }

    /// Ids in a column, in board order.
    pub fn lead_ids(&self, key: &BucketKey) -> Vec<&str> {
        self.column(key)
            .map(|c| c.leads.iter().map(|l| l.id.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.columns.iter().map(|c| c.leads.len()).sum()
    }
}

/// Handle for an in-flight status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveTicket {
    pub lead_id: String,
    pub from: Option<String>,
    pub to: String,
    seq: u64,
}

#[derive(Debug, Clone)]
struct PendingMove {
    seq: u64,
    to: String,
}

/// Lead collection plus stage list; the only writer of lead placement.
#[derive(Debug, Clone)]
pub struct BoardModel {
    stages: Vec<String>,
    leads: Vec<Lead>,
    pending_moves: HashMap<String, PendingMove>,
    next_seq: u64,
    unclassified_label: String,
    loaded: bool,
}

impl BoardModel {
    pub fn new(stages: Vec<String>, unclassified_label: &str) -> Self {
        Self {
            stages,
            leads: Vec::new(),
            pending_moves: HashMap::new(),
            next_seq: 0,
            unclassified_label: unclassified_label.to_string(),
            loaded: false,
        }
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn leads(&self) -> &[Lead] {
        &self.leads
    }

    pub(crate) fn leads_mut(&mut self) -> &mut [Lead] {
        &mut self.leads
    }

    pub fn lead(&self, id: &str) -> Option<&Lead> {
        self.leads.iter().find(|l| l.id == id)
    }

    pub(crate) fn lead_mut(&mut self, id: &str) -> Option<&mut Lead> {
        self.leads.iter_mut().find(|l| l.id == id)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn board(&self) -> Board {
        Board::build(&self.stages, &self.leads, &self.unclassified_label)
    }

    pub fn set_stages(&mut self, stages: Vec<String>) -> bool {
        if stages == self.stages {
            return false;
        }
        log::info!("Board: stage list now {:?}", stages);
        self.stages = stages;
        true
    }

    /// Replace local placement with a fresh snapshot.
    ///
    /// Leads with a status write still in flight keep their optimistic stage.
    /// Returns whether anything visible changed.
    pub fn apply_snapshot(&mut self, leads: Vec<Lead>) -> bool {
        let mut seen = HashSet::new();
        let mut next: Vec<Lead> = Vec::with_capacity(leads.len());
        for mut lead in leads {
            if !seen.insert(lead.id.clone()) {
                log::warn!("Board: snapshot repeats lead {}, keeping first", lead.id);
                continue;
            }
            if let Some(pending) = self.pending_moves.get(&lead.id) {
                lead.status = Some(pending.to.clone());
            }
            next.push(lead);
        }

        self.pending_moves.retain(|id, _| seen.contains(id));
        self.loaded = true;
        let changed = next != self.leads;
        self.leads = next;
        changed
    }

    /// Move a lead locally. `Ok(None)` when it already sits in `to`.
    pub fn begin_move(&mut self, lead_id: &str, to: &str) -> Result<Option<MoveTicket>, SyncError> {
        if !self.stages.iter().any(|s| s == to) {
            return Err(SyncError::UnknownStage(to.to_string()));
        }
        let stages = &self.stages;
        let lead = self
            .leads
            .iter_mut()
            .find(|l| l.id == lead_id)
            .ok_or_else(|| SyncError::NotFound(lead_id.to_string()))?;

        if BucketKey::for_status(lead.status.as_deref(), stages) == BucketKey::Stage(to.to_string()) {
            return Ok(None);
        }

        let from = lead.status.replace(to.to_string());
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending_moves.insert(
            lead_id.to_string(),
            PendingMove {
                seq,
                to: to.to_string(),
            },
        );
        log::debug!("Board: moved {} {:?} -> {} (optimistic)", lead_id, from, to);

        Ok(Some(MoveTicket {
            lead_id: lead_id.to_string(),
            from,
            to: to.to_string(),
            seq,
        }))
    }

    /// The status write succeeded.
    pub fn settle_move(&mut self, ticket: &MoveTicket) {
        if self.is_current(ticket) {
            self.pending_moves.remove(&ticket.lead_id);
        }
    }

    /// The status write failed. Reverts unless a newer move superseded it.
    pub fn fail_move(&mut self, ticket: &MoveTicket) -> bool {
        if !self.is_current(ticket) {
            log::info!(
                "Board: move of {} to {} failed but was superseded; not reverting",
                ticket.lead_id,
                ticket.to
            );
            return false;
        }
        self.pending_moves.remove(&ticket.lead_id);
        if let Some(lead) = self.leads.iter_mut().find(|l| l.id == ticket.lead_id) {
            lead.status = ticket.from.clone();
            log::info!("Board: reverted {} to {:?}", ticket.lead_id, ticket.from);
            return true;
        }
        false
    }

    /// Swap in an edited copy of a lead. Returns the previous copy.
    pub fn replace_lead(&mut self, lead: Lead) -> Option<Lead> {
        let slot = self.leads.iter_mut().find(|l| l.id == lead.id)?;
        Some(std::mem::replace(slot, lead))
    }

    fn is_current(&self, ticket: &MoveTicket) -> bool {
        self.pending_moves
            .get(&ticket.lead_id)
            .is_some_and(|p| p.seq == ticket.seq)
    }
}
