//! Conversation write authority.
//!
//! Every lead starts agent-controlled. An operator takeover flips the lead's
//! `intervencion_humana` flag; from then on the operator may reply and the
//! dashboard never hands control back on its own.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::SyncError;
use crate::types::{Author, Lead};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandoffState {
    AgentControlled,
    OperatorControlled,
}

impl HandoffState {
    pub fn of(lead: &Lead) -> Self {
        if lead.handoff_active {
            HandoffState::OperatorControlled
        } else {
            HandoffState::AgentControlled
        }
    }

    /// Whether the compose box should be offered.
    pub fn can_compose(self) -> bool {
        self == HandoffState::OperatorControlled
    }
}

/// Author for a manual reply on `lead`, or `HandoffRequired`.
pub fn authorize_send(lead: &Lead) -> Result<Author, SyncError> {
    match HandoffState::of(lead) {
        HandoffState::OperatorControlled => Ok(Author::Operator),
        HandoffState::AgentControlled => Err(SyncError::HandoffRequired(lead.id.clone())),
    }
}

/// Tracks takeovers whose write has not resolved yet.
#[derive(Debug, Clone, Default)]
pub struct HandoffGate {
    in_flight: HashSet<String>,
}

impl HandoffGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the lead locally. Returns false when it is already operator-controlled.
    pub fn begin(&mut self, lead: &mut Lead) -> bool {
        if lead.handoff_active {
            return false;
        }
        lead.handoff_active = true;
        self.in_flight.insert(lead.id.clone());
        log::info!("Handoff: operator taking over {}", lead.id);
        true
    }

    pub fn settle(&mut self, lead_id: &str) {
        self.in_flight.remove(lead_id);
    }

    /// The write failed: hand the lead back to the agent locally.
    pub fn fail(&mut self, lead: Option<&mut Lead>, lead_id: &str) {
        if !self.in_flight.remove(lead_id) {
            return;
        }
        if let Some(lead) = lead {
            lead.handoff_active = false;
            log::warn!("Handoff: takeover of {} not saved, reverted", lead_id);
        }
    }

    pub fn is_pending(&self, lead_id: &str) -> bool {
        self.in_flight.contains(lead_id)
    }

    /// Keep in-flight takeovers visible over a snapshot that predates them.
    pub fn overlay(&self, leads: &mut [Lead]) {
        for lead in leads.iter_mut().filter(|l| self.in_flight.contains(&l.id)) {
            lead.handoff_active = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_agent_controlled() {
        let lead = Lead::new("L2");
        assert_eq!(HandoffState::of(&lead), HandoffState::AgentControlled);
        assert!(!HandoffState::of(&lead).can_compose());
        assert_eq!(
            authorize_send(&lead).unwrap_err(),
            SyncError::HandoffRequired("L2".into())
        );
    }

    #[test]
    fn test_takeover_attributes_operator() {
        let mut gate = HandoffGate::new();
        let mut lead = Lead::new("L2");
        assert!(gate.begin(&mut lead));
        assert_eq!(authorize_send(&lead).unwrap(), Author::Operator);
    }

    #[test]
    fn test_takeover_is_idempotent() {
        let mut gate = HandoffGate::new();
        let mut lead = Lead::new("L2");
        assert!(gate.begin(&mut lead));
        gate.settle("L2");
        assert!(!gate.begin(&mut lead));
        assert!(!gate.is_pending("L2"));
    }

    #[test]
    fn test_failed_takeover_reverts() {
        let mut gate = HandoffGate::new();
        let mut lead = Lead::new("L2");
        gate.begin(&mut lead);
        gate.fail(Some(&mut lead), "L2");
        assert_eq!(HandoffState::of(&lead), HandoffState::AgentControlled);
    }

    #[test]
    fn test_overlay_only_touches_in_flight() {
        let mut gate = HandoffGate::new();
        let mut l2 = Lead::new("L2");
        gate.begin(&mut l2);

        let mut snapshot = vec![Lead::new("L1"), Lead::new("L2")];
        gate.overlay(&mut snapshot);
        assert!(!snapshot[0].handoff_active);
        assert!(snapshot[1].handoff_active);

        gate.settle("L2");
        let mut snapshot = vec![Lead::new("L2")];
        gate.overlay(&mut snapshot);
        assert!(!snapshot[0].handoff_active);
    }
}
