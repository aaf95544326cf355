//! Dashboard session: the one place operator intents enter.
//!
//! The session owns the board, the open conversation, the selected lead's
//! draft and the handoff gate behind a single lock, and hands the scheduler a
//! sink that folds fetched snapshots into that state. Intents mutate local
//! state first, release the lock, write to the store, then settle or revert.
//! Observers read snapshots and listen on a broadcast channel of
//! [`DeskSignal`]s.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::board::{Board, BoardModel};
use crate::config::DeskConfig;
use crate::error::SyncError;
use crate::gateway::RemoteStore;
use crate::handoff::{authorize_send, HandoffGate, HandoffState};
use crate::scheduler::{Resource, Snapshot, SnapshotSink, SyncScheduler};
use crate::timeline::{Timeline, LOCAL_ID_PREFIX};
use crate::types::{
    is_truthy, Direction, Lead, LeadPatch, Message, NewMessage, HANDOFF_FIELD, READ_ONLY_FIELDS,
};

/// Notifications for whoever renders the dashboard.
#[derive(Debug, Clone, PartialEq)]
pub enum DeskSignal {
    BoardUpdated,
    TimelineUpdated { lead_id: String },
    /// A refresh failed; the last good view is still shown.
    TransientError { error: SyncError },
    /// An optimistic write was rejected and rolled back.
    WriteReverted { lead_id: String, error: SyncError },
    /// The selected lead is gone from the store.
    LeadVanished { lead_id: String },
}

/// Read-only view of the open conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineView {
    pub lead_id: String,
    pub messages: Vec<Message>,
    pub pending: usize,
    pub loaded: bool,
}

/// Operator edits to the selected lead, keyed by field.
#[derive(Debug, Clone, Default)]
struct LeadDraft {
    lead_id: String,
    edits: Map<String, Value>,
}

impl LeadDraft {
    /// The lead as it would look with the edits applied.
    fn render(&self, base: &Lead) -> Lead {
        let mut lead = base.clone();
        for (key, value) in &self.edits {
            // Read-only keys never get into `edits`.
            let _ = lead.set(key, value.clone());
        }
        lead
    }
}

struct DeskState {
    board: BoardModel,
    handoff: HandoffGate,
    selected: Option<String>,
    draft: Option<LeadDraft>,
    timeline: Option<Timeline>,
}

impl DeskState {
    /// Drop everything tied to the selected lead. Returns its id.
    fn clear_selection(&mut self) -> Option<String> {
        self.draft = None;
        self.timeline = None;
        self.selected.take()
    }
}

struct DeskShared {
    state: Mutex<DeskState>,
    signals: broadcast::Sender<DeskSignal>,
    config: DeskConfig,
}

impl DeskShared {
    fn emit(&self, signal: DeskSignal) {
        // No receivers is fine.
        let _ = self.signals.send(signal);
    }

    fn emit_all(&self, signals: Vec<DeskSignal>) {
        for signal in signals {
            self.emit(signal);
        }
    }

    fn apply_board(&self, leads: Result<Vec<Lead>, SyncError>, stages: Option<Vec<String>>) -> Vec<Resource> {
        let leads = match leads {
            Ok(leads) => leads,
            Err(error) => {
                log::warn!("Board: refresh failed, keeping last view: {}", error);
                self.emit(DeskSignal::TransientError { error });
                return Vec::new();
            }
        };

        let mut signals = Vec::new();
        let mut retired = Vec::new();
        {
            let mut state = self.state.lock();
            let mut changed = stages.map_or(false, |s| state.board.set_stages(s));
            changed |= state.board.apply_snapshot(leads);
            let DeskState { board, handoff, .. } = &mut *state;
            handoff.overlay(board.leads_mut());

            let vanished = state
                .selected
                .as_deref()
                .is_some_and(|id| state.board.lead(id).is_none());
            if vanished {
                if let Some(id) = state.clear_selection() {
                    log::info!("Board: selected lead {} no longer exists", id);
                    retired.push(Resource::Timeline(id.clone()));
                    signals.push(DeskSignal::LeadVanished { lead_id: id });
                }
            }
            if changed {
                signals.insert(0, DeskSignal::BoardUpdated);
            }
        }
        self.emit_all(signals);
        retired
    }

    fn apply_timeline(&self, lead_id: String, messages: Result<Vec<Message>, SyncError>) -> Vec<Resource> {
        let mut state = self.state.lock();
        let Some(timeline) = state.timeline.as_mut().filter(|t| t.lead_id() == lead_id) else {
            log::debug!("Timeline: dropping snapshot for {}, no longer open", lead_id);
            return Vec::new();
        };

        if let Err(SyncError::NotFound(_)) = &messages {
            state.clear_selection();
            drop(state);
            log::info!("Timeline: lead {} no longer exists", lead_id);
            self.emit(DeskSignal::LeadVanished {
                lead_id: lead_id.clone(),
            });
            return vec![Resource::Timeline(lead_id)];
        }

        let outcome = timeline.apply_snapshot(messages);
        drop(state);
        match outcome {
            Ok(true) => self.emit(DeskSignal::TimelineUpdated { lead_id }),
            Ok(false) => {}
            Err(error) => self.emit(DeskSignal::TransientError { error }),
        }
        Vec::new()
    }
}

impl SnapshotSink for DeskShared {
    fn apply(&self, snapshot: Snapshot) -> Vec<Resource> {
        match snapshot {
            Snapshot::Board { leads, stages } => self.apply_board(leads, stages),
            Snapshot::Timeline { lead_id, messages } => self.apply_timeline(lead_id, messages),
        }
    }
}

/// One operator's view of the pipeline.
pub struct DashboardSession {
    store: Arc<dyn RemoteStore>,
    shared: Arc<DeskShared>,
    scheduler: SyncScheduler,
}

impl DashboardSession {
    pub fn new(store: Arc<dyn RemoteStore>, config: DeskConfig) -> Self {
        let (signals, _) = broadcast::channel(config.signal_buffer.max(1));
        let shared = Arc::new(DeskShared {
            state: Mutex::new(DeskState {
                board: BoardModel::new(config.stages.clone(), &config.unclassified_label),
                handoff: HandoffGate::new(),
                selected: None,
                draft: None,
                timeline: None,
            }),
            signals,
            config: config.clone(),
        });
        let scheduler = SyncScheduler::new(store.clone(), shared.clone(), config);
        Self {
            store,
            shared,
            scheduler,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeskSignal> {
        self.shared.signals.subscribe()
    }

    /// Begin keeping the board fresh. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        log::info!("Session: starting");
        self.scheduler.activate(Resource::Board);
    }

    /// Stop all refresh activity. Snapshots stay readable.
    pub fn stop(&self) {
        log::info!("Session: stopping");
        self.scheduler.shutdown();
    }

    /// Ask for a board refresh now. Returns false before `start`.
    pub fn refresh_board(&self) -> bool {
        self.scheduler.refresh(&Resource::Board)
    }

    pub fn board(&self) -> Board {
        self.shared.state.lock().board.board()
    }

    pub fn stages(&self) -> Vec<String> {
        self.shared.state.lock().board.stages().to_vec()
    }

    pub fn lead(&self, lead_id: &str) -> Option<Lead> {
        self.shared.state.lock().board.lead(lead_id).cloned()
    }

    pub fn timeline(&self) -> Option<TimelineView> {
        let state = self.shared.state.lock();
        state.timeline.as_ref().map(|t| TimelineView {
            lead_id: t.lead_id().to_string(),
            messages: t.messages().to_vec(),
            pending: t.pending().len(),
            loaded: t.is_loaded(),
        })
    }

    pub fn handoff(&self, lead_id: &str) -> Option<HandoffState> {
        self.shared.state.lock().board.lead(lead_id).map(HandoffState::of)
    }

    pub fn selected(&self) -> Option<String> {
        self.shared.state.lock().selected.clone()
    }

    /// The selected lead with unsaved edits applied.
    pub fn draft(&self) -> Option<Lead> {
        let state = self.shared.state.lock();
        let draft = state.draft.as_ref()?;
        state.board.lead(&draft.lead_id).map(|lead| draft.render(lead))
    }

    /// Open a lead: fresh draft, and its conversation starts syncing.
    ///
    /// Switching leads retires the previous conversation before the new one
    /// is activated, so its late responses are discarded.
    pub fn select_lead(&self, lead_id: &str) -> Result<(), SyncError> {
        let previous = {
            let mut state = self.shared.state.lock();
            if state.board.lead(lead_id).is_none() {
                return Err(SyncError::NotFound(lead_id.to_string()));
            }
            if state.selected.as_deref() == Some(lead_id) {
                state.draft = Some(LeadDraft {
                    lead_id: lead_id.to_string(),
                    ..LeadDraft::default()
                });
                None
            } else {
                let previous = state.clear_selection();
                state.selected = Some(lead_id.to_string());
                state.draft = Some(LeadDraft {
                    lead_id: lead_id.to_string(),
                    ..LeadDraft::default()
                });
                state.timeline = Some(Timeline::new(lead_id, self.shared.config.confirm_window()));
                Some(previous)
            }
        };

        match previous {
            // Same lead again: only the draft resets.
            None => {
                self.scheduler.refresh(&Resource::Timeline(lead_id.to_string()));
            }
            Some(previous) => {
                if let Some(old) = previous {
                    self.scheduler.deactivate(&Resource::Timeline(old));
                }
                log::info!("Session: opened lead {}", lead_id);
                self.scheduler.activate(Resource::Timeline(lead_id.to_string()));
            }
        }
        Ok(())
    }

    /// Close the open lead, discarding unsaved edits.
    pub fn deselect_lead(&self) {
        let previous = self.shared.state.lock().clear_selection();
        if let Some(id) = previous {
            self.scheduler.deactivate(&Resource::Timeline(id));
        }
    }

    /// Close `lead_id` only if it is still the open lead.
    fn deselect_if(&self, lead_id: &str) -> bool {
        let previous = {
            let mut state = self.shared.state.lock();
            if state.selected.as_deref() != Some(lead_id) {
                return false;
            }
            state.clear_selection()
        };
        if let Some(id) = previous {
            self.scheduler.deactivate(&Resource::Timeline(id));
        }
        true
    }

    /// Stage an edit on the selected lead's draft.
    ///
    /// Setting the handoff flag takes the conversation over immediately;
    /// clearing it is refused once the operator has control.
    pub async fn edit_field(&self, lead_id: &str, key: &str, value: Value) -> Result<(), SyncError> {
        if READ_ONLY_FIELDS.contains(&key) {
            return Err(SyncError::ReadOnlyField(key.to_string()));
        }
        if key == HANDOFF_FIELD {
            if is_truthy(&value) {
                return self.take_over(lead_id).await;
            }
            return match self.handoff(lead_id) {
                Some(HandoffState::OperatorControlled) => Err(SyncError::HandoffIrreversible),
                Some(HandoffState::AgentControlled) => Ok(()),
                None => Err(SyncError::NotFound(lead_id.to_string())),
            };
        }

        let mut state = self.shared.state.lock();
        match state.draft.as_mut().filter(|d| d.lead_id == lead_id) {
            Some(draft) => {
                draft.edits.insert(key.to_string(), value);
                Ok(())
            }
            None => Err(SyncError::NoDraft(lead_id.to_string())),
        }
    }

    /// Write the draft's changes. Closes the lead on success; on failure the
    /// board reverts and the draft is kept for another try.
    pub async fn save_lead(&self, lead_id: &str) -> Result<(), SyncError> {
        let staged = {
            let mut state = self.shared.state.lock();
            let draft = state
                .draft
                .as_ref()
                .filter(|d| d.lead_id == lead_id)
                .ok_or_else(|| SyncError::NoDraft(lead_id.to_string()))?;
            let current = state
                .board
                .lead(lead_id)
                .ok_or_else(|| SyncError::NotFound(lead_id.to_string()))?;
            let edited = draft.render(current);
            let patch = LeadPatch::diff(current, &edited);
            if patch.is_empty() {
                None
            } else {
                let previous = state.board.replace_lead(edited.clone());
                Some((patch, edited, previous))
            }
        };

        let Some((patch, edited, previous)) = staged else {
            log::debug!("Session: nothing to save for {}", lead_id);
            self.deselect_if(lead_id);
            return Ok(());
        };
        self.shared.emit(DeskSignal::BoardUpdated);

        match self.store.update_lead(lead_id, &patch).await {
            Ok(()) => {
                log::info!("Session: saved lead {}", lead_id);
                if !self.deselect_if(lead_id) {
                    log::debug!("Session: {} saved after the operator moved on", lead_id);
                }
                self.scheduler.refresh(&Resource::Board);
                Ok(())
            }
            Err(error) => {
                log::warn!("Session: save of {} failed, reverting: {}", lead_id, error);
                {
                    let mut state = self.shared.state.lock();
                    // A newer snapshot already replaced our optimistic copy.
                    if let Some(previous) = previous.filter(|_| state.board.lead(lead_id) == Some(&edited)) {
                        state.board.replace_lead(previous);
                    }
                }
                self.shared.emit_all(vec![
                    DeskSignal::BoardUpdated,
                    DeskSignal::WriteReverted {
                        lead_id: lead_id.to_string(),
                        error: error.clone(),
                    },
                ]);
                Err(error)
            }
        }
    }

    /// Send a manual reply. Requires operator control of the lead.
    ///
    /// The reply shows up in the open timeline right away and is reconciled
    /// with the stored row once the insert returns.
    pub async fn send_message(&self, lead_id: &str, text: &str) -> Result<Message, SyncError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let (local, author) = {
            let mut state = self.shared.state.lock();
            let lead = state
                .board
                .lead(lead_id)
                .ok_or_else(|| SyncError::NotFound(lead_id.to_string()))?;
            let author = authorize_send(lead)?;
            let local = Message {
                id: format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()),
                lead_id: lead_id.to_string(),
                direction: Direction::Outbound,
                text: text.to_string(),
                timestamp: Utc::now(),
                author: Some(author),
            };
            if let Some(timeline) = open_timeline(&mut state, lead_id) {
                timeline.push_pending(local.clone());
            }
            (local, author)
        };
        self.shared.emit(DeskSignal::TimelineUpdated {
            lead_id: lead_id.to_string(),
        });

        let request = NewMessage {
            lead_id: lead_id.to_string(),
            text: local.text.clone(),
            author,
            sent_at: local.timestamp,
        };
        match self.store.insert_message(&request).await {
            Ok(stored) => {
                if let Some(timeline) = open_timeline(&mut self.shared.state.lock(), lead_id) {
                    timeline.confirm_pending(&local.id, &stored);
                }
                log::debug!("Session: reply {} stored as {}", local.id, stored.id);
                self.scheduler.refresh(&Resource::Timeline(lead_id.to_string()));
                Ok(stored)
            }
            Err(error) => {
                log::warn!("Session: reply to {} not stored: {}", lead_id, error);
                if let Some(timeline) = open_timeline(&mut self.shared.state.lock(), lead_id) {
                    timeline.drop_pending(&local.id);
                }
                self.shared.emit_all(vec![
                    DeskSignal::TimelineUpdated {
                        lead_id: lead_id.to_string(),
                    },
                    DeskSignal::WriteReverted {
                        lead_id: lead_id.to_string(),
                        error: error.clone(),
                    },
                ]);
                Err(error)
            }
        }
    }

    /// Move a lead to another stage column.
    pub async fn move_lead(&self, lead_id: &str, to: &str) -> Result<(), SyncError> {
        let ticket = self.shared.state.lock().board.begin_move(lead_id, to)?;
        let Some(ticket) = ticket else {
            return Ok(());
        };
        self.shared.emit(DeskSignal::BoardUpdated);

        let result = self.store.update_lead(lead_id, &LeadPatch::status(to)).await;
        let outcome = match result {
            Ok(()) => {
                self.shared.state.lock().board.settle_move(&ticket);
                Ok(())
            }
            Err(error) => {
                let reverted = self.shared.state.lock().board.fail_move(&ticket);
                if reverted {
                    self.shared.emit(DeskSignal::BoardUpdated);
                }
                self.shared.emit(DeskSignal::WriteReverted {
                    lead_id: lead_id.to_string(),
                    error: error.clone(),
                });
                Err(error)
            }
        };
        self.scheduler.refresh(&Resource::Board);
        outcome
    }

    /// Take the conversation over from the agent. Idempotent.
    pub async fn take_over(&self, lead_id: &str) -> Result<(), SyncError> {
        let began = {
            let mut state = self.shared.state.lock();
            let DeskState { board, handoff, .. } = &mut *state;
            let lead = board
                .lead_mut(lead_id)
                .ok_or_else(|| SyncError::NotFound(lead_id.to_string()))?;
            handoff.begin(lead)
        };
        if !began {
            return Ok(());
        }
        self.shared.emit(DeskSignal::BoardUpdated);

        match self.store.update_lead(lead_id, &LeadPatch::handoff(true)).await {
            Ok(()) => {
                self.shared.state.lock().handoff.settle(lead_id);
                Ok(())
            }
            Err(error) => {
                {
                    let mut state = self.shared.state.lock();
                    let DeskState { board, handoff, .. } = &mut *state;
                    handoff.fail(board.lead_mut(lead_id), lead_id);
                }
                self.shared.emit_all(vec![
                    DeskSignal::BoardUpdated,
                    DeskSignal::WriteReverted {
                        lead_id: lead_id.to_string(),
                        error: error.clone(),
                    },
                ]);
                Err(error)
            }
        }
    }
}

fn open_timeline<'a>(state: &'a mut DeskState, lead_id: &str) -> Option<&'a mut Timeline> {
    state.timeline.as_mut().filter(|t| t.lead_id() == lead_id)
}
