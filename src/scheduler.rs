//! Refresh scheduling for the board and the open conversation.
//!
//! Each active resource gets:
//! - an immediate first refresh on activation
//! - a poll ticker (when an interval is configured)
//! - a change-feed listener (when push is enabled and the store has a feed)
//!
//! All three feed one coalescing gate: at most one fetch per resource is in
//! flight, and any number of triggers during that fetch collapse into a single
//! follow-up. Deactivating a resource aborts its ticker, listener and fetch;
//! a fetch that completes for a stale activation is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::DeskConfig;
use crate::error::SyncError;
use crate::gateway::RemoteStore;
use crate::types::{ChangeEvent, ChangeFilter, Lead, Message, Table};

/// Something the scheduler keeps fresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The full lead collection and stage list.
    Board,
    /// One lead's conversation.
    Timeline(String),
}

impl Resource {
    fn table(&self) -> Table {
        match self {
            Resource::Board => Table::Leads,
            Resource::Timeline(_) => Table::Conversations,
        }
    }

    fn filter(&self) -> Option<ChangeFilter> {
        match self {
            Resource::Board => None,
            Resource::Timeline(lead_id) => Some(ChangeFilter::eq("lead_id", lead_id)),
        }
    }

    fn poll_interval(&self, config: &DeskConfig) -> Option<Duration> {
        match self {
            Resource::Board => config.board_poll_interval(),
            Resource::Timeline(_) => config.timeline_poll_interval(),
        }
    }

    fn is_affected_by(&self, event: &ChangeEvent) -> bool {
        event.table == self.table()
            && self.filter().map_or(true, |f| f.matches(&event.row))
    }
}

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Activated,
    Tick,
    Push,
    Manual,
}

/// Result of one fetch, handed to the sink.
#[derive(Debug)]
pub enum Snapshot {
    Board {
        leads: Result<Vec<Lead>, SyncError>,
        /// `None` when the stage list could not be read this round.
        stages: Option<Vec<String>>,
    },
    Timeline {
        lead_id: String,
        messages: Result<Vec<Message>, SyncError>,
    },
}

/// Receives fetched snapshots for still-active resources.
pub trait SnapshotSink: Send + Sync + 'static {
    /// Fold a snapshot into local state. Returns resources that should be
    /// deactivated as a consequence (e.g. the timeline of a vanished lead).
    fn apply(&self, snapshot: Snapshot) -> Vec<Resource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No fetch in flight: start one now.
    Start,
    /// A fetch is in flight: one follow-up is now scheduled.
    Coalesced,
}

/// Coalescing admission for one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshGate {
    in_flight: bool,
    follow_up: bool,
}

impl RefreshGate {
    pub fn request(&mut self) -> Admission {
        if self.in_flight {
            self.follow_up = true;
            Admission::Coalesced
        } else {
            self.in_flight = true;
            Admission::Start
        }
    }

    /// The in-flight fetch finished. Returns true if a follow-up should run,
    /// in which case the gate stays in flight for it.
    pub fn finish(&mut self) -> bool {
        if self.follow_up {
            self.follow_up = false;
            true
        } else {
            self.in_flight = false;
            false
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

struct Slot {
    generation: u64,
    gate: RefreshGate,
    watchers: Vec<JoinHandle<()>>,
    in_flight: Option<JoinHandle<()>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        for handle in self.watchers.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

struct SchedulerInner {
    store: Arc<dyn RemoteStore>,
    sink: Arc<dyn SnapshotSink>,
    config: DeskConfig,
    slots: Mutex<HashMap<Resource, Slot>>,
    next_generation: AtomicU64,
}

impl SchedulerInner {
    /// Request a refresh for the given activation. Returns false if that
    /// activation is gone.
    fn trigger_if_current(
        self: &Arc<Self>,
        resource: &Resource,
        generation: Option<u64>,
        cause: Trigger,
    ) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(resource) else {
            log::debug!("Scheduler: {:?} trigger for inactive {:?} ignored", cause, resource);
            return false;
        };
        if generation.is_some_and(|g| g != slot.generation) {
            return false;
        }
        match slot.gate.request() {
            Admission::Start => {
                log::debug!("Scheduler: refreshing {:?} ({:?})", resource, cause);
                slot.in_flight = Some(tokio::spawn(run_refresh(
                    Arc::downgrade(self),
                    resource.clone(),
                    slot.generation,
                )));
            }
            Admission::Coalesced => {
                log::debug!("Scheduler: {:?} trigger for {:?} coalesced", cause, resource);
            }
        }
        true
    }

    async fn fetch(&self, resource: &Resource) -> Snapshot {
        let limit = self.config.fetch_timeout();
        match resource {
            Resource::Board => {
                let leads = bounded(limit, self.store.list_leads()).await;
                let stages = if leads.is_ok() {
                    match bounded(limit, self.store.list_stages()).await {
                        Ok(stages) => Some(stages),
                        Err(e) => {
                            log::warn!("Scheduler: stage list fetch failed, keeping previous: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };
                Snapshot::Board { leads, stages }
            }
            Resource::Timeline(lead_id) => Snapshot::Timeline {
                lead_id: lead_id.clone(),
                messages: bounded(limit, self.store.list_messages(lead_id)).await,
            },
        }
    }

    fn deactivate(&self, resource: &Resource) -> bool {
        let removed = self.slots.lock().remove(resource);
        match removed {
            Some(slot) => {
                log::debug!("Scheduler: deactivated {:?} (generation {})", resource, slot.generation);
                drop(slot);
                true
            }
            None => false,
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(limit.as_millis() as u64)),
    }
}

async fn run_refresh(inner: Weak<SchedulerInner>, resource: Resource, generation: u64) {
    loop {
        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        let snapshot = scheduler.fetch(&resource).await;

        let follow_up = {
            let mut slots = scheduler.slots.lock();
            match slots.get_mut(&resource) {
                Some(slot) if slot.generation == generation => {
                    let again = slot.gate.finish();
                    if !again {
                        slot.in_flight = None;
                    }
                    again
                }
                _ => {
                    log::debug!("Scheduler: discarding stale refresh for {:?}", resource);
                    return;
                }
            }
        };

        let retired = scheduler.sink.apply(snapshot);
        for stale in retired {
            scheduler.deactivate(&stale);
        }

        if !follow_up {
            return;
        }
        log::debug!("Scheduler: running coalesced follow-up for {:?}", resource);
    }
}

async fn run_ticker(inner: Weak<SchedulerInner>, resource: Resource, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        if !scheduler.trigger_if_current(&resource, Some(generation), Trigger::Tick) {
            return;
        }
    }
}

async fn run_feed(inner: Weak<SchedulerInner>, resource: Resource, generation: u64) {
    let store = match inner.upgrade() {
        Some(scheduler) => scheduler.store.clone(),
        None => return,
    };
    let mut subscription = match store.subscribe(resource.table(), resource.filter()).await {
        Ok(subscription) => subscription,
        Err(SyncError::Unsupported) => {
            log::debug!("Scheduler: no change feed for {:?}, polling only", resource);
            return;
        }
        Err(e) => {
            log::warn!("Scheduler: subscribe for {:?} failed, polling only: {}", resource, e);
            return;
        }
    };
    log::debug!("Scheduler: subscribed to {} for {:?}", resource.table(), resource);

    while let Some(event) = subscription.next().await {
        if !resource.is_affected_by(&event) {
            continue;
        }
        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        if !scheduler.trigger_if_current(&resource, Some(generation), Trigger::Push) {
            return;
        }
    }
    log::debug!("Scheduler: change feed for {:?} closed", resource);
}

/// Owns every refresh task. Dropping it tears all of them down.
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    pub fn new(store: Arc<dyn RemoteStore>, sink: Arc<dyn SnapshotSink>, config: DeskConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                sink,
                config,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start keeping `resource` fresh. No-op if it is already active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn activate(&self, resource: Resource) {
        {
            let mut slots = self.inner.slots.lock();
            if slots.contains_key(&resource) {
                return;
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let mut watchers = Vec::new();
            let weak = Arc::downgrade(&self.inner);

            if let Some(period) = resource.poll_interval(&self.inner.config) {
                watchers.push(tokio::spawn(run_ticker(
                    weak.clone(),
                    resource.clone(),
                    generation,
                    period,
                )));
            }
            if self.inner.config.push_enabled {
                watchers.push(tokio::spawn(run_feed(weak, resource.clone(), generation)));
            }

            slots.insert(
                resource.clone(),
                Slot {
                    generation,
                    gate: RefreshGate::default(),
                    watchers,
                    in_flight: None,
                },
            );
            log::info!("Scheduler: activated {:?} (generation {})", resource, generation);
        }
        self.inner
            .trigger_if_current(&resource, None, Trigger::Activated);
    }

    /// Stop refreshing `resource`, aborting any fetch in flight.
    pub fn deactivate(&self, resource: &Resource) -> bool {
        self.inner.deactivate(resource)
    }

    /// Ask for a refresh now; coalesced with any fetch in flight.
    pub fn refresh(&self, resource: &Resource) -> bool {
        self.inner.trigger_if_current(resource, None, Trigger::Manual)
    }

    pub fn is_active(&self, resource: &Resource) -> bool {
        self.inner.slots.lock().contains_key(resource)
    }

    pub fn is_refreshing(&self, resource: &Resource) -> bool {
        self.inner
            .slots
            .lock()
            .get(resource)
            .is_some_and(|slot| slot.gate.is_in_flight())
    }

    pub fn active(&self) -> Vec<Resource> {
        self.inner.slots.lock().keys().cloned().collect()
    }

    /// Deactivate everything.
    pub fn shutdown(&self) {
        let slots: Vec<Slot> = self.inner.slots.lock().drain().map(|(_, slot)| slot).collect();
        if !slots.is_empty() {
            log::info!("Scheduler: shutting down {} resources", slots.len());
        }
        drop(slots);
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
