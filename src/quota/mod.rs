//! Quota guard for the shared daily call budget.
//!
//! This module bounds calls to a rate-limited external dependency used by
//! several pipeline stages. The persisted record (see [`store`]) is the
//! single source of truth; the guard layers on top of it:
//!
//! - per-label accounting and a bounded call history,
//! - one-time-per-day warning threshold notifications, decided inside the
//!   locked record transaction so they fire exactly once even across
//!   concurrent recording processes, and re-derivable after a restart,
//! - at-least-once accounting: a call that was actually made is never
//!   under-counted, even when it cannot be durably saved.
//!
//! The guard tracks and reports quota; it does not block calls it does
//! not mediate directly. [`QuotaWatcher`] covers the other direction:
//! it republishes budget movement caused by other processes to this
//! process's observers.

pub mod store;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::event::{PipelineEvent, QuotaEvent};
use crate::hub::EventHub;

pub use store::{CallRecord, QuotaError, QuotaState, QuotaStore, HISTORY_RETENTION};

/// Result of recording one billable call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReceipt {
    /// Total calls recorded today, including this one.
    pub call_count: u32,
    /// Remaining budget after this call, floored at zero.
    pub remaining: u32,
    /// Calls recorded through this guard instance since it was opened.
    pub session_count: u64,
    /// Warning thresholds crossed by this call, in ascending order.
    pub crossed_thresholds: Vec<u32>,
}

/// Increments that were made but not yet durably saved.
#[derive(Debug, Default)]
struct Unsaved {
    count: u32,
    per_label: BTreeMap<String, u32>,
    history: Vec<store::CallRecord>,
}

/// The quota guard. Shared by all in-process callers; stage processes
/// reach the same budget through the persisted record.
pub struct QuotaGuard {
    store: QuotaStore,
    limit: u32,
    thresholds: Vec<u32>,
    session_count: AtomicU64,
    unsaved: Mutex<Unsaved>,
    hub: Option<EventHub>,
}

impl QuotaGuard {
    /// Opens the guard over `store`, loading today's record.
    pub fn open(
        store: QuotaStore,
        limit: u32,
        mut thresholds: Vec<u32>,
    ) -> Result<Self, QuotaError> {
        thresholds.sort_unstable();
        thresholds.dedup();

        let today = Utc::now().date_naive();
        let state = store.load(limit, today)?;
        info!(
            call_count = state.call_count,
            remaining = state.remaining(),
            limit,
            "quota guard opened"
        );

        Ok(Self {
            store,
            limit,
            thresholds,
            session_count: AtomicU64::new(0),
            unsaved: Mutex::new(Unsaved::default()),
            hub: None,
        })
    }

    /// Attaches a hub; remaining-budget and threshold notifications are
    /// then published to "all"-filter observers.
    pub fn with_hub(mut self, hub: EventHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Records one billable call under `label`.
    ///
    /// Warning threshold crossings are judged inside the locked record
    /// transaction, from the durable count before and after this write, so
    /// each threshold fires exactly once per day no matter how many guard
    /// instances or processes share the record.
    ///
    /// On a persistence failure the error is returned, but the increment
    /// is retained in memory and merged into the next successful persist:
    /// the counter never under-counts a call that was actually made. The
    /// thresholds such a write would have crossed fire with the write that
    /// finally lands it.
    pub fn record_call(&self, label: &str) -> Result<QuotaReceipt, QuotaError> {
        let now = Utc::now();
        let today = now.date_naive();
        let session_count = self.session_count.fetch_add(1, Ordering::SeqCst) + 1;

        // Held across the store transaction so in-process callers observe
        // a consistent unsaved backlog.
        let mut unsaved = self.unsaved.lock().expect("unsaved lock poisoned");

        let attempt = self.store.try_update(self.limit, today, |state| {
            // The unsaved backlog belongs to today only; a rollover means
            // yesterday's budget (and its backlog) was reset.
            if !unsaved.history.is_empty() && unsaved.history[0].timestamp.date_naive() != today {
                *unsaved = Unsaved::default();
            }
            let durable_count = state.call_count;
            state.call_count += unsaved.count;
            for (label, count) in &unsaved.per_label {
                *state.per_function_counts.entry(label.clone()).or_insert(0) += count;
            }
            for record in &unsaved.history {
                state.history.push(record.clone());
            }

            state.record(label, now);
            if state.history.len() > HISTORY_RETENTION {
                let excess = state.history.len() - HISTORY_RETENTION;
                state.history.drain(..excess);
            }
            let crossed = crossed_between(&self.thresholds, durable_count, state.call_count);
            (state.call_count, state.remaining(), crossed)
        });

        let (call_count, remaining, crossed) = match attempt {
            Ok((totals, Ok(()))) => {
                *unsaved = Unsaved::default();
                totals
            }
            Ok((_, Err(e))) | Err(e) => {
                // The call was made; keep the increment until the next
                // successful persist.
                unsaved.count += 1;
                *unsaved.per_label.entry(label.to_string()).or_insert(0) += 1;
                unsaved.history.push(store::CallRecord {
                    label: label.to_string(),
                    timestamp: now,
                });
                drop(unsaved);
                warn!(label, "quota increment kept in memory: {e}");
                return Err(e);
            }
        };
        drop(unsaved);

        self.publish_update(call_count, remaining, &crossed);

        Ok(QuotaReceipt {
            call_count,
            remaining,
            session_count,
            crossed_thresholds: crossed,
        })
    }

    /// Remaining budget for today from the durable record plus any unsaved
    /// in-memory increments.
    pub fn remaining_calls(&self) -> Result<u32, QuotaError> {
        let today = Utc::now().date_naive();
        let state = self.store.load(self.limit, today)?;
        let unsaved = self.unsaved.lock().expect("unsaved lock poisoned");
        Ok(self
            .limit
            .saturating_sub(state.call_count.saturating_add(unsaved.count)))
    }

    /// Whether governed calls should still be issued.
    ///
    /// Reports `false` once the budget is exhausted; a store failure also
    /// reports `false` rather than risking an over-budget call.
    pub fn can_proceed(&self) -> bool {
        match self.remaining_calls() {
            Ok(remaining) => remaining > 0,
            Err(e) => {
                warn!("quota check failed, refusing to proceed: {e}");
                false
            }
        }
    }

    /// Read-only snapshot of today's persisted state.
    pub fn snapshot(&self) -> Result<QuotaState, QuotaError> {
        self.store.load(self.limit, Utc::now().date_naive())
    }

    /// The configured daily limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn publish_update(&self, call_count: u32, remaining: u32, crossed: &[u32]) {
        for &threshold in crossed {
            info!(threshold, call_count, remaining, "quota threshold crossed");
        }
        if let Some(hub) = &self.hub {
            publish_quota(hub, self.limit, call_count, remaining, crossed);
        }
    }
}

/// Thresholds crossed when the durable count moves from `prev` to `next`,
/// ascending. `thresholds` must be sorted.
fn crossed_between(thresholds: &[u32], prev: u32, next: u32) -> Vec<u32> {
    thresholds
        .iter()
        .copied()
        .filter(|&t| prev < t && t <= next)
        .collect()
}

/// Republishes worker-side quota movement to this process's observers.
///
/// Stage workers account their calls against the durable record from
/// their own processes, where no hub exists. The watcher polls the record
/// and, whenever the stored count has moved, publishes a budget update
/// followed by any warning thresholds that movement crossed. Thresholds
/// at or below the count seen on the first poll are treated as already
/// notified, so a restarted orchestrator does not repeat them to its
/// observers.
pub struct QuotaWatcher {
    store: QuotaStore,
    limit: u32,
    thresholds: Vec<u32>,
    hub: EventHub,
}

impl QuotaWatcher {
    /// Creates a watcher over `store` publishing through `hub`.
    pub fn new(store: QuotaStore, limit: u32, mut thresholds: Vec<u32>, hub: EventHub) -> Self {
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            store,
            limit,
            thresholds,
            hub,
        }
    }

    /// Spawns the polling task. Abort the returned handle to stop
    /// watching.
    pub fn spawn(self, poll_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(self.run(poll_interval))
    }

    async fn run(self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        let mut seen: Option<(NaiveDate, u32)> = None;
        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();
            let state = match self.store.load(self.limit, today) {
                Ok(state) => state,
                Err(e) => {
                    warn!("quota record poll failed: {e}");
                    continue;
                }
            };

            let crossed = match seen {
                // Startup snapshot: publish the budget once, but do not
                // replay thresholds the day already passed.
                None => Vec::new(),
                Some((date, count)) if date == state.date && count == state.call_count => {
                    continue;
                }
                Some((date, count)) => {
                    let prev = if date == state.date { count } else { 0 };
                    crossed_between(&self.thresholds, prev, state.call_count)
                }
            };
            seen = Some((state.date, state.call_count));

            for &threshold in &crossed {
                info!(
                    threshold,
                    call_count = state.call_count,
                    "quota threshold crossed by stage workers"
                );
            }
            publish_quota(
                &self.hub,
                self.limit,
                state.call_count,
                state.remaining(),
                &crossed,
            );
        }
    }
}

fn publish_quota(hub: &EventHub, limit: u32, call_count: u32, remaining: u32, crossed: &[u32]) {
    hub.publish(PipelineEvent::Quota(QuotaEvent {
        call_count,
        remaining,
        limit,
        threshold: None,
        timestamp: Utc::now(),
    }));
    for &threshold in crossed {
        hub.publish(PipelineEvent::Quota(QuotaEvent {
            call_count,
            remaining,
            limit,
            threshold: Some(threshold),
            timestamp: Utc::now(),
        }));
    }
}
