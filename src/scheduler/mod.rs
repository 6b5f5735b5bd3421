//! Cron-style scheduler.
//!
//! Registers recurring triggers against the run coordinator, keyed by
//! pipeline name. Each registration owns one background task that sleeps
//! until the next occurrence of its cron expression and then triggers a
//! run. An occurrence that lands while a run is still active is skipped,
//! not queued.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ControlError;
use crate::run::{RunCoordinator, TriggerOptions};

/// Errors raised when registering a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidExpression {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    /// The pipeline name does not match the configured pipeline.
    #[error("unknown pipeline '{0}'")]
    UnknownPipeline(String),
}

struct ScheduleEntry {
    expression: String,
    task: JoinHandle<()>,
}

/// Registers and owns recurring pipeline triggers.
///
/// Dropping the scheduler aborts all registered trigger tasks.
pub struct Scheduler {
    coordinator: Arc<RunCoordinator>,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl Scheduler {
    /// Creates a scheduler that triggers runs on `coordinator`.
    pub fn new(coordinator: Arc<RunCoordinator>) -> Self {
        Self {
            coordinator,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `expression` as the recurring trigger for `pipeline`.
    ///
    /// Replaces any existing registration for the same pipeline; the old
    /// trigger task is stopped before the new one starts.
    pub fn schedule(&self, pipeline: &str, expression: &str) -> Result<(), ScheduleError> {
        if pipeline != self.coordinator.pipeline_name() {
            return Err(ScheduleError::UnknownPipeline(pipeline.to_string()));
        }
        let schedule =
            Schedule::from_str(expression).map_err(|source| ScheduleError::InvalidExpression {
                expression: expression.to_string(),
                source,
            })?;

        let coordinator = Arc::clone(&self.coordinator);
        let name = pipeline.to_string();
        let task = tokio::spawn(run_schedule(coordinator, name, schedule));

        let mut entries = self.lock_entries();
        if let Some(previous) = entries.insert(
            pipeline.to_string(),
            ScheduleEntry {
                expression: expression.to_string(),
                task,
            },
        ) {
            previous.task.abort();
        }
        info!(pipeline, expression, "schedule registered");
        Ok(())
    }

    /// Removes the registration for `pipeline` and stops its trigger task.
    /// Returns whether a registration existed.
    pub fn unschedule(&self, pipeline: &str) -> bool {
        match self.lock_entries().remove(pipeline) {
            Some(entry) => {
                entry.task.abort();
                info!(pipeline, "schedule removed");
                true
            }
            None => false,
        }
    }

    /// The cron expression registered for `pipeline`, if any.
    pub fn expression(&self, pipeline: &str) -> Option<String> {
        self.lock_entries()
            .get(pipeline)
            .map(|entry| entry.expression.clone())
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.entries.lock().expect("scheduler lock poisoned")
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.lock_entries().values() {
            entry.task.abort();
        }
    }
}

/// Sleeps until each upcoming occurrence and triggers a run for it.
async fn run_schedule(coordinator: Arc<RunCoordinator>, pipeline: String, schedule: Schedule) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            info!(pipeline, "schedule has no further occurrences");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        match coordinator.trigger(TriggerOptions::default()) {
            Ok(run_id) => info!(pipeline, run_id = %run_id, "scheduled run triggered"),
            Err(ControlError::AlreadyRunning(_)) => {
                // Skip this occurrence; the next one gets a fresh attempt.
                warn!(pipeline, "previous run still active, skipping occurrence");
            }
            Err(e) => warn!(pipeline, "scheduled trigger failed: {e}"),
        }
    }
}
