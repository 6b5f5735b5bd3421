//! Structured events published by the orchestration engine.
//!
//! All observer-visible facts flow through these types: captured output
//! lines, run status transitions, and quota updates. Ordering within a run
//! is carried by `LogEvent::sequence`; timestamps are advisory only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;

/// Which output stream of a stage process a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured output line from a stage process.
///
/// Immutable once emitted. `sequence` is monotonic per run and is the
/// authoritative ordering for every observer of that run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Run this line belongs to.
    pub run_id: Uuid,
    /// Name of the stage that produced the line.
    pub stage: String,
    /// Monotonic per-run sequence number assigned by the supervisor.
    pub sequence: u64,
    /// Stream the line arrived on.
    pub stream: StreamKind,
    /// The line content, without the trailing newline.
    pub text: String,
    /// Capture time (advisory; ordering is by `sequence`).
    pub timestamp: DateTime<Utc>,
}

/// Reason code attached to a terminal run transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionReason {
    /// The active stage exited with a non-zero code (or failed to spawn,
    /// in which case `exit_code` is absent).
    StageFailed {
        stage: String,
        exit_code: Option<i32>,
    },
    /// The active stage produced no output for longer than the configured
    /// idle timeout and was terminated.
    StageStalled { stage: String },
    /// An observer requested cancellation.
    Cancelled,
}

/// A run status transition, published after the log lines that causally
/// precede it within the same stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub run_id: Uuid,
    pub from: RunStatus,
    pub to: RunStatus,
    /// Index of the stage the run is at after this transition.
    pub stage_index: usize,
    /// Present on Failed and Cancelled transitions.
    pub reason: Option<TransitionReason>,
    pub timestamp: DateTime<Utc>,
}

/// Published remaining-budget snapshot from the quota guard.
///
/// `threshold` is set when this event marks a warning threshold being
/// crossed for the first time today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaEvent {
    pub call_count: u32,
    pub remaining: u32,
    pub limit: u32,
    pub threshold: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Envelope for everything delivered to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Log(LogEvent),
    Transition(TransitionEvent),
    Quota(QuotaEvent),
}

impl PipelineEvent {
    /// The run this event belongs to, if it is run-scoped.
    ///
    /// Quota events are process-wide and return `None`.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            PipelineEvent::Log(e) => Some(e.run_id),
            PipelineEvent::Transition(e) => Some(e.run_id),
            PipelineEvent::Quota(_) => None,
        }
    }
}
