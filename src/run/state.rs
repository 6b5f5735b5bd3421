//! Run and stage lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a pipeline run.
///
/// `Succeeded`, `Failed` and `Cancelled` are terminal and immutable once
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Queued => write!(f, "queued"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Running,
    Success,
    Failure,
    Cancelled,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutcome::Running => write!(f, "running"),
            StageOutcome::Success => write!(f, "success"),
            StageOutcome::Failure => write!(f, "failure"),
            StageOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a stage failed, when it did.
///
/// Distinguishes a crash from a stall so operational tooling can decide
/// whether a re-trigger is worthwhile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailureKind {
    /// The process exited with a non-zero code.
    NonZeroExit,
    /// The process produced no output for longer than the idle timeout.
    Stalled,
    /// The process could not be launched at all.
    SpawnFailed,
}

/// Per-stage outcome record, owned exclusively by its parent [`Run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code of the stage process; absent while running or when the
    /// process was killed before exiting normally.
    pub exit_code: Option<i32>,
    pub outcome: StageOutcome,
    /// Present when `outcome` is `Failure`.
    pub failure: Option<StageFailureKind>,
}

impl StageResult {
    /// Creates a record for a stage that just started.
    pub fn running(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            outcome: StageOutcome::Running,
            failure: None,
        }
    }

    /// Marks the stage as succeeded.
    pub fn succeeded(mut self, exit_code: i32) -> Self {
        self.ended_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
        self.outcome = StageOutcome::Success;
        self
    }

    /// Marks the stage as failed.
    pub fn failed(mut self, exit_code: Option<i32>, kind: StageFailureKind) -> Self {
        self.ended_at = Some(Utc::now());
        self.exit_code = exit_code;
        self.outcome = StageOutcome::Failure;
        self.failure = Some(kind);
        self
    }

    /// Marks the stage as cancelled.
    pub fn cancelled(mut self) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = StageOutcome::Cancelled;
        self
    }
}

/// One end-to-end execution of the ordered stage sequence.
///
/// Created by a trigger (manual or scheduled) and mutated only by the run
/// coordinator. Retained in the registry until evicted by the bounded
/// oldest-first history policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Index into the run's stage sequence of the stage currently (or
    /// last) executing.
    pub current_stage_index: usize,
    pub stage_results: Vec<StageResult>,
}

impl Run {
    /// Creates a new queued run.
    pub fn queued() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Queued,
            current_stage_index: 0,
            stage_results: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_stage_result_lifecycle() {
        let result = StageResult::running("compose-products");
        assert_eq!(result.outcome, StageOutcome::Running);
        assert!(result.ended_at.is_none());
        assert!(result.exit_code.is_none());

        let done = result.succeeded(0);
        assert_eq!(done.outcome, StageOutcome::Success);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.ended_at.is_some());
    }

    #[test]
    fn test_stage_result_failure_kinds() {
        let crashed =
            StageResult::running("upload").failed(Some(3), StageFailureKind::NonZeroExit);
        assert_eq!(crashed.failure, Some(StageFailureKind::NonZeroExit));
        assert_eq!(crashed.exit_code, Some(3));

        let stalled = StageResult::running("upload").failed(None, StageFailureKind::Stalled);
        assert_eq!(stalled.failure, Some(StageFailureKind::Stalled));
        assert!(stalled.exit_code.is_none());
    }

    #[test]
    fn test_new_run_is_queued() {
        let run = Run::queued();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.current_stage_index, 0);
        assert!(run.stage_results.is_empty());
        assert!(run.ended_at.is_none());
    }
}
