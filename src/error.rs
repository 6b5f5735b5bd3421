//! Error types for run control operations.
//!
//! Subsystem-specific errors (supervisor, quota, scheduler) live next to
//! their modules; this module holds the taxonomy shared by every surface
//! that triggers or cancels pipeline runs.

use thiserror::Error;
use uuid::Uuid;

use crate::run::RunStatus;

/// Errors returned by the trigger and cancellation surfaces.
///
/// These are always returned synchronously to the caller that issued the
/// request and are never broadcast to observers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Another run for this pipeline is already queued or running.
    #[error("pipeline '{0}' already has a run queued or running")]
    AlreadyRunning(String),

    /// The requested run id does not exist in the registry.
    #[error("run '{0}' not found")]
    NotFound(Uuid),

    /// The run is terminal (or already being cancelled) and cannot be
    /// cancelled again.
    #[error("run '{id}' is {status} and cannot be cancelled")]
    NotCancellable { id: Uuid, status: RunStatus },

    /// A requested stage subset named a stage that is not configured.
    #[error("stage '{0}' is not part of the configured pipeline")]
    UnknownStage(String),
}
