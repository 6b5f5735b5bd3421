//! Run lifecycle: state types and the coordinator that drives them.

pub mod coordinator;
pub mod state;

pub use coordinator::{RunCoordinator, TriggerOptions};
pub use state::{Run, RunStatus, StageFailureKind, StageOutcome, StageResult};
