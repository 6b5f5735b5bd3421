//! conveyor: pipeline orchestration with quota-governed stage execution.
//!
//! This library drives an ordered sequence of external stage processes,
//! broadcasts their output and lifecycle transitions as sequenced events,
//! schedules recurring runs, and tracks a persistent daily quota shared
//! with the stage processes.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod quota;
pub mod run;
pub mod scheduler;
pub mod supervisor;

// Re-export commonly used types
pub use config::{ConfigError, OrchestratorConfig, StageSpec};
pub use error::ControlError;
pub use event::{LogEvent, PipelineEvent, QuotaEvent, TransitionEvent};
pub use hub::{EventFilter, EventHub, Subscription};
pub use quota::{QuotaError, QuotaGuard, QuotaStore, QuotaWatcher};
pub use run::{Run, RunCoordinator, RunStatus, TriggerOptions};
pub use scheduler::{ScheduleError, Scheduler};
pub use supervisor::{StageSupervisor, SupervisorError};
