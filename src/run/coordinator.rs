//! Run coordinator: the pipeline's state machine and run registry.
//!
//! One driver task per run walks the stage sequence, asking the
//! supervisor to execute each stage and publishing status transitions
//! through the hub. The registry of known runs is mutated here and only
//! here; the hub and scheduler only read run status.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, OrchestratorConfig, StageSpec};
use crate::error::ControlError;
use crate::event::{PipelineEvent, TransitionEvent, TransitionReason};
use crate::hub::EventHub;
use crate::supervisor::{StageCanceller, StageExit, StageSupervisor};

use super::state::{Run, RunStatus, StageFailureKind, StageResult};

/// Options accepted by the trigger surface.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Restrict the run to this subset of configured stages, keeping the
    /// configured order. `None` runs the full pipeline.
    pub stages: Option<Vec<String>>,
    /// Extra environment variables applied to every stage of this run,
    /// overriding stage-level values.
    pub extra_env: Vec<(String, String)>,
}

struct ActiveStage {
    run_id: Uuid,
    canceller: StageCanceller,
}

#[derive(Default)]
struct Registry {
    runs: HashMap<Uuid, Run>,
    /// Creation order, oldest first, for history eviction.
    order: VecDeque<Uuid>,
    cancel_flags: HashMap<Uuid, Arc<AtomicBool>>,
    active_stage: Option<ActiveStage>,
}

/// Coordinates pipeline runs: trigger, cancellation, sequencing and the
/// bounded run history.
pub struct RunCoordinator {
    config: OrchestratorConfig,
    hub: EventHub,
    supervisor: StageSupervisor,
    registry: Mutex<Registry>,
}

impl RunCoordinator {
    /// Creates a coordinator over a validated configuration.
    pub fn new(config: OrchestratorConfig, hub: EventHub) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let supervisor =
            StageSupervisor::new(config.grace_period(), config.idle_timeout(), hub.clone());
        Ok(Arc::new(Self {
            config,
            hub,
            supervisor,
            registry: Mutex::new(Registry::default()),
        }))
    }

    /// The hub this coordinator publishes through.
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Name of the pipeline this coordinator drives.
    pub fn pipeline_name(&self) -> &str {
        &self.config.pipeline_name
    }

    /// Starts a new run.
    ///
    /// Fails with [`ControlError::AlreadyRunning`] while another run is
    /// queued or running: overlapping runs would contend for the same
    /// external resources.
    pub fn trigger(self: &Arc<Self>, options: TriggerOptions) -> Result<Uuid, ControlError> {
        let stages = self.resolve_stages(options.stages.as_deref())?;

        let run = Run::queued();
        let run_id = run.id;
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut registry = self.lock_registry();
            if registry.runs.values().any(|r| !r.status.is_terminal()) {
                return Err(ControlError::AlreadyRunning(
                    self.config.pipeline_name.clone(),
                ));
            }
            registry.runs.insert(run_id, run);
            registry.order.push_back(run_id);
            registry.cancel_flags.insert(run_id, flag.clone());
            self.evict_locked(&mut registry);
        }

        info!(run_id = %run_id, stages = stages.len(), "run triggered");

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator
                .drive(run_id, stages, options.extra_env, flag)
                .await;
        });

        Ok(run_id)
    }

    /// Requests cancellation of a run.
    ///
    /// Terminal runs, and runs whose cancellation is already in flight,
    /// report [`ControlError::NotCancellable`]. Unknown ids report
    /// [`ControlError::NotFound`].
    pub fn cancel(&self, run_id: Uuid) -> Result<(), ControlError> {
        let registry = self.lock_registry();
        let run = registry
            .runs
            .get(&run_id)
            .ok_or(ControlError::NotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(ControlError::NotCancellable {
                id: run_id,
                status: run.status,
            });
        }
        let flag = registry
            .cancel_flags
            .get(&run_id)
            .ok_or(ControlError::NotFound(run_id))?;
        if flag.swap(true, Ordering::SeqCst) {
            // A previous cancel already did the work.
            return Err(ControlError::NotCancellable {
                id: run_id,
                status: run.status,
            });
        }
        if let Some(active) = &registry.active_stage {
            if active.run_id == run_id {
                active.canceller.cancel();
            }
        }
        info!(run_id = %run_id, "cancellation requested");
        Ok(())
    }

    /// Snapshot of one run.
    pub fn run(&self, run_id: Uuid) -> Option<Run> {
        self.lock_registry().runs.get(&run_id).cloned()
    }

    /// Snapshot of all retained runs, oldest first.
    pub fn runs(&self) -> Vec<Run> {
        let registry = self.lock_registry();
        registry
            .order
            .iter()
            .filter_map(|id| registry.runs.get(id).cloned())
            .collect()
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("run registry lock poisoned")
    }

    /// Resolves the stage sequence for a trigger, validating any subset
    /// against the configured pipeline.
    fn resolve_stages(&self, subset: Option<&[String]>) -> Result<Vec<StageSpec>, ControlError> {
        match subset {
            None => Ok(self.config.stages.clone()),
            Some(names) => {
                for name in names {
                    if !self.config.stages.iter().any(|s| &s.name == name) {
                        return Err(ControlError::UnknownStage(name.clone()));
                    }
                }
                Ok(self
                    .config
                    .stages
                    .iter()
                    .filter(|s| names.contains(&s.name))
                    .cloned()
                    .collect())
            }
        }
    }

    /// Drives one run through its stage sequence.
    async fn drive(
        self: Arc<Self>,
        run_id: Uuid,
        stages: Vec<StageSpec>,
        extra_env: Vec<(String, String)>,
        cancel_flag: Arc<AtomicBool>,
    ) {
        let sequence = Arc::new(AtomicU64::new(0));

        for (index, stage) in stages.iter().enumerate() {
            if cancel_flag.load(Ordering::SeqCst) {
                // Cancelled before this stage started; nothing further runs.
                self.transition(run_id, RunStatus::Cancelled, index, Some(TransitionReason::Cancelled));
                return;
            }

            self.with_run(run_id, |run| {
                run.current_stage_index = index;
                run.stage_results.push(StageResult::running(&stage.name));
            });

            let handle = match self
                .supervisor
                .start(run_id, stage, sequence.clone(), &extra_env)
            {
                Ok(handle) => handle,
                Err(e) => {
                    error!(run_id = %run_id, stage = %stage.name, "stage spawn failed: {e}");
                    self.finish_stage(run_id, |r| r.failed(None, StageFailureKind::SpawnFailed));
                    self.transition(
                        run_id,
                        RunStatus::Failed,
                        index,
                        Some(TransitionReason::StageFailed {
                            stage: stage.name.clone(),
                            exit_code: None,
                        }),
                    );
                    return;
                }
            };

            if index == 0 {
                // The supervisor accepted the first stage.
                self.transition(run_id, RunStatus::Running, 0, None);
            }

            {
                let mut registry = self.lock_registry();
                registry.active_stage = Some(ActiveStage {
                    run_id,
                    canceller: handle.canceller(),
                });
                // A cancel may have slipped in between the flag check and
                // registration; forward it to the stage now.
                if cancel_flag.load(Ordering::SeqCst) {
                    handle.canceller().cancel();
                }
            }

            let exit = handle.wait().await;
            self.lock_registry().active_stage = None;

            match exit {
                Ok(StageExit::Exited(0)) => {
                    self.finish_stage(run_id, |r| r.succeeded(0));
                    if index + 1 == stages.len() {
                        self.transition(run_id, RunStatus::Succeeded, index, None);
                        return;
                    }
                    // Advance to the next stage.
                    self.transition(run_id, RunStatus::Running, index + 1, None);
                }
                Ok(StageExit::Exited(code)) => {
                    self.finish_stage(run_id, |r| {
                        r.failed(Some(code), StageFailureKind::NonZeroExit)
                    });
                    self.transition(
                        run_id,
                        RunStatus::Failed,
                        index,
                        Some(TransitionReason::StageFailed {
                            stage: stage.name.clone(),
                            exit_code: Some(code),
                        }),
                    );
                    return;
                }
                Ok(StageExit::Stalled) => {
                    self.finish_stage(run_id, |r| r.failed(None, StageFailureKind::Stalled));
                    self.transition(
                        run_id,
                        RunStatus::Failed,
                        index,
                        Some(TransitionReason::StageStalled {
                            stage: stage.name.clone(),
                        }),
                    );
                    return;
                }
                Ok(StageExit::Cancelled) => {
                    self.finish_stage(run_id, |r| r.cancelled());
                    self.transition(
                        run_id,
                        RunStatus::Cancelled,
                        index,
                        Some(TransitionReason::Cancelled),
                    );
                    return;
                }
                Err(e) => {
                    warn!(run_id = %run_id, stage = %stage.name, "supervision failed: {e}");
                    self.finish_stage(run_id, |r| r.failed(None, StageFailureKind::SpawnFailed));
                    self.transition(
                        run_id,
                        RunStatus::Failed,
                        index,
                        Some(TransitionReason::StageFailed {
                            stage: stage.name.clone(),
                            exit_code: None,
                        }),
                    );
                    return;
                }
            }
        }
    }

    fn with_run(&self, run_id: Uuid, f: impl FnOnce(&mut Run)) {
        let mut registry = self.lock_registry();
        if let Some(run) = registry.runs.get_mut(&run_id) {
            f(run);
        }
    }

    /// Replaces the run's in-flight stage result with its final form.
    fn finish_stage(&self, run_id: Uuid, f: impl FnOnce(StageResult) -> StageResult) {
        self.with_run(run_id, |run| {
            if let Some(result) = run.stage_results.pop() {
                run.stage_results.push(f(result));
            }
        });
    }

    /// Applies a status transition and broadcasts it. Terminal statuses
    /// are immutable; a transition on a terminal run is ignored.
    fn transition(
        &self,
        run_id: Uuid,
        to: RunStatus,
        stage_index: usize,
        reason: Option<TransitionReason>,
    ) {
        let from = {
            let mut registry = self.lock_registry();
            let Some(run) = registry.runs.get_mut(&run_id) else {
                return;
            };
            if run.status.is_terminal() {
                return;
            }
            let from = run.status;
            run.status = to;
            run.current_stage_index = stage_index;
            if to.is_terminal() {
                run.ended_at = Some(Utc::now());
            }
            from
        };

        info!(run_id = %run_id, %from, %to, stage_index, "run transition");
        self.hub.publish(PipelineEvent::Transition(TransitionEvent {
            run_id,
            from,
            to,
            stage_index,
            reason,
            timestamp: Utc::now(),
        }));
    }

    /// Evicts the oldest terminal runs beyond the history limit. Runs
    /// still queued or running are never evicted.
    fn evict_locked(&self, registry: &mut Registry) {
        while registry.order.len() > self.config.run_history_limit {
            let Some(pos) = registry.order.iter().position(|id| {
                registry
                    .runs
                    .get(id)
                    .map(|r| r.status.is_terminal())
                    .unwrap_or(true)
            }) else {
                break;
            };
            if let Some(id) = registry.order.remove(pos) {
                registry.runs.remove(&id);
                registry.cancel_flags.remove(&id);
                self.hub.drop_run(id);
            }
        }
    }
}
