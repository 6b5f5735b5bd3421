//! Stage process supervisor.
//!
//! Launches a pipeline stage as an isolated child process, captures its
//! stdout and stderr as independent line streams, and resolves exactly
//! one terminal exit per handle. Each completed line becomes a
//! [`LogEvent`](crate::event::LogEvent) carrying the next per-run sequence
//! number, interleaved in arrival order across both streams.
//!
//! Cancellation is cooperative: SIGTERM first, escalating to a forced
//! kill after the configured grace period. A stage that stays silent for
//! longer than the idle timeout is terminated and reported as stalled,
//! distinguishable from a crash.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StageSpec;
use crate::event::{LogEvent, PipelineEvent, StreamKind};
use crate::hub::EventHub;

/// Errors that can occur while supervising a stage process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The stage executable could not be launched.
    #[error("failed to spawn stage '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// The capture task was aborted or panicked.
    #[error("stage capture task failed: {0}")]
    Join(String),
}

/// How a supervised stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The process produced no output for the idle timeout and was killed.
    Stalled,
    /// The process ended after an explicit cancellation request,
    /// regardless of its exit code.
    Cancelled,
}

/// Cancellation handle for one supervised stage. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StageCanceller {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StageCanceller {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Requests cancellation. Idempotent; cancelling a stage that has
    /// already exited is a no-op.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Handle to one running stage.
#[derive(Debug)]
pub struct StageHandle {
    canceller: StageCanceller,
    join: JoinHandle<StageExit>,
}

impl StageHandle {
    /// The cancellation handle for this stage.
    pub fn canceller(&self) -> StageCanceller {
        self.canceller.clone()
    }

    /// Waits for the stage to end.
    pub async fn wait(self) -> Result<StageExit, SupervisorError> {
        self.join
            .await
            .map_err(|e| SupervisorError::Join(e.to_string()))
    }
}

/// Launches and supervises stage processes for the run coordinator.
#[derive(Clone)]
pub struct StageSupervisor {
    grace_period: Duration,
    idle_timeout: Duration,
    hub: EventHub,
}

impl StageSupervisor {
    /// Creates a supervisor publishing captured output through `hub`.
    pub fn new(grace_period: Duration, idle_timeout: Duration, hub: EventHub) -> Self {
        Self {
            grace_period,
            idle_timeout,
            hub,
        }
    }

    /// Starts `stage` as a child process for `run_id`.
    ///
    /// `sequence` is the run's shared log sequence counter; `extra_env` is
    /// appended after the stage's own environment so trigger-time
    /// overrides win.
    pub fn start(
        &self,
        run_id: Uuid,
        stage: &StageSpec,
        sequence: Arc<AtomicU64>,
        extra_env: &[(String, String)],
    ) -> Result<StageHandle, SupervisorError> {
        let mut cmd = Command::new(&stage.command);
        cmd.args(&stage.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in stage.env.iter().chain(extra_env) {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            stage: stage.name.clone(),
            source,
        })?;

        info!(run_id = %run_id, stage = %stage.name, "stage process started");

        let stdout = child.stdout.take().expect("stdout not captured");
        let stderr = child.stderr.take().expect("stderr not captured");

        let canceller = StageCanceller::new();
        let capture = CaptureTask {
            run_id,
            stage: stage.name.clone(),
            sequence,
            hub: self.hub.clone(),
            grace_period: self.grace_period,
            idle_timeout: self.idle_timeout,
            canceller: canceller.clone(),
        };
        let join = tokio::spawn(capture.run(child, stdout, stderr));

        Ok(StageHandle { canceller, join })
    }
}

struct CaptureTask {
    run_id: Uuid,
    stage: String,
    sequence: Arc<AtomicU64>,
    hub: EventHub,
    grace_period: Duration,
    idle_timeout: Duration,
    canceller: StageCanceller,
}

impl CaptureTask {
    async fn run(
        self,
        mut child: Child,
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
    ) -> StageExit {
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut idle_deadline = Instant::now() + self.idle_timeout;

        while !(stdout_done && stderr_done) {
            if self.canceller.is_cancelled() {
                return self.cancelled(&mut child).await;
            }
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => match line {
                    Ok(Some(text)) => {
                        idle_deadline = Instant::now() + self.idle_timeout;
                        self.emit(StreamKind::Stdout, text);
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        warn!(stage = %self.stage, "error reading stdout: {e}");
                        stdout_done = true;
                    }
                },
                line = stderr_lines.next_line(), if !stderr_done => match line {
                    Ok(Some(text)) => {
                        idle_deadline = Instant::now() + self.idle_timeout;
                        self.emit(StreamKind::Stderr, text);
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        warn!(stage = %self.stage, "error reading stderr: {e}");
                        stderr_done = true;
                    }
                },
                _ = self.canceller.notify.notified() => {
                    return self.cancelled(&mut child).await;
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    return self.stalled(&mut child).await;
                }
            }
        }

        // Streams are closed; the process should exit promptly, but keep
        // honoring cancellation and the idle timeout while waiting.
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    info!(run_id = %self.run_id, stage = %self.stage, code, "stage exited");
                    StageExit::Exited(code)
                }
                Err(e) => {
                    warn!(stage = %self.stage, "failed to reap stage process: {e}");
                    StageExit::Exited(-1)
                }
            },
            _ = self.canceller.notify.notified() => self.cancelled(&mut child).await,
            _ = tokio::time::sleep_until(idle_deadline) => self.stalled(&mut child).await,
        }
    }

    fn emit(&self, stream: StreamKind, text: String) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        debug!(stage = %self.stage, %stream, "{text}");
        self.hub.publish(PipelineEvent::Log(LogEvent {
            run_id: self.run_id,
            stage: self.stage.clone(),
            sequence,
            stream,
            text,
            timestamp: Utc::now(),
        }));
    }

    async fn cancelled(&self, child: &mut Child) -> StageExit {
        info!(run_id = %self.run_id, stage = %self.stage, "cancelling stage");
        terminate(child, self.grace_period).await;
        StageExit::Cancelled
    }

    async fn stalled(&self, child: &mut Child) -> StageExit {
        warn!(
            run_id = %self.run_id,
            stage = %self.stage,
            idle_secs = self.idle_timeout.as_secs(),
            "stage produced no output within the idle timeout, terminating"
        );
        terminate(child, self.grace_period).await;
        StageExit::Stalled
    }
}

/// Terminates a child gracefully, escalating to a forced kill after
/// `grace`. Termination of a process that already exited is a no-op.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            warn!("stage ignored SIGTERM for {grace:?}, killing");
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        // Already exited.
        debug!("kill after grace period: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventFilter;

    fn sh(name: &str, script: &str) -> StageSpec {
        StageSpec::new(name, "/bin/sh").with_args(["-c", script])
    }

    fn supervisor(hub: &EventHub) -> StageSupervisor {
        StageSupervisor::new(
            Duration::from_millis(200),
            Duration::from_secs(5),
            hub.clone(),
        )
    }

    #[tokio::test]
    async fn test_lines_become_sequenced_log_events() {
        let hub = EventHub::new(64, 64);
        let run_id = Uuid::new_v4();
        let mut sub = hub.subscribe(EventFilter::Run(run_id));

        let handle = supervisor(&hub)
            .start(
                run_id,
                &sh("echo", "echo one; echo two; echo err >&2"),
                Arc::new(AtomicU64::new(0)),
                &[],
            )
            .unwrap();

        assert_eq!(handle.wait().await.unwrap(), StageExit::Exited(0));

        let mut sequences = Vec::new();
        let mut texts = Vec::new();
        for _ in 0..3 {
            match sub.recv().await.unwrap() {
                PipelineEvent::Log(log) => {
                    sequences.push(log.sequence);
                    texts.push(log.text);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
        assert!(texts.contains(&"one".to_string()));
        assert!(texts.contains(&"err".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let hub = EventHub::new(16, 16);
        let handle = supervisor(&hub)
            .start(
                Uuid::new_v4(),
                &sh("fail", "exit 3"),
                Arc::new(AtomicU64::new(0)),
                &[],
            )
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), StageExit::Exited(3));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let hub = EventHub::new(16, 16);
        let err = supervisor(&hub)
            .start(
                Uuid::new_v4(),
                &StageSpec::new("missing", "/nonexistent/binary"),
                Arc::new(AtomicU64::new(0)),
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_terminates_stage() {
        let hub = EventHub::new(16, 16);
        let handle = supervisor(&hub)
            .start(
                Uuid::new_v4(),
                &sh("sleep", "sleep 30"),
                Arc::new(AtomicU64::new(0)),
                &[],
            )
            .unwrap();

        let canceller = handle.canceller();
        canceller.cancel();
        // Second cancel is a no-op.
        canceller.cancel();

        assert_eq!(handle.wait().await.unwrap(), StageExit::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_exit_code() {
        let hub = EventHub::new(16, 16);
        // The trap makes the stage exit 0 on SIGTERM; the outcome must
        // still be Cancelled.
        let handle = supervisor(&hub)
            .start(
                Uuid::new_v4(),
                &sh("trap", "trap 'exit 0' TERM; sleep 30"),
                Arc::new(AtomicU64::new(0)),
                &[],
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.canceller().cancel();
        assert_eq!(handle.wait().await.unwrap(), StageExit::Cancelled);
    }

    #[tokio::test]
    async fn test_silent_stage_is_stalled() {
        let hub = EventHub::new(16, 16);
        let supervisor = StageSupervisor::new(
            Duration::from_millis(100),
            Duration::from_millis(200),
            hub.clone(),
        );
        let handle = supervisor
            .start(
                Uuid::new_v4(),
                &sh("silent", "sleep 30"),
                Arc::new(AtomicU64::new(0)),
                &[],
            )
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), StageExit::Stalled);
    }

    #[tokio::test]
    async fn test_extra_env_overrides_stage_env() {
        let hub = EventHub::new(16, 16);
        let run_id = Uuid::new_v4();
        let mut sub = hub.subscribe(EventFilter::Run(run_id));

        let stage = sh("env", "echo \"$MODE\"").with_env("MODE", "default");
        let handle = supervisor(&hub)
            .start(
                run_id,
                &stage,
                Arc::new(AtomicU64::new(0)),
                &[("MODE".to_string(), "override".to_string())],
            )
            .unwrap();
        handle.wait().await.unwrap();

        match sub.recv().await.unwrap() {
            PipelineEvent::Log(log) => assert_eq!(log.text, "override"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
