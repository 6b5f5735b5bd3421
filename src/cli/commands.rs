//! CLI command definitions for conveyor.
//!
//! The orchestrator process exposes three surfaces: `run` for a one-shot
//! pipeline run with live output, `serve` for the long-lived scheduled
//! orchestrator, and `quota` for the shared daily call budget. Stage
//! worker processes call `conveyor quota record` to account their own
//! billable calls against the same record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::event::PipelineEvent;
use crate::hub::{EventFilter, EventHub};
use crate::quota::{QuotaGuard, QuotaStore, QuotaWatcher};
use crate::run::{RunCoordinator, RunStatus, TriggerOptions};
use crate::scheduler::Scheduler;

/// How often `conveyor serve` polls the quota record for movement caused
/// by stage worker processes.
const QUOTA_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pipeline orchestrator with quota-governed stage execution.
#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Run and schedule multi-stage pipelines of external processes")]
#[command(version)]
#[command(
    long_about = "conveyor drives an ordered sequence of external stage processes, \
streams their output as sequenced events, and tracks a shared daily quota \
for rate-limited calls made by the stages.\n\nExample usage:\n  \
conveyor --config ./conveyor.json run\n  conveyor --config ./conveyor.json serve"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Configuration file (JSON). Environment variables override its
    /// values; without it, defaults plus environment are used.
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Trigger one pipeline run and stream its events until it ends.
    Run(RunArgs),

    /// Run the orchestrator under the configured cron schedule,
    /// streaming all pipeline and quota events until interrupted.
    Serve(ServeArgs),

    /// List the configured pipeline stages.
    Stages,

    /// Inspect or update the shared daily quota record.
    Quota(QuotaArgs),
}

/// Arguments for `conveyor run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run only these configured stages (repeatable). The configured
    /// order is kept regardless of the order given here.
    #[arg(short, long)]
    pub stage: Vec<String>,

    /// Extra KEY=VALUE environment for every stage of this run
    /// (repeatable). Overrides stage-level values.
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Print events as JSON lines instead of formatted text.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `conveyor serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Cron expression overriding the configured schedule.
    #[arg(long)]
    pub cron: Option<String>,

    /// Print events as JSON lines instead of formatted text.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `conveyor quota`.
#[derive(Parser, Debug)]
pub struct QuotaArgs {
    /// Quota subcommand to run.
    #[command(subcommand)]
    pub command: QuotaSubcommand,
}

/// Quota subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum QuotaSubcommand {
    /// Print today's quota state.
    Show {
        /// Print the state as JSON.
        #[arg(short, long)]
        json: bool,
    },

    /// Record one billable call under a label. Intended for stage
    /// processes sharing the daily budget with the orchestrator.
    Record {
        /// Label of the governed call (e.g. "generateImage").
        label: String,
    },
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before
/// running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_run_command(config, args).await,
        Commands::Serve(args) => run_serve_command(config, args).await,
        Commands::Stages => run_stages_command(config),
        Commands::Quota(args) => run_quota_command(config, args),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("failed to load config from '{path}'"))?,
        None => OrchestratorConfig::from_env()?,
    };
    Ok(config)
}

fn build_hub(config: &OrchestratorConfig) -> EventHub {
    EventHub::new(config.ring_capacity, config.observer_queue_capacity)
}

fn open_guard(config: &OrchestratorConfig) -> anyhow::Result<QuotaGuard> {
    let guard = QuotaGuard::open(
        QuotaStore::new(&config.quota_path),
        config.quota_daily_limit,
        config.quota_warn_thresholds.clone(),
    )?;
    Ok(guard)
}

async fn run_run_command(config: OrchestratorConfig, args: RunArgs) -> anyhow::Result<()> {
    let hub = build_hub(&config);
    let coordinator = RunCoordinator::new(config, hub.clone())?;

    let stages = if args.stage.is_empty() {
        None
    } else {
        Some(args.stage.clone())
    };
    let run_id = coordinator.trigger(TriggerOptions {
        stages,
        extra_env: parse_env_pairs(&args.env)?,
    })?;

    // Subscribing after the trigger is safe: the replay ring covers any
    // events published in between.
    let mut sub = hub.subscribe(EventFilter::Run(run_id));
    let mut final_status = None;
    while final_status.is_none() {
        tokio::select! {
            event = sub.recv() => match event {
                Some(event) => {
                    print_event(&event, args.json)?;
                    if let PipelineEvent::Transition(transition) = &event {
                        if transition.to.is_terminal() {
                            final_status = Some(transition.to);
                        }
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(run_id = %run_id, "interrupt received, cancelling run");
                if let Err(e) = coordinator.cancel(run_id) {
                    warn!("cancel failed: {e}");
                }
            }
        }
    }

    match final_status {
        Some(RunStatus::Succeeded) => Ok(()),
        Some(status) => Err(anyhow::anyhow!("run {run_id} ended with status {status}")),
        None => Err(anyhow::anyhow!("event stream closed before run {run_id} ended")),
    }
}

async fn run_serve_command(config: OrchestratorConfig, args: ServeArgs) -> anyhow::Result<()> {
    let expression = args
        .cron
        .or_else(|| config.schedule.clone())
        .context("no schedule configured; set `schedule` in the config or pass --cron")?;

    let hub = build_hub(&config);
    let guard = open_guard(&config)?;
    info!(
        remaining = guard.remaining_calls()?,
        limit = guard.limit(),
        "daily quota budget loaded"
    );

    // Stage workers record against the shared file from their own
    // processes; the watcher relays that movement to our observers.
    let watcher = QuotaWatcher::new(
        QuotaStore::new(&config.quota_path),
        config.quota_daily_limit,
        config.quota_warn_thresholds.clone(),
        hub.clone(),
    );
    let quota_task = watcher.spawn(QUOTA_POLL_INTERVAL);

    let pipeline = config.pipeline_name.clone();
    let coordinator = RunCoordinator::new(config, hub.clone())?;
    let scheduler = Scheduler::new(Arc::clone(&coordinator));
    scheduler.schedule(&pipeline, &expression)?;

    let mut events = hub.subscribe(EventFilter::All).into_stream();
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => print_event(&event, args.json)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }
    scheduler.unschedule(&pipeline);
    quota_task.abort();
    Ok(())
}

fn run_stages_command(config: OrchestratorConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("pipeline: {}", config.pipeline_name);
    for (index, stage) in config.stages.iter().enumerate() {
        let args = if stage.args.is_empty() {
            String::new()
        } else {
            format!(" {}", stage.args.join(" "))
        };
        println!("  {index}. {}: {}{args}", stage.name, stage.command);
    }
    Ok(())
}

fn run_quota_command(config: OrchestratorConfig, args: QuotaArgs) -> anyhow::Result<()> {
    let guard = open_guard(&config)?;
    match args.command {
        QuotaSubcommand::Show { json } => {
            let state = guard.snapshot()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!(
                    "{}: {} of {} calls used, {} remaining",
                    state.date,
                    state.call_count,
                    state.limit,
                    state.remaining()
                );
                for (label, count) in &state.per_function_counts {
                    println!("  {label}: {count}");
                }
            }
        }
        QuotaSubcommand::Record { label } => {
            let receipt = guard.record_call(&label)?;
            println!(
                "recorded '{label}': {} of {} calls used, {} remaining",
                receipt.call_count,
                guard.limit(),
                receipt.remaining
            );
            for threshold in receipt.crossed_thresholds {
                println!("warning: daily call count reached {threshold}");
            }
        }
    }
    Ok(())
}

/// Parses repeated `KEY=VALUE` pairs from the command line.
fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .with_context(|| format!("invalid environment pair '{pair}', expected KEY=VALUE"))
        })
        .collect()
}

fn print_event(event: &PipelineEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        PipelineEvent::Log(log) => {
            println!("[{}:{}] {}", log.stage, log.stream, log.text);
        }
        PipelineEvent::Transition(transition) => {
            let reason = transition
                .reason
                .as_ref()
                .map(|r| format!(" ({r:?})"))
                .unwrap_or_default();
            println!(
                "run {} {} -> {} at stage {}{}",
                transition.run_id, transition.from, transition.to, transition.stage_index, reason
            );
        }
        PipelineEvent::Quota(quota) => match quota.threshold {
            Some(threshold) => println!(
                "quota warning: {} of {} calls used (threshold {})",
                quota.call_count, quota.limit, threshold
            ),
            None => println!(
                "quota: {} of {} calls used, {} remaining",
                quota.call_count, quota.limit, quota.remaining
            ),
        },
    }
    Ok(())
}
