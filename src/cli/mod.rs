//! Command-line interface for conveyor.
//!
//! Provides commands for triggering and observing pipeline runs, serving
//! the cron schedule, and inspecting the shared quota record.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
