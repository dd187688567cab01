//! Command-line interface for match-forge.
//!
//! Provides commands for publishing campaigns, running worker pools, and
//! inspecting the queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
