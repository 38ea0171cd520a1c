//! Command-line interface for livetrip.
//!
//! This module provides the CLI structure for the `livetrip` developer
//! binary, which drives trip sessions against the local SQLite store.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{BusesCommand, ConfigCommand, SeedCommand, StatusCommand, TripCommand};

/// livetrip - Broadcast a bus trip from a recorded GPS track
///
/// Seeds buses and routes into the local trip store, replays a drive as a
/// live trip session, and inspects the resulting live trip records.
#[derive(Debug, Parser)]
#[command(name = "livetrip")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add buses and routes to the store
    #[command(subcommand)]
    Seed(SeedCommand),

    /// List buses
    Buses(BusesCommand),

    /// Broadcast a trip by replaying a recorded track
    Trip(TripCommand),

    /// Show the live trip record of a bus
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.quiet, self.verbose)
    }
}
