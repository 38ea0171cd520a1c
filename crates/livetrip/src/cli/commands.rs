//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Store seeding commands.
#[derive(Debug, Subcommand)]
pub enum SeedCommand {
    /// Create or replace a bus
    Bus {
        /// Bus id, e.g. B12
        id: String,

        /// Route the bus runs
        #[arg(short, long)]
        route: Option<String>,

        /// Vehicle model
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Create or replace a route
    Route {
        /// Route id, e.g. R5
        id: String,

        /// Where the route begins
        #[arg(long)]
        from: String,

        /// Where the route ends
        #[arg(long)]
        to: String,
    },
}

/// Bus list arguments.
#[derive(Debug, Args)]
pub struct BusesCommand {
    /// Only buses whose id contains this text (case-insensitive)
    #[arg(short, long)]
    pub search: Option<String>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Trip replay arguments.
#[derive(Debug, Args)]
pub struct TripCommand {
    /// Bus to broadcast for
    #[arg(short, long)]
    pub bus: String,

    /// Driver id to write into the live trip
    #[arg(short, long)]
    pub driver: String,

    /// JSON file with the recorded track (array of {latitude, longitude})
    #[arg(short, long, value_name = "FILE")]
    pub track: PathBuf,

    /// Answer the location permission prompt with "deny"
    #[arg(long)]
    pub deny_location: bool,

    /// Stop after this many seconds even if the track is not finished
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Replay pace in milliseconds per point, instead of the configured interval
    #[arg(long, value_name = "MS")]
    pub pace: Option<u64>,
}

/// Live trip status arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Bus to inspect
    #[arg(short, long)]
    pub bus: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
