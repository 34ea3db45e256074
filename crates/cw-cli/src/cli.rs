//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Twitch watch-time analytics.
///
/// Infers viewer watch time from chat activity, maintains daily and
/// lifetime statistics, and coordinates channel listeners across
/// instances.
#[derive(Debug, Parser)]
#[command(name = "cw", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ensure this instance has a stable identity.
    Init {
        /// Display label for this run (defaults to hostname).
        #[arg(long)]
        label: Option<String>,
    },

    /// Manage tracked channels.
    Channels {
        #[command(subcommand)]
        action: ChannelsAction,
    },

    /// Submit a single watch-time heartbeat.
    Heartbeat {
        /// Viewer identifier.
        #[arg(long)]
        viewer: String,

        /// Channel name.
        #[arg(long)]
        channel: String,

        /// Heartbeat timestamp (RFC 3339); defaults to now.
        #[arg(long)]
        timestamp: Option<String>,

        /// Watch duration in seconds.
        #[arg(long)]
        seconds: i64,
    },

    /// Recompute lifetime statistics.
    Aggregate {
        /// Limit to one viewer; otherwise every viewer of the channel.
        #[arg(long)]
        viewer: Option<String>,

        /// Channel id.
        #[arg(long)]
        channel: String,

        /// Write computed values even when they are lower than stored ones.
        #[arg(long)]
        allow_decreases: bool,

        /// Output the resulting rows as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Refresh percentile ranks for a channel.
    Ranks {
        /// Channel id.
        #[arg(long)]
        channel: String,

        /// Only rows updated within this window are refreshed.
        #[arg(long)]
        window_hours: Option<i64>,
    },

    /// Rebuild one day's watch time from raw chat messages.
    Reconcile {
        /// Viewer identifier.
        #[arg(long)]
        viewer: String,

        /// Channel id.
        #[arg(long)]
        channel: String,

        /// Day to rebuild (YYYY-MM-DD, UTC).
        #[arg(long)]
        date: String,
    },

    /// Run the listener service for one or more channels.
    Listen {
        /// Channel ids to listen to.
        channels: Vec<String>,

        /// Display label published with this instance's heartbeat
        /// (defaults to hostname).
        #[arg(long)]
        label: Option<String>,
    },

    /// Prune raw chat messages and dedup keys past the retention window.
    Retention {
        /// Retention in days; defaults to the configured value.
        #[arg(long)]
        days: Option<i64>,
    },

    /// Show database and lock status.
    Status,
}

/// Channel registry actions.
#[derive(Debug, Subcommand)]
pub enum ChannelsAction {
    /// Register or rename a channel.
    Track {
        /// Stable channel id.
        #[arg(long)]
        id: String,

        /// Current channel name.
        #[arg(long)]
        name: String,
    },

    /// List tracked channels.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}
