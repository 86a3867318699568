//! Command-line interface definitions and argument parsing

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::axis::StoreCapabilities;
use crate::config::EngineConfig;
use crate::history::parse_timestamp;
use crate::snapshot::SnapshotType;

/// Multi-axis fuzzy behavioral segmentation of customer histories
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover segments on every available axis and store the definitions
    Discover {
        #[command(flatten)]
        data: DataArgs,

        /// Seed for K-Means initialization (overrides config)
        #[arg(long)]
        seed: Option<u64>,

        /// Maximum iterations for K-Means (overrides config, capped at 300)
        #[arg(long)]
        max_iters: Option<u64>,

        /// Tolerance for K-Means convergence (overrides config)
        #[arg(long)]
        tolerance: Option<f64>,

        /// How discovered segments are named
        #[arg(long, value_enum, default_value_t = NamerKind::FeatureProfile)]
        namer: NamerKind,
    },

    /// Profile customers against the stored definitions
    Profile {
        #[command(flatten)]
        data: DataArgs,

        /// Only profile this customer
        #[arg(long)]
        customer: Option<String>,

        /// Write profiles as JSON to this file instead of printing a summary
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Profile customers and record dated snapshots
    Snapshot {
        #[command(flatten)]
        data: DataArgs,

        /// Snapshot date (YYYY-MM-DD); defaults to the reference date
        #[arg(long)]
        date: Option<String>,

        /// Snapshot cadence
        #[arg(long = "type", default_value = "daily")]
        snapshot_type: String,
    },
}

/// Input exports shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// Orders CSV (order_id, customer_id, placed_at, total, ...)
    #[arg(long, default_value = "orders.csv")]
    pub orders: PathBuf,

    /// Order items CSV; item-based axes are skipped without it
    #[arg(long)]
    pub items: Option<PathBuf>,

    /// Support tickets CSV; support_history is skipped without it
    #[arg(long)]
    pub tickets: Option<PathBuf>,

    /// Reference instant for feature extraction (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub as_of: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamerKind {
    Ordinal,
    FeatureProfile,
}

impl DataArgs {
    /// Which data sources this run was given.
    pub fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            has_item_data: self.items.is_some(),
            has_ticket_data: self.tickets.is_some(),
        }
    }

    /// Parse the reference instant, defaulting to now.
    pub fn parse_as_of(&self) -> crate::Result<DateTime<Utc>> {
        match self.as_of {
            Some(ref raw) => parse_timestamp(raw)
                .ok_or_else(|| anyhow::anyhow!("Invalid --as-of value: {}", raw)),
            None => Ok(Utc::now()),
        }
    }
}

impl Cli {
    /// Load the configuration file if one was given, otherwise defaults.
    pub fn load_config(&self) -> crate::Result<EngineConfig> {
        match self.config {
            Some(ref path) => Ok(EngineConfig::from_file(path)?),
            None => Ok(EngineConfig::default()),
        }
    }
}

/// Parse a snapshot date and cadence as given on the command line.
pub fn parse_snapshot_target(
    date: Option<&str>,
    snapshot_type: &str,
    as_of: DateTime<Utc>,
) -> crate::Result<(NaiveDate, SnapshotType)> {
    let snapshot_date = match date {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| anyhow::anyhow!("Invalid snapshot date: {}", raw))?,
        None => as_of.date_naive(),
    };
    let snapshot_type: SnapshotType = snapshot_type.parse()?;
    Ok((snapshot_date, snapshot_type))
}
