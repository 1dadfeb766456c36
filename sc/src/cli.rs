//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

use crate::domain::{RefreshReason, SafetyEventType, SeverityLevel, UserId};

/// sc - safety center coordination service
#[derive(Parser)]
#[command(
    name = "sc",
    about = "Safety center coordination service and client",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Socket path (overrides config)
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    /// Target user (defaults to the caller's own)
    #[arg(short, long, global = true)]
    pub user: Option<UserId>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the service in the foreground
    Serve,

    /// Ping the service to check it is alive
    Ping,

    /// Show whether the service is enabled
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Push a source report
    Push {
        /// Source id from the catalog
        source: String,

        /// Package the source belongs to
        #[arg(short, long)]
        package: String,

        /// Status title (omit with --issue-only to push issues alone)
        #[arg(long)]
        title: Option<String>,

        /// Status summary
        #[arg(long, default_value = "")]
        summary: String,

        /// Status severity
        #[arg(long, default_value = "information")]
        severity: SeverityLevel,

        /// Read the full report as JSON from this file instead
        #[arg(long, conflicts_with_all = ["title", "clear"])]
        json: Option<PathBuf>,

        /// Clear the source's data instead of pushing
        #[arg(long)]
        clear: bool,

        /// Event that triggered the push
        #[arg(long, default_value = "source-state-changed")]
        event: SafetyEventType,

        /// Refresh broadcast id (for refresh-requested events)
        #[arg(long)]
        broadcast_id: Option<String>,
    },

    /// Read back a source report
    Get {
        source: String,

        #[arg(short, long)]
        package: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Report a source error
    Error {
        source: String,

        #[arg(short, long)]
        package: String,

        /// Error message
        message: String,
    },

    /// Ask sources to refresh
    Refresh {
        #[arg(short, long, default_value = "button-click")]
        reason: RefreshReason,
    },

    /// Show the aggregated view
    View {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream view changes until interrupted
    Watch,

    /// Stream refresh and issue-action requests for a source package until interrupted
    Listen {
        #[arg(short, long)]
        package: String,
    },

    /// Issue commands
    Issue {
        #[command(subcommand)]
        command: IssueCommand,
    },

    /// Catalog commands
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },

    /// Drop all tracked data
    Clear,
}

/// Issue subcommands
#[derive(Debug, Subcommand)]
pub enum IssueCommand {
    /// Hide an issue from the view
    Dismiss {
        /// Issue key (source/issue/user)
        issue: String,
    },

    /// Run an issue action
    Act {
        issue: String,
        action: String,
    },
}

/// Catalog subcommands
#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    /// Show the active catalog
    Show,

    /// Replace the active catalog with one from a file
    Override { path: PathBuf },

    /// Return to the startup catalog
    Reset,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("safetycenter")
        .join("logs")
        .join("safetycenter.log")
}

/// Output format for status and view commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
