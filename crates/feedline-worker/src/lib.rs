//! Feedline Worker Library
//!
//! Command-line entry point for running and operating feedline pipeline stages.
//!
//! # Overview
//!
//! - **Schema**: apply the bundled migrations (`feedline-worker migrate`)
//! - **Collection**: run the package registration summary stage under the
//!   singleton lease, once or as a daemon (`feedline-worker run`)
//! - **Cursors**: inspect and move stage watermarks (`feedline-worker cursor`)
//! - **Leases**: inspect or break a stuck lease (`feedline-worker lease`)

pub mod commands;
pub mod registration;
pub mod services;

use clap::{Args, Parser, Subcommand};
use feedline_core::ProcessMode;

/// Feedline - cursor-driven catalog feed collection
#[derive(Parser, Debug)]
#[command(name = "feedline-worker")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply database migrations
    Migrate,

    /// Collect package registration summaries
    Run(RunArgs),

    /// Inspect or move cursors
    Cursor {
        #[command(subcommand)]
        command: CursorCommand,
    },

    /// Inspect or break leases
    Lease {
        #[command(subcommand)]
        command: LeaseCommand,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Keep collecting until interrupted
    #[arg(long)]
    pub daemon: bool,

    /// Seconds to wait after a run that caught up
    #[arg(long, default_value_t = 10)]
    pub success_sleep: u64,

    /// Seconds to wait after a failed run before retrying
    #[arg(long, default_value_t = 30)]
    pub failure_sleep: u64,

    /// Processing mode (sequential, queued)
    #[arg(long, default_value = "sequential")]
    pub mode: ProcessMode,
}

/// Cursor subcommands
#[derive(Subcommand, Debug)]
pub enum CursorCommand {
    /// List every cursor and its value
    List,

    /// Show one cursor
    Get {
        /// Cursor name
        name: String,
    },

    /// Move a cursor to an RFC 3339 timestamp
    Set {
        /// Cursor name
        name: String,

        /// New value, e.g. 2024-05-01T12:00:00Z
        value: String,
    },

    /// Move a cursor back to the beginning of time
    Reset {
        /// Cursor name
        name: String,
    },
}

/// Lease subcommands
#[derive(Subcommand, Debug)]
pub enum LeaseCommand {
    /// Show the stored state of a lease
    Show {
        /// Lease name
        name: String,
    },

    /// Make a lease available regardless of its holder
    Break {
        /// Lease name
        name: String,
    },
}
