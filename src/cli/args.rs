//! CLI argument definitions using clap
//!
//! Commands:
//! - crossquery run <fixture> [--config <path>] [--continuation <token>] [--pages <n>]
//! - crossquery validate --config <path>

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// crossquery - cross-partition query execution over an in-memory fixture
#[derive(Parser, Debug)]
#[command(name = "crossquery")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log verbosity on stderr (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drain a query over a fixture, printing one JSON line per page
    Run {
        /// Path to the fixture file (ranges, documents, query plan)
        fixture: PathBuf,

        /// Path to an execution configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Resume from a continuation printed by an earlier run
        #[arg(long)]
        continuation: Option<String>,

        /// Stop after this many pages
        #[arg(long)]
        pages: Option<usize>,
    },

    /// Check an execution configuration file and exit
    Validate {
        /// Path to configuration file
        #[arg(long, default_value = "./crossquery.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
