//! CLI module for crossquery
//!
//! Provides command-line interface for:
//! - run: Drain a query over a fixture through the in-memory backend
//! - validate: Check an execution configuration file

mod args;
mod commands;
mod errors;
mod fixture;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command, run_query, validate};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use fixture::{Fixture, FixtureDocument, FixtureSplit};
pub use io::{write_error, write_line};
