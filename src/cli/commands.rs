//! CLI command implementations

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::ExecutionConfig;
use crate::execution::CrossPartitionParams;
use crate::pipeline::{FeedPage, QueryExecution};
use crate::transport::ExponentialRetryPolicy;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::fixture::Fixture;
use super::io::{write_error, write_line};

/// Main CLI entry point
///
/// Parses arguments, installs logging on stderr and dispatches to the
/// appropriate command. This is the only function main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_command(cli.command));
    if let Err(ref e) = result {
        write_error(e.code_str(), e.message())?;
    }
    result
}

fn init_logging(verbose: u8) -> CliResult<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CliError::config_error(format!("Failed to install logger: {}", e)))
}

/// Run the appropriate command based on CLI args
pub async fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Run {
            fixture,
            config,
            continuation,
            pages,
        } => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            run_query(
                &fixture,
                config.as_deref(),
                continuation.as_deref(),
                pages,
                &cancel,
                |page| write_line(page),
            )
            .await
        }
        Command::Validate { config } => validate(&config),
    }
}

/// Drains the fixture's query, handing each page to `emit`. Stops after
/// `pages` pages when given; the last page's continuation resumes the query.
pub async fn run_query<F>(
    fixture_path: &Path,
    config_path: Option<&Path>,
    continuation: Option<&str>,
    pages: Option<usize>,
    cancel: &CancellationToken,
    mut emit: F,
) -> CliResult<()>
where
    F: FnMut(&FeedPage) -> CliResult<()>,
{
    let config = match config_path {
        Some(path) => ExecutionConfig::load(path)?,
        None => ExecutionConfig::default(),
    };
    let fixture = Fixture::load(fixture_path)?;
    let backend = Arc::new(fixture.build_backend()?);

    let params = CrossPartitionParams::new(
        config.clone(),
        fixture.query_info.clone(),
        backend.target_ranges(),
        backend.clone(),
        backend,
        Arc::new(ExponentialRetryPolicy::from_config(&config.retry)),
    );

    let mut execution = QueryExecution::create(params, continuation, cancel).await?;
    let mut returned = 0usize;

    while pages.map_or(true, |limit| returned < limit) {
        let page = execution.execute_next(cancel).await?;
        emit(&page)?;
        returned += 1;

        if page.continuation.is_none() {
            break;
        }
    }

    Ok(())
}

/// Check an execution configuration file
pub fn validate(config_path: &Path) -> CliResult<()> {
    let config = ExecutionConfig::load(config_path)?;
    write_line(&serde_json::json!({
        "status": "ok",
        "config": config
    }))
}
