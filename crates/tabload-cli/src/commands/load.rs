//! `tabload load <file> <table>`

use tabload_ingest::{ChunkLoader, FailurePolicy, LoadOptions, LoadResult, PgConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Result, EXIT_PARTIAL, EXIT_SUCCESS};
use crate::{Cli, LoadArgs, OutputFormat};

/// Run a load and print its report; returns the process exit code
pub async fn run(cli: &Cli, args: &LoadArgs) -> Result<i32> {
    let settings = Settings::load(&cli.config)?;
    let options = apply_overrides(settings.load, args);
    options.validate()?;

    info!(
        config = %cli.config.display(),
        chunk_size = options.chunk_size,
        retry_limit = options.retry_limit,
        policy = %options.on_chunk_failure,
        "Starting load"
    );

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current chunk");
                cancel.cancel();
            }
        }
    });

    let outcome = ChunkLoader::new(PgConnector)
        .with_cancellation(cancel)
        .load(&settings.connection, &args.file, &args.table, &options)
        .await;
    interrupt.abort();

    match outcome {
        Ok(result) => {
            print_report(&result, cli.output)?;
            Ok(if result.is_complete_success() {
                EXIT_SUCCESS
            } else {
                EXIT_PARTIAL
            })
        }
        Err(abort) => {
            print_report(&abort.result, cli.output)?;
            Err(abort.into())
        }
    }
}

/// Command-line flags take precedence over the configuration file
pub fn apply_overrides(mut options: LoadOptions, args: &LoadArgs) -> LoadOptions {
    if let Some(chunk_size) = args.chunk_size {
        options.chunk_size = chunk_size;
    }
    if let Some(retry_limit) = args.retry_limit {
        options.retry_limit = retry_limit;
    }
    if args.best_effort {
        options.on_chunk_failure = FailurePolicy::BestEffort;
    }
    if args.create_table {
        options.create_table_if_missing = true;
    }
    if args.allow_empty {
        options.source.allow_empty = true;
    }
    if let Some(delimiter) = args.delimiter {
        options.source.delimiter = Some(delimiter);
    }
    if let Some(encoding) = args.encoding {
        options.source.encoding = Some(encoding);
    }
    options
}

fn print_report(result: &LoadResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => println!("{}", render_text(result)),
    }
    Ok(())
}

/// Human-readable report
pub fn render_text(result: &LoadResult) -> String {
    let mut lines = vec![format!(
        "{} rows loaded into {} ({}: {} of {} chunks committed, {} failed)",
        result.total_rows_committed,
        result.table_name,
        result.state,
        result.chunks_committed,
        result.chunks_attempted,
        result.chunks_failed
    )];
    for failure in &result.failures {
        lines.push(format!(
            "  chunk {} ({} rows, {} attempts): {}: {}",
            failure.chunk_index, failure.rows, failure.attempts, failure.error_kind, failure.reason
        ));
    }
    lines.join("\n")
}
