//! `run` command: reads protocol messages from stdin into the built-in
//! destination using either engine mode.

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{debug, info, warn};

use streamload::config::EngineConfig;
use streamload::consumer::BufferedConsumer;
use streamload::input::LineConsumer;
use streamload::lifecycle::DestinationRunner;
use streamload::message::{JsonDeserializer, MessageQueue, ProtocolMessage};
use streamload::scheduler::{RunStats, TracingTelemetrySink};
use streamload::stream::{Catalog, Stream};

use crate::destination::{print_checkpoint, LogDestination, DEFAULT_BATCH_RECORDS};
use crate::error::CliError;
use crate::runner::CliRunner;

/// Engine mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Task scheduler with the destination lifecycle
    Tasks,
    /// Memory-bounded stream buffers drained by flush workers
    Buffered,
}

/// Arguments for `run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Configuration file (INI). Defaults to ./streamload.ini when present
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Stream to accept, as 'name' or 'namespace.name'. Repeatable
    #[arg(long = "stream", required = true)]
    pub streams: Vec<String>,

    /// Engine mode
    #[arg(long, value_enum, default_value = "tasks")]
    pub mode: Mode,

    /// Directory for the log file
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Records per batch in tasks mode
    #[arg(long, default_value_t = DEFAULT_BATCH_RECORDS)]
    pub batch_records: usize,
}

/// Parses `--stream` values into a catalog. Duplicates collapse.
pub fn parse_catalog(streams: &[String]) -> Result<Catalog, CliError> {
    let parsed = streams
        .iter()
        .map(|raw| raw.parse::<Stream>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CliError::InvalidStream(e.to_string()))?;
    Ok(Catalog::new(parsed))
}

/// Runs the command.
pub async fn run(args: RunArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.config.as_deref(), args.log_dir.as_deref())?;
    runner.log_startup("run");

    let catalog = Arc::new(parse_catalog(&args.streams)?);
    let destination = Arc::new(LogDestination::new(args.batch_records));
    info!(streams = catalog.len(), mode = ?args.mode, "Starting load");

    match args.mode {
        Mode::Tasks => run_tasks(&runner, catalog, Arc::clone(&destination)).await?,
        Mode::Buffered => run_buffered(&runner, catalog, Arc::clone(&destination)).await?,
    }

    eprint!("{}", destination.summary());
    Ok(())
}

async fn run_tasks(
    runner: &CliRunner,
    catalog: Arc<Catalog>,
    destination: Arc<LogDestination>,
) -> Result<(), CliError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stats = load_tasks(stdin, destination, catalog, runner.config()).await?;
    info!(
        tasks = stats.completed,
        deferred = stats.deferred,
        streams = stats.streams_completed,
        "Task run finished"
    );
    Ok(())
}

/// Feeds `reader` through the task path into `destination`.
///
/// Input and the lifecycle run side by side. A fatal input error aborts the
/// lifecycle before end-of-input is published, so streams close with
/// `succeeded = false`. A lifecycle failure stops reading input.
pub async fn load_tasks<R>(
    reader: R,
    destination: Arc<LogDestination>,
    catalog: Arc<Catalog>,
    config: &EngineConfig,
) -> Result<RunStats, CliError>
where
    R: AsyncBufRead + Unpin,
{
    let messages = Arc::new(MessageQueue::new(&catalog, &config.queue));
    let input = LineConsumer::<ProtocolMessage>::new(Arc::new(JsonDeserializer), messages.clone());
    let lifecycle = DestinationRunner::new(destination, catalog, Arc::clone(&messages), config)
        .with_telemetry(Arc::new(TracingTelemetrySink));
    let abort = lifecycle.abort_signal();

    let feed = async {
        match input.consume(reader).await {
            Ok(published) => {
                // Streams without a marker still need to reach close.
                messages.end_of_input();
                Ok(published)
            }
            Err(err) => {
                abort.abort(err.clone());
                Err(err)
            }
        }
    };
    let run = lifecycle.run();
    tokio::pin!(feed);
    tokio::pin!(run);

    let (outcome, consumed) = tokio::select! {
        outcome = &mut run => (outcome, None),
        consumed = &mut feed => (run.await, Some(consumed)),
    };

    let stats = outcome?;
    match consumed {
        Some(published) => info!(messages = published?, "Input fully loaded"),
        None => debug!("Lifecycle finished before input reached EOF"),
    }
    Ok(stats)
}

async fn run_buffered(
    runner: &CliRunner,
    catalog: Arc<Catalog>,
    destination: Arc<LogDestination>,
) -> Result<(), CliError> {
    let consumer = BufferedConsumer::new(
        destination,
        catalog,
        runner.config(),
        Arc::new(print_checkpoint),
    );
    consumer.start().await?;

    let consumed = consumer.consume(BufReader::new(tokio::io::stdin())).await;
    if let Err(e) = &consumed {
        warn!(error = %e, "Input stopped early, closing");
    }
    consumer.close().await?;
    let accepted = consumed?;
    info!(messages = accepted, records = consumer.records_accepted(), "Buffered run finished");
    Ok(())
}
