//! rustpipe - run newline-delimited JSON through a stage pipeline.
//!
//! Payloads are read from stdin, results are written to stdout and error
//! records to stderr (or `--errors <file>`), one JSON document per line.

use anyhow::{bail, Context};
use clap::Parser;
use rustpipe::metrics::Metrics;
use rustpipe::pipeline::PipelineRun;
use rustpipe::{logging, stages, Config, Message, PipelineComposer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rustpipe")]
#[command(about = "Run NDJSON records through a stage pipeline")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name of a pipeline defined in the configuration file
    #[arg(long, conflicts_with = "definition", required_unless_present = "definition")]
    pipeline: Option<String>,

    /// Inline pipeline definition, e.g. "drop_null|require_object|collect(size=50)"
    #[arg(long)]
    definition: Option<String>,

    /// Write error records to this file instead of stderr
    #[arg(long)]
    errors: Option<PathBuf>,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let path = path
                .to_str()
                .with_context(|| format!("config path {} is not UTF-8", path.display()))?;
            Config::from_file(path)?
        }
        None => Config::default(),
    };
    config.validate()?;
    logging::init(&config.logging);

    let registry = Arc::new(stages::builtin_registry()?);
    let metrics = Metrics::new()?;
    let composer =
        PipelineComposer::new(registry, config.engine.clone()).with_metrics(Arc::clone(&metrics));

    let pipeline = match (&cli.pipeline, &cli.definition) {
        (Some(name), _) => composer.compose_config(config.pipeline(name)?)?,
        (None, Some(definition)) => composer.compose(definition)?,
        (None, None) => bail!("either --pipeline or --definition is required"),
    };
    info!("Starting pipeline {}: {}", pipeline.name(), pipeline.definition());

    let error_out: Box<dyn AsyncWrite + Unpin + Send> = match &cli.errors {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stderr()),
    };

    let (tx, rx) = mpsc::channel(config.engine.channel_capacity.max(1));
    let reader = tokio::spawn(read_stdin(tx));

    let PipelineRun {
        results,
        errors,
        handle,
    } = pipeline.run(ReceiverStream::new(rx));

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pipeline");
            cancel.cancel();
        }
    });

    let result_writer = write_ndjson(
        results.map(|m| m.payload),
        BufWriter::new(tokio::io::stdout()),
    );
    let error_writer = write_ndjson(errors, BufWriter::new(error_out));
    let (written, diverted) = tokio::try_join!(result_writer, error_writer)?;

    let summary = handle.wait().await?;
    if reader.is_finished() {
        if let Err(e) = reader.await? {
            error!("Failed reading stdin: {}", e);
        }
    } else {
        // Still blocked on stdin after a cancel
        reader.abort();
    }

    info!(
        "Pipeline finished: {} in, {} out, {} errors, {} dropped",
        summary.received, written, diverted, summary.dropped
    );

    if cli.metrics {
        eprint!("{}", metrics.gather_text()?);
    }

    Ok(())
}

/// Feed stdin lines into the pipeline source. Lines that are not valid JSON
/// are skipped with a warning.
async fn read_stdin(tx: mpsc::Sender<Message>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(payload) => {
                if tx.send(Message::new(payload)).await.is_err() {
                    // Pipeline stopped reading
                    break;
                }
            }
            Err(e) => warn!("Skipping line {}: invalid JSON: {}", line_no, e),
        }
    }
    Ok(())
}

async fn write_ndjson<S, T, W>(stream: S, mut out: W) -> anyhow::Result<u64>
where
    S: tokio_stream::Stream<Item = T>,
    T: serde::Serialize,
    W: AsyncWrite + Unpin,
{
    tokio::pin!(stream);
    let mut count = 0;
    while let Some(item) = stream.next().await {
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        count += 1;
    }
    out.flush().await?;
    Ok(count)
}
