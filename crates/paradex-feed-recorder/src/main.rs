/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: JSON-lines market data on stdout until shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use paradex_feed_adapter::FeedReceiver;
use paradex_feed_recorder::{JsonLinesSink, RecorderConfig, StreamSelection, write_records};

#[derive(Parser, Debug)]
#[command(name = "paradex-feed-recorder", version, about = "Paradex order book and trade recorder")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    #[arg(long = "stream", value_enum, default_value_t = StreamSelection::Both)]
    stream: StreamSelection,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let _log_guard = init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        stream = ?args.stream,
        "starting paradex-feed-recorder"
    );

    let config = load_config(&args.config_path)?;
    info!(
        symbols = config.symbols.len(),
        depth = config.book.depth,
        feed = ?config.book.feed,
        authenticated = config.bearer_token.is_some(),
        "configuration loaded"
    );

    let receiver_config = config.receiver_config(args.stream);
    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(JsonLinesSink::new(record_tx, config.output.book_format));
    let receiver = FeedReceiver::new(receiver_config, sink).context("build feed receiver")?;

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        write_records(record_rx, &mut stdout).await
    });

    let result = receiver.run(shutdown.clone()).await;
    let stats = receiver.stats();
    // Last sink handle; the writer drains and exits once it is gone.
    drop(receiver);

    let written = writer
        .await
        .context("join record writer")?
        .context("write records")?;
    info!(written, ?stats, "recorder stopped");

    result.context("feed receiver")?;
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    // stdout carries records only.
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}

fn load_config(path: &PathBuf) -> Result<RecorderConfig> {
    let path_str = path
        .to_str()
        .context("config path must be valid utf-8")?;
    RecorderConfig::load(path_str).context("load config")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
