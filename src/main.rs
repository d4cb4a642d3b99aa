//! peerwire - Main entry point
//!
//! Downloads a torrent from the given peers, then seeds it until interrupted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use peerwire::cli::{CliArgs, ProgressReporter, TransferStats};
use peerwire::{Controller, FileStorage, Orchestrator, Torrent, TorrentInfo, TorrentParser};
use tracing::{debug, error, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = args.engine_config().context("Invalid configuration")?;
    let info = load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?;
    display_torrent_info(&info);

    let torrent = Arc::new(Torrent::from_info(&info).context("Inconsistent torrent metadata")?);
    let storage = Arc::new(FileStorage::new(args.output_dir.clone(), info.files.clone()));
    storage
        .create_files()
        .await
        .with_context(|| format!("Failed to prepare {}", args.output_dir.display()))?;

    let controller = Controller::new(config.clone())?;
    let orchestrator = controller.register_torrent(torrent, storage)?;
    orchestrator.recheck().await;

    let listen_addr = controller.start(config.listen_port).await?;
    info!("Accepting peers on {}", listen_addr);

    for peer in &args.peers {
        if let Err(e) = controller.connect(orchestrator.info_hash(), *peer).await {
            warn!("Could not connect to {}: {}", peer, e);
        }
    }

    let mut progress = ProgressReporter::new(args.is_quiet(), PROGRESS_INTERVAL);
    let outcome = tokio::select! {
        result = run_download(&orchestrator, &mut progress) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            controller.stop().await;
            return Ok(());
        }
    };
    if let Err(e) = outcome {
        controller.stop().await;
        return Err(e);
    }
    progress.finish(&TransferStats::from_orchestrator(&orchestrator));

    if !args.no_seed {
        info!("Seeding '{}', press Ctrl-C to stop", orchestrator.torrent().name());
        tokio::select! {
            _ = run_seeding(&orchestrator, &mut progress) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
            }
        }
    }

    controller.stop().await;
    info!("peerwire finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());
    let info = TorrentParser::parse_file(path).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        e
    })?;
    info!("Loaded torrent: {}", info.name);
    Ok(info)
}

fn display_torrent_info(info: &TorrentInfo) {
    info!("Name: {}", info.name);
    info!(
        "Size: {} in {} files",
        TransferStats::format_bytes(info.total_length),
        info.files.len()
    );
    info!(
        "Pieces: {} of {}",
        info.piece_count(),
        TransferStats::format_bytes(info.piece_length as u64)
    );
    info!("Info hash: {}", info.info_hash_hex());
    for tracker in &info.trackers {
        debug!("Tracker: {}", tracker);
    }
}

/// Log progress until every piece is verified, failing on a torrent-wide error
async fn run_download(orchestrator: &Orchestrator, progress: &mut ProgressReporter) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        if let Some(err) = orchestrator.last_error() {
            error!("Download aborted: {}", err);
            return Err(err.into());
        }
        if orchestrator.torrent().is_complete() {
            info!("Download complete!");
            return Ok(());
        }
        progress.update(&TransferStats::from_orchestrator(orchestrator));
    }
}

async fn run_seeding(orchestrator: &Orchestrator, progress: &mut ProgressReporter) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        ticker.tick().await;
        progress.update(&TransferStats::from_orchestrator(orchestrator));
    }
}
