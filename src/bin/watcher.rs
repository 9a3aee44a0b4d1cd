use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wallet_watcher::config::Config;
use wallet_watcher::detector::TransferDetector;
use wallet_watcher::notifier::{Notifier, StdoutNotifier, TelegramNotifier};
use wallet_watcher::poll_loop::PollLoop;
use wallet_watcher::source::{ChainClient, ExplorerClient, RpcClient};
use wallet_watcher::watchlist::WatchList;

#[derive(Parser)]
#[command(name = "watcher")]
#[command(about = "Relay native and ERC-20 transfers of watched wallets to Telegram", long_about = None)]
struct Cli {
    /// CSV file with `address` and `nickname` columns (overrides WATCHLIST_PATH)
    #[arg(long)]
    watchlist: Option<PathBuf>,

    /// Print notifications to stdout instead of sending them
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires, so the watcher keeps running.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting wallet watcher");

    let mut config = Config::from_env()?;
    if let Some(path) = cli.watchlist {
        config.watchlist_path = path;
    }
    info!("Configuration loaded");
    info!(
        "RPC URLs: {} endpoint(s) configured",
        config.json_rpc_urls.len()
    );
    info!(
        "Internal transfer policy: {}, confirmations: {}, overlap: {} block(s)",
        config.internal_transfers, config.confirmations, config.overlap_blocks
    );

    let watchlist = Arc::new(
        WatchList::load(&config.watchlist_path)
            .with_context(|| format!("Failed to load {}", config.watchlist_path.display()))?,
    );

    let notifier: Arc<dyn Notifier> = match (&config.telegram, cli.dry_run) {
        (_, true) => Arc::new(StdoutNotifier),
        (Some(telegram), false) => Arc::new(TelegramNotifier::new(
            &telegram.api_url,
            &telegram.bot_token,
            &telegram.chat_id,
            config.request_timeout,
        )?),
        (None, false) => {
            bail!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set (or pass --dry-run)")
        }
    };

    let rpc = RpcClient::new(&config.json_rpc_urls, config.request_timeout)?;
    let explorer = ExplorerClient::new(
        &config.explorer_api_url,
        &config.explorer_api_key,
        config.explorer_chain_id,
        config.request_timeout,
    )?;
    info!("Chain clients ready");

    let detector = TransferDetector::new(
        ChainClient::new(rpc, explorer),
        watchlist.clone(),
        config.detector_settings(),
    );
    let poll_loop = PollLoop::new(
        detector,
        notifier.clone(),
        watchlist.clone(),
        config.poll_interval,
    );

    if let Err(e) = notifier
        .send(&format!(
            "Wallet watcher started, monitoring {} addresses",
            watchlist.len()
        ))
        .await
    {
        warn!("Startup message not delivered: {}", e);
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(poll_loop.run(shutdown.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received, stopping gracefully...");
    shutdown.cancel();

    if let Err(e) = handle.await {
        error!("Poll loop task panicked: {}", e);
    }

    if let Err(e) = notifier.send("Wallet watcher stopped").await {
        warn!("Shutdown message not delivered: {}", e);
    }

    Ok(())
}
