// Spectre Stratum bridge
//
// Config: defaults < JSON file < SPECTRE_* env < command-line flags

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use spectre_bridge::banned::BannedWallets;
use spectre_bridge::blockchain::{NodeHandle, SpectreRpcClient, TemplateCache};
use spectre_bridge::config::{normalize_listen, BridgeConfig};
use spectre_bridge::extranonce::ExtranonceAllocator;
use spectre_bridge::metrics::prometheus as metrics;
use spectre_bridge::pow::{HeavyHasher, PowHasher};
use spectre_bridge::shares::ShareValidator;
use spectre_bridge::stats::{self, StatsBoard};
use spectre_bridge::stratum::{BridgeContext, SessionSettings, StratumBridge};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stratum bridge for spectred", long_about = None)]
struct Args {
    /// JSON config file (default: bridge_config.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stratum listen address, e.g. ":5555"
    #[arg(long)]
    stratum: Option<String>,

    /// spectred RPC address
    #[arg(long)]
    spectre: Option<String>,

    /// Force a template refresh after this many milliseconds without a new tip
    #[arg(long)]
    blockwait: Option<u64>,

    /// Minimum (and starting) share difficulty
    #[arg(long)]
    mindiff: Option<u64>,

    /// Enable variable difficulty
    #[arg(long)]
    vardiff: Option<bool>,

    /// Target shares per minute per miner
    #[arg(long)]
    sharespermin: Option<u32>,

    /// Log a periodic vardiff readout
    #[arg(long)]
    vardiffstats: Option<bool>,

    /// Extranonce size in bytes (0-4)
    #[arg(long)]
    extranonce: Option<u8>,

    /// Prometheus exporter address, empty to disable
    #[arg(long)]
    prom: Option<String>,

    /// Log the worker stats table
    #[arg(long)]
    stats: Option<bool>,

    /// Health check address (serves /readyz), empty to disable
    #[arg(long)]
    hcp: Option<String>,
}

impl Args {
    fn apply(self, cfg: &mut BridgeConfig) {
        if let Some(v) = self.stratum {
            cfg.stratum_port = v;
        }
        if let Some(v) = self.spectre {
            cfg.rpc_server = v;
        }
        if let Some(v) = self.blockwait {
            cfg.block_wait_ms = v;
        }
        if let Some(v) = self.mindiff {
            cfg.min_share_diff = v;
        }
        if let Some(v) = self.vardiff {
            cfg.var_diff = v;
        }
        if let Some(v) = self.sharespermin {
            cfg.shares_per_min = v;
        }
        if let Some(v) = self.vardiffstats {
            cfg.var_diff_stats = v;
        }
        if let Some(v) = self.extranonce {
            cfg.extranonce_size = v;
        }
        if let Some(v) = self.prom {
            cfg.prom_port = v;
        }
        if let Some(v) = self.stats {
            cfg.print_stats = v;
        }
        if let Some(v) = self.hcp {
            cfg.health_check_port = v;
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

#[derive(Clone)]
struct ReadyState {
    cache: Arc<TemplateCache>,
    max_age: Duration,
}

/// Ready once a template newer than the staleness bound is cached.
async fn readyz_handler(State(state): State<ReadyState>) -> impl IntoResponse {
    if state.cache.is_stale(state.max_age) {
        (StatusCode::SERVICE_UNAVAILABLE, "no fresh template")
    } else {
        (StatusCode::OK, "ok")
    }
}

async fn serve_http(name: &'static str, addr: String, router: Router, cancel: CancellationToken) {
    let addr = normalize_listen(&addr);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {} on {}: {}", name, addr, e);
            return;
        }
    };
    tracing::info!("📡 {} listening on {}", name, addr);
    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("{} server error: {}", name, e);
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Ctrl+C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

fn log_banner(cfg: &BridgeConfig) {
    tracing::info!("🚀 Spectre Stratum bridge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("   stratum:        {}", cfg.stratum_listen());
    tracing::info!("   spectred:       {}", cfg.rpc_server);
    tracing::info!("   payout address: {}", cfg.payout_address());
    tracing::info!("   block wait:     {}ms", cfg.block_wait_ms);
    tracing::info!(
        "   difficulty:     min {} max {} (vardiff {}, {} shares/min)",
        cfg.min_share_diff,
        cfg.max_share_diff,
        if cfg.var_diff { "on" } else { "off" },
        cfg.shares_per_min
    );
    tracing::info!(
        "   extranonce:     {} bytes, stale window {} jobs",
        cfg.extranonce_size,
        cfg.stale_window
    );
    if !cfg.prom_port.is_empty() {
        tracing::info!("   prometheus:     {}", cfg.prom_port);
    }
    if !cfg.health_check_port.is_empty() {
        tracing::info!("   health check:   {}", cfg.health_check_port);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let args = Args::parse();
    let mut cfg = BridgeConfig::load(args.config.as_deref()).context("loading config")?;
    args.apply(&mut cfg);
    cfg.validate()?;
    log_banner(&cfg);

    let banned = BannedWallets::load(Path::new(&cfg.banned_wallets_path))
        .with_context(|| format!("loading banned wallets from {}", cfg.banned_wallets_path))?;

    let hasher: Arc<dyn PowHasher> = Arc::new(HeavyHasher::new());
    let client = Arc::new(SpectreRpcClient::new(
        &cfg.rpc_server,
        cfg.payout_address().to_string(),
        cfg.rpc_timeout(),
    ));
    let node = Arc::new(NodeHandle::new(
        client.clone(),
        cfg.rpc_timeout(),
        cfg.retry_policy(),
    ));
    let cache = Arc::new(TemplateCache::new(
        Arc::clone(&hasher),
        cfg.stale_window,
        cfg.extranonce_size,
    ));
    let board = Arc::new(StatsBoard::new());

    let ctx = BridgeContext {
        cache: Arc::clone(&cache),
        node,
        allocator: Arc::new(ExtranonceAllocator::new(cfg.extranonce_size)),
        validator: ShareValidator::new(hasher),
        banned: Arc::new(banned),
        stats: Arc::clone(&board),
        settings: SessionSettings {
            vardiff: cfg.vardiff(),
            recent_shares: cfg.recent_shares,
            default_wallet: cfg.default_wallet.clone(),
            idle_timeout: cfg.idle_timeout(),
            template_max_age: cfg.template_max_age(),
        },
    };

    let bridge = StratumBridge::bind(&cfg.stratum_listen(), ctx, cfg.block_wait()).await?;
    let shutdown = bridge.shutdown_token();

    let tip_poller =
        client.spawn_tip_poller(Duration::from_millis(cfg.tip_poll_ms), shutdown.child_token());

    if cfg.print_stats || cfg.var_diff_stats {
        stats::spawn_printer(
            Arc::clone(&board),
            Duration::from_secs(cfg.stats_interval_secs.max(1)),
            cfg.print_stats,
            cfg.var_diff_stats.then_some(cfg.shares_per_min as f64),
            shutdown.child_token(),
        );
    }

    if !cfg.prom_port.is_empty() {
        let router = Router::new().route("/metrics", get(metrics_handler));
        tokio::spawn(serve_http(
            "Prometheus exporter",
            cfg.prom_port.clone(),
            router,
            shutdown.child_token(),
        ));
    }

    if !cfg.health_check_port.is_empty() {
        let router = Router::new()
            .route("/readyz", get(readyz_handler))
            .with_state(ReadyState {
                cache: Arc::clone(&cache),
                max_age: cfg.template_max_age(),
            });
        tokio::spawn(serve_http(
            "Health check",
            cfg.health_check_port.clone(),
            router,
            shutdown.child_token(),
        ));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    bridge.run().await?;
    let _ = tip_poller.await;

    tracing::info!("🏁 Spectre bridge shut down cleanly");
    Ok(())
}
