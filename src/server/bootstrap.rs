use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::CoreConfig;
use crate::server::{self, GatewayState};

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Gateway lifecycle: init → build state → start workers → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration. A bad config is fatal before any socket opens.
    let mut config = CoreConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.admin_listen = admin_listen;
    }
    let listen = config.listen.clone();
    let admin_listen = config.admin_listen.clone();

    // Phase 2: build state (audit and reporter workers start here).
    let state = GatewayState::new(config)?;

    // Phase 3: maintenance loops.
    let shutdown = Arc::new(Notify::new());
    start_trace_cleanup(&state, &shutdown);
    start_limiter_gc(&state, &shutdown);

    // Phase 4: admin + proxy servers.
    start_admin_server(&state, &admin_listen);

    tracing::info!("server: starting gateway, listen={}", listen);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 5: block until a signal, then drain.
    wait_for_signal().await;
    tracing::info!("server: shutdown signal received");

    state.begin_shutdown();
    shutdown.notify_waiters();

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }
    state.drain().await;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Expire trace contexts that never completed.
fn start_trace_cleanup(state: &GatewayState, shutdown: &Arc<Notify>) {
    let traces = state.traces.clone();
    let cleanup = state.config.load().tracing_pipeline.cleanup.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(cleanup.interval_ms.max(1_000)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => {
                    let dropped = traces.cleanup_expired(cleanup.max_age_ms);
                    if dropped > 0 {
                        tracing::info!("trace: cleanup dropped {} stale contexts", dropped);
                    }
                }
            }
        }
    });
}

/// Evict idle limiter keys so per-IP / per-user maps stay bounded.
fn start_limiter_gc(state: &GatewayState, shutdown: &Arc<Notify>) {
    let limits = state.limits.clone();
    let qps = state.qps.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = interval.tick() => {
                    limits.evict_idle();
                    qps.cleanup();
                }
            }
        }
    });
}

fn start_admin_server(state: &GatewayState, admin_listen: &str) {
    let state = state.clone();
    let admin_listen = admin_listen.to_string();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_listen, state).await {
            tracing::error!("server: admin server error: {}", e);
        }
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
