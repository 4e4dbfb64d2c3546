use crate::config::{self, CliOverrides, LogLevel};
use crate::server::{self, ActiveConfig, ProxyState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Proxy lifecycle: load config → init logging → serve → reload on
/// SIGHUP → shut down on SIGINT/SIGTERM. A fatal error here becomes exit
/// code 1 via `main`.
pub async fn run(cli: CliOverrides) -> Result<()> {
    let settings = config::load(&cli)?;
    init_tracing(settings.log_level);

    info!(
        listen = %format!("{}:{}", settings.listen_host, settings.listen_port),
        metrics = %format!("{}:{}", settings.metrics_host, settings.metrics_port),
        upstreams = settings.upstreams.len(),
        "configuration loaded"
    );

    let metrics_listener = server::bind(&settings.metrics_host, settings.metrics_port).await?;
    let proxy_listener = server::bind(&settings.listen_host, settings.listen_port).await?;

    let state = ProxyState::new(ActiveConfig::build(settings)?);
    let shutdown = Arc::new(Notify::new());

    start_reload_watcher(&state, &cli, &shutdown);

    {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_metrics_server(metrics_listener, state).await {
                error!(error = %e, "metrics endpoint failed");
            }
        });
    }

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(proxy_listener, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await? {
        error!(error = %e, "proxy server error during shutdown");
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(level: LogLevel) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter())))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    std::mem::forget(guard);
}

/// Re-resolve the configuration (same CLI and env precedence as startup)
/// and swap it in. On any error the previous configuration stays active.
pub fn reload(state: &ProxyState, cli: &CliOverrides) -> Result<()> {
    let settings = config::load(cli)?;
    let upstreams = settings.upstreams.len();
    state.install(ActiveConfig::build(settings)?);
    info!(upstreams, "configuration reloaded");
    Ok(())
}

#[cfg(unix)]
fn start_reload_watcher(state: &ProxyState, cli: &CliOverrides, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let cli = cli.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install SIGHUP handler");
                    return;
                }
            };
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    if let Err(e) = reload(&state, &cli) {
                        error!(error = %e, "reload failed, keeping previous configuration");
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

#[cfg(not(unix))]
fn start_reload_watcher(_state: &ProxyState, _cli: &CliOverrides, _shutdown: &Arc<Notify>) {}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
