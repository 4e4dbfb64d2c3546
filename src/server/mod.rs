pub mod bootstrap;
mod state;

pub use state::{ActiveConfig, ProxyState};

use crate::http;
use crate::metrics::ProxyMetrics;
use crate::proxy;
use anyhow::{Context, Result};
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Bind a listener. Split out from the serve loops so tests (and the
/// bootstrap) can bind port 0 and read the assigned address back.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))
}

/// Accept loop for proxied traffic: one spawned task per connection, one
/// request per connection. On shutdown it stops accepting and gives
/// in-flight connections a bounded window to finish.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: ProxyState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

    info!(addr = %listener.local_addr()?, "proxy listening");
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("stop accepting new connections, draining");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };

        let state = state.clone();
        let active_conns = active_conns.clone();
        active_conns.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            proxy::handle_client(stream, peer_addr, state).await;
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let drain = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        info!(
            remaining = active_conns.load(Ordering::Relaxed),
            "drain window elapsed with connections still active"
        );
    }

    Ok(())
}

/// Accept loop for the metrics endpoint. Speaks just enough HTTP/1.1,
/// via the crate's own framer: `GET /metrics` gets the rendered counters,
/// anything else a 404.
pub async fn run_metrics_server(listener: TcpListener, state: ProxyState) -> Result<()> {
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let metrics = state.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics_conn(stream, metrics).await {
                debug!(error = %e, "metrics connection error");
            }
        });
    }
}

async fn serve_metrics_conn(stream: TcpStream, metrics: Arc<ProxyMetrics>) -> io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match http::parse_request(&mut reader).await {
        Ok(Some(request)) => request,
        _ => return Ok(()),
    };

    let path = request.path.split('?').next().unwrap_or("");
    let response = if request.method == "GET" && path == "/metrics" {
        let body = metrics.render();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n".to_string()
    };

    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}
