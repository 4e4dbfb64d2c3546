use crate::error::ProxyError;
use crate::http::{self, HttpRequest, CHUNK_SIZE};
use crate::proxy::RequestContext;
use crate::server::ProxyState;
use crate::timeout::{Phase, TimeoutPolicy};
use crate::upstream::Upstream;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn, Instrument};

/// Entry point for one accepted client connection. Installs the
/// connection span (trace id) and runs the request lifecycle:
///
/// 1. acquire the global client gate
/// 2. parse the request head
/// 3. select an upstream (round-robin) and acquire its gate
/// 4. forward through the upstream's circuit breaker, under the total
///    deadline
/// 5. map failures to 502/504 while no response byte has reached the
///    client; afterwards just tear down
/// 6. record metrics and release everything, in reverse order
pub async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, state: ProxyState) {
    let ctx = RequestContext::new(peer_addr);
    let span = tracing::info_span!("conn", trace_id = %ctx.trace_id);
    drive(stream, state, ctx).instrument(span).await;
}

async fn drive(stream: TcpStream, state: ProxyState, mut ctx: RequestContext) {
    // Pin this connection's view of the config: a SIGHUP reload only
    // affects connections accepted after it.
    let cfg = state.config.load_full();
    let metrics = state.metrics.clone();
    let policy = cfg.timeouts;

    // Global client slot; the wait is bounded by the total deadline.
    let _client_permit = match policy.total(cfg.limits.client_gate().acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            warn!("client gate is closed");
            return;
        }
        Err(_) => {
            metrics.record_timeout(Phase::Total);
            metrics.record_response_status(504);
            warn!(peer = %ctx.peer_addr, "timed out waiting for a client slot");
            let (_, mut writer) = stream.into_split();
            let _ =
                write_error_response(&mut writer, "HTTP/1.1", 504, "Gateway Timeout", "Upstream timeout")
                    .await;
            let _ = writer.shutdown().await;
            return;
        }
    };
    debug!(peer = %ctx.peer_addr, "client connected");

    let (read_half, mut client_writer) = stream.into_split();
    let mut client_reader = BufReader::new(read_half);

    let request = match http::parse_request(&mut client_reader).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            metrics.record_parse_error();
            debug!(peer = %ctx.peer_addr, "client closed before sending a request");
            return;
        }
        Err(err) => {
            metrics.record_parse_error();
            warn!(peer = %ctx.peer_addr, error = %err, "failed to parse request");
            return;
        }
    };

    metrics.record_request_start();
    ctx.start = Instant::now();
    info!(
        method = %request.method,
        path = %request.path,
        version = %request.version,
        "request"
    );

    let upstream = cfg.pool.next();
    ctx.upstream = Some(upstream.clone());
    debug!(upstream = %upstream, "selected upstream");

    let _upstream_permit = match policy
        .total(cfg.limits.upstream_gate(&upstream).acquire_owned())
        .await
    {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            warn!(upstream = %upstream, "upstream gate is closed");
            return;
        }
        Err(_) => {
            metrics.record_timeout(Phase::Total);
            metrics.record_upstream_error(&ctx.upstream_key(), "timeout");
            metrics.record_response_status(504);
            warn!(upstream = %upstream, "timed out waiting for an upstream slot");
            let _ = write_error_response(
                &mut client_writer,
                &request.version,
                504,
                "Gateway Timeout",
                "Upstream timeout",
            )
            .await;
            let _ = client_writer.shutdown().await;
            return;
        }
    };

    let breaker = cfg.breakers.breaker(&upstream);
    let result = breaker
        .execute(async {
            match policy
                .total(forward(
                    &request,
                    &mut client_reader,
                    &mut client_writer,
                    &upstream,
                    policy,
                    &ctx.trace_id,
                    &ctx.bytes_sent,
                ))
                .await
            {
                Ok(inner) => inner,
                Err(elapsed) => Err(elapsed),
            }
        })
        .await;

    match result {
        Ok((status, bytes)) => {
            metrics.record_request_done(ctx.elapsed(), status, &ctx.upstream_key(), bytes);
            info!(
                status,
                bytes,
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                upstream = %upstream,
                "request finished"
            );
        }
        Err(err) => {
            metrics.record_upstream_error(&ctx.upstream_key(), err.error_kind());
            if let Some(phase) = err.timeout_phase() {
                metrics.record_timeout(phase);
            }
            warn!(upstream = %upstream, error = %err, "request failed");

            // First-byte rule: once any response byte is in flight the
            // connection is torn down without an error body.
            if ctx.bytes_sent() == 0 && !matches!(err, ProxyError::Client(_)) {
                let status = err.status_code();
                metrics.record_response_status(status);
                if write_error_response(
                    &mut client_writer,
                    &request.version,
                    status,
                    err.status_reason(),
                    &err.body_line(),
                )
                .await
                .is_err()
                {
                    debug!("client went away before the error response");
                }
            }
        }
    }

    // Gates release on drop in reverse acquisition order; the upstream
    // socket was owned by the forward and is already closed.
    let _ = client_writer.shutdown().await;
    debug!(peer = %ctx.peer_addr, "client disconnected");
}

/// The proxied exchange with one upstream: connect, transmit the request,
/// then stream the response back chunk by chunk. Each phase runs under
/// its own deadline; the caller adds the total deadline and the breaker's
/// accounting. Returns the upstream status code and the bytes forwarded.
async fn forward<R, W>(
    request: &HttpRequest,
    client_body: &mut R,
    client_writer: &mut W,
    upstream: &Upstream,
    policy: TimeoutPolicy,
    trace_id: &str,
    bytes_sent: &AtomicU64,
) -> Result<(u16, u64), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!(upstream = %upstream, "connecting to upstream");
    let upstream_stream = policy
        .connect(TcpStream::connect((upstream.host.as_str(), upstream.port)))
        .await?
        .map_err(ProxyError::Connect)?;
    let (mut upstream_reader, mut upstream_writer) = upstream_stream.into_split();

    policy
        .write(request.write_to_upstream(client_body, &mut upstream_writer, Some(trace_id)))
        .await?
        .map_err(ProxyError::Write)?;
    debug!(upstream = %upstream, "request forwarded, streaming response");

    let mut status: u16 = 200;
    let mut first_chunk = true;
    let mut total: u64 = 0;
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

    loop {
        buf.clear();
        let n = policy
            .read(tokio::io::AsyncReadExt::read_buf(
                &mut upstream_reader,
                &mut buf,
            ))
            .await?
            .map_err(ProxyError::Read)?;
        if n == 0 {
            break;
        }
        if first_chunk {
            status = http::scan_status_code(&buf);
            first_chunk = false;
        }
        // Writing to the client is paced by the client itself: write_all
        // suspends until the socket drains, which is the backpressure
        // that keeps the proxy from buffering the response.
        client_writer
            .write_all(&buf)
            .await
            .map_err(ProxyError::Client)?;
        client_writer.flush().await.map_err(ProxyError::Client)?;
        bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
    }

    client_writer.flush().await.map_err(ProxyError::Client)?;
    Ok((status, total))
}

async fn write_error_response<W>(
    writer: &mut W,
    version: &str,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "{} {} {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
        version, status, reason, body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
