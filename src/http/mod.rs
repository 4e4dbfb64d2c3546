use std::collections::HashMap;
use std::fmt;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Upper bound on a single request line or header line. Anything longer is
/// treated as hostile and rejected.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Unit of streaming I/O in both directions. Unrelated to HTTP chunked
/// transfer encoding.
pub const CHUNK_SIZE: usize = 8192;

/// Why a request head could not be parsed. All variants end the connection
/// with no response.
#[derive(Debug)]
pub enum ParseError {
    Io(io::Error),
    LineTooLong,
    Malformed(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Io(e) => write!(f, "i/o error while reading request: {}", e),
            ParseError::LineTooLong => write!(f, "line exceeds {} bytes", MAX_LINE_BYTES),
            ParseError::Malformed(msg) => write!(f, "malformed request: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        ParseError::Io(e)
    }
}

/// A parsed request head. Header names are lowercased; on duplicates the
/// last value wins. The body is not buffered here; it is drained from the
/// client stream during `write_to_upstream`.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    /// `Content-Length: n`: stream exactly n bytes.
    Exact(u64),
    /// Chunked transfer encoding or a bodied method without a length:
    /// forward bytes verbatim until the client closes.
    UntilEof,
    /// No body.
    None,
}

/// Read one request head from the client stream.
///
/// Returns `Ok(None)` when the stream ends before the first line, meaning
/// the client connected and left without sending anything.
pub async fn parse_request<R>(reader: &mut R) -> Result<Option<HttpRequest>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let line = match read_crlf_line(reader).await? {
        Some(line) => line,
        None => return Ok(None),
    };

    let mut tokens = line.split_whitespace();
    let (method, path, version) = match (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    {
        (Some(m), Some(p), Some(v), None) => (m.to_string(), p.to_string(), v.to_string()),
        _ => {
            return Err(ParseError::Malformed(format!(
                "request line is not METHOD PATH VERSION: {:?}",
                line
            )))
        }
    };

    let mut headers = HashMap::new();
    loop {
        let line = match read_crlf_line(reader).await? {
            Some(line) => line,
            None => return Err(ParseError::Malformed("eof inside header block".to_string())),
        };
        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
            None => {
                debug!(line = %line, "skipping header line without a colon");
            }
        }
    }

    Ok(Some(HttpRequest {
        method,
        path,
        version,
        headers,
    }))
}

impl HttpRequest {
    /// Serialize the request to the upstream and stream the body from the
    /// client behind it.
    ///
    /// Two headers are rewritten on the way through: `Connection` is forced
    /// to `close`, and when a trace id is given an `X-Trace-Id` header
    /// replaces any inbound value. Everything else passes through with
    /// canonical casing. The head is flushed before the body, and the
    /// writer is flushed again after the final body byte.
    pub async fn write_to_upstream<R, W>(
        &self,
        client_body: &mut R,
        upstream: &mut W,
        trace_id: Option<&str>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut head = String::with_capacity(256);
        head.push_str(&self.method);
        head.push(' ');
        head.push_str(&self.path);
        head.push(' ');
        head.push_str(&self.version);
        head.push_str("\r\n");

        for (name, value) in &self.headers {
            if name == "connection" || (trace_id.is_some() && name == "x-trace-id") {
                continue;
            }
            head.push_str(&canonical_name(name));
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n");
        if let Some(id) = trace_id {
            head.push_str("X-Trace-Id: ");
            head.push_str(id);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        upstream.write_all(head.as_bytes()).await?;
        upstream.flush().await?;

        match self.body_mode() {
            BodyMode::Exact(len) => {
                let copied = copy_exact(client_body, upstream, len).await?;
                if copied < len {
                    warn!(
                        expected = len,
                        copied, "client stream ended before declared body length"
                    );
                }
            }
            BodyMode::UntilEof => {
                copy_until_eof(client_body, upstream).await?;
            }
            BodyMode::None => {}
        }

        upstream.flush().await
    }

    fn body_mode(&self) -> BodyMode {
        if let Some(raw) = self.headers.get("content-length") {
            if let Ok(len) = raw.trim().parse::<u64>() {
                return BodyMode::Exact(len);
            }
        }
        if let Some(te) = self.headers.get("transfer-encoding") {
            let chunked = te
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
            if chunked {
                return BodyMode::UntilEof;
            }
        }
        if matches!(
            self.method.to_ascii_uppercase().as_str(),
            "POST" | "PUT" | "PATCH"
        ) {
            return BodyMode::UntilEof;
        }
        BodyMode::None
    }
}

/// Extract the status code from the first response chunk: second
/// whitespace-separated token of the first line, 200 if that fails.
pub fn scan_status_code(first_chunk: &[u8]) -> u16 {
    let line_end = first_chunk
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(first_chunk.len());
    let line = String::from_utf8_lossy(&first_chunk[..line_end]);
    line.split_whitespace()
        .nth(1)
        .and_then(|token| token.parse::<u16>().ok())
        .unwrap_or(200)
}

/// Read one CRLF-terminated line, bounded by `MAX_LINE_BYTES`.
/// `Ok(None)` on EOF before any byte.
async fn read_crlf_line<R>(reader: &mut R) -> Result<Option<String>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take((MAX_LINE_BYTES + 2) as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !raw.ends_with(b"\n") {
        if raw.len() >= MAX_LINE_BYTES {
            return Err(ParseError::LineTooLong);
        }
        return Err(ParseError::Malformed("stream ended mid-line".to_string()));
    }
    raw.pop();
    if raw.last() != Some(&b'\r') {
        return Err(ParseError::Malformed(
            "line terminated by bare LF, expected CRLF".to_string(),
        ));
    }
    raw.pop();
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

/// `content-type` → `Content-Type`: each hyphen-separated segment gets its
/// first letter upper-cased and the rest lowered.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, segment) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            for c in chars {
                out.push(c.to_ascii_lowercase());
            }
        }
    }
    out
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        remaining -= n as u64;
    }
    Ok(len - remaining)
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
    Ok(total)
}
