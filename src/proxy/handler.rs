//! Per-connection proxy handling
//!
//! Reads the client's request line and dispatches to CONNECT tunneling or plain
//! HTTP forwarding through the current upstream endpoint.

use std::time::Duration;

use http::Method;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::{JobProxyError, Result};
use crate::models::ProxyEndpoint;
use crate::proxy::transport::{
    normalize_authority, open_tunnel, parse_status_code, write_all_flush, UpstreamDialer,
};
use crate::proxy::tunnel::TunnelHandler;

/// Longest accepted request or header line
const MAX_LINE: usize = 8 * 1024;
/// Largest accepted request head (request line plus headers)
const MAX_HEAD: usize = 64 * 1024;

/// Deadlines applied by a forwarding server
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Timeout for each upstream dial
    pub connect_timeout: Duration,
    /// Timeout for reading request and response heads
    pub request_timeout: Duration,
    /// Tunnel is closed after this long without traffic in either direction
    pub idle_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Parsed first line of a proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// Parse `METHOD target HTTP/x.y`; `None` for anything malformed
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;

        if !version.starts_with("HTTP/") {
            return None;
        }

        Some(Self {
            method: Method::from_bytes(method.as_bytes()).ok()?,
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    fn to_wire(&self) -> String {
        format!("{} {} {}\r\n", self.method, self.target, self.version)
    }
}

/// Handles a single accepted client connection
pub struct ConnectionHandler {
    dialer: UpstreamDialer,
    config: ForwarderConfig,
}

impl ConnectionHandler {
    pub fn new(dialer: UpstreamDialer, config: ForwarderConfig) -> Self {
        Self { dialer, config }
    }

    /// Serve one client connection to completion
    pub async fn handle<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut client = BufReader::new(stream);

        let line = timeout(
            self.config.request_timeout,
            read_line_limited(&mut client, MAX_LINE),
        )
        .await
        .map_err(|_| JobProxyError::Timeout)??;

        let Some(request) = RequestLine::parse(&line) else {
            return Err(JobProxyError::InvalidRequest(format!(
                "Malformed request line: {:?}",
                line.trim_end()
            )));
        };

        debug!(method = %request.method, uri = %request.target, "Proxy request");

        if request.method == Method::CONNECT {
            self.handle_connect(client, request).await
        } else {
            self.handle_http(client, request).await
        }
    }

    /// CONNECT: open a tunnel through the upstream and relay raw bytes
    async fn handle_connect<S>(&self, mut client: BufReader<S>, request: RequestLine) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let authority = normalize_authority(&request.target)?;

        // The client's CONNECT headers are meant for us, not the upstream.
        self.read_headers(&mut client).await?;

        let (mut upstream, endpoint) = match self.dialer.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                error!(authority = %authority, "All proxies failed for HTTPS: {}", e);
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        let head = match open_tunnel(
            &mut upstream,
            &endpoint,
            &authority,
            self.config.request_timeout,
        )
        .await
        {
            Ok(head) => head,
            Err(e) => {
                warn!(endpoint = %endpoint, authority = %authority, "CONNECT handshake failed: {}", e);
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        // Relay the upstream's answer verbatim, whatever it is.
        write_all_flush(&mut client, &head).await?;

        match parse_status_code(&head) {
            Some(status) if (200..300).contains(&status) => {}
            status => {
                warn!(
                    endpoint = %endpoint,
                    authority = %authority,
                    status = ?status,
                    "Upstream refused CONNECT"
                );
                return Ok(());
            }
        }

        debug!(endpoint = %endpoint, authority = %authority, "CONNECT tunnel established");

        let (bytes_sent, bytes_received) =
            TunnelHandler::copy_bidirectional(client, upstream, self.config.idle_timeout).await;
        debug!(
            authority = %authority,
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            "CONNECT tunnel finished"
        );

        Ok(())
    }

    /// Plain HTTP: forward one request with injected credentials, then relay
    /// the upstream response until it closes.
    ///
    /// The upstream is asked to close after responding, so every request on a
    /// client connection goes through `build_forward_head`; later pipelined
    /// requests are never relayed raw.
    async fn handle_http<S>(&self, mut client: BufReader<S>, request: RequestLine) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let headers = self.read_headers(&mut client).await?;
        let framing = BodyFraming::from_headers(&headers)?;

        let (mut upstream, endpoint) = match self.dialer.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                error!(uri = %request.target, "All proxies failed for HTTP: {}", e);
                reject(&mut client, &e).await;
                return Err(e);
            }
        };

        let head = build_forward_head(&request, &headers, &endpoint);
        write_all_flush(&mut upstream, head.as_bytes()).await?;
        let bytes_sent =
            forward_body(&mut client, &mut upstream, framing, self.config.idle_timeout).await?;

        let bytes_received =
            TunnelHandler::copy_one_way(&mut upstream, &mut client, self.config.idle_timeout)
                .await?;
        let _ = client.shutdown().await;

        debug!(
            method = %request.method,
            uri = %request.target,
            endpoint = %endpoint,
            bytes_sent = bytes_sent,
            bytes_received = bytes_received,
            "HTTP request forwarded"
        );

        Ok(())
    }

    async fn read_headers<R>(&self, reader: &mut R) -> Result<Vec<String>>
    where
        R: AsyncBufRead + Unpin,
    {
        timeout(self.config.request_timeout, read_head_lines(reader))
            .await
            .map_err(|_| JobProxyError::Timeout)?
    }
}

/// Request head sent upstream for plain HTTP
///
/// Any client `Proxy-Authorization` is dropped, along with connection-scoped
/// headers. The endpoint's credentials and `Connection: close` are appended.
pub fn build_forward_head(
    request: &RequestLine,
    headers: &[String],
    endpoint: &ProxyEndpoint,
) -> String {
    let mut head = request.to_wire();

    for line in headers {
        let name = header_name(line);
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        head.push_str(line.trim_end_matches(['\r', '\n']));
        head.push_str("\r\n");
    }

    if let Some(auth) = endpoint.basic_auth() {
        head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }

    head.push_str("Connection: close\r\n\r\n");
    head
}

/// Headers that are never forwarded on the plain HTTP path
const HOP_BY_HOP: [&str; 4] = [
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

fn header_name(line: &str) -> &str {
    line.split(':').next().unwrap_or_default().trim()
}

fn header_value(line: &str) -> &str {
    line.split_once(':').map_or("", |(_, v)| v.trim())
}

/// How the body of a plain HTTP request is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

impl BodyFraming {
    pub fn from_headers(headers: &[String]) -> Result<Self> {
        let mut length = None;
        let mut chunked = false;

        for line in headers {
            let name = header_name(line);
            if name.eq_ignore_ascii_case("transfer-encoding") {
                let last = header_value(line).rsplit(',').next().unwrap_or_default();
                if !last.trim().eq_ignore_ascii_case("chunked") {
                    return Err(JobProxyError::InvalidRequest(format!(
                        "Unsupported transfer encoding: {}",
                        header_value(line)
                    )));
                }
                chunked = true;
            } else if name.eq_ignore_ascii_case("content-length") {
                let value = parse_decimal(header_value(line)).ok_or_else(|| {
                    JobProxyError::InvalidRequest("Invalid Content-Length".to_string())
                })?;
                if length.is_some_and(|existing| existing != value) {
                    return Err(JobProxyError::InvalidRequest(
                        "Conflicting Content-Length headers".to_string(),
                    ));
                }
                length = Some(value);
            }
        }

        Ok(match (chunked, length) {
            (true, _) => Self::Chunked,
            (false, Some(0)) | (false, None) => Self::None,
            (false, Some(n)) => Self::Length(n),
        })
    }
}

fn parse_decimal(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn parse_chunk_size(line: &str) -> Option<u64> {
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(size, 16).ok()
}

/// Copy exactly one request body from `reader` to `writer`
async fn forward_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    idle_timeout: Duration,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(len) => copy_exact(reader, writer, len, idle_timeout).await,
        BodyFraming::Chunked => {
            let mut total = 0u64;
            loop {
                let line = read_body_line(reader, idle_timeout).await?;
                writer.write_all(line.as_bytes()).await?;
                total += line.len() as u64;

                let size = parse_chunk_size(&line).ok_or_else(|| {
                    JobProxyError::InvalidRequest("Invalid chunk size".to_string())
                })?;
                if size == 0 {
                    break;
                }
                // Chunk data plus its trailing CRLF
                total += copy_exact(reader, writer, size + 2, idle_timeout).await?;
            }

            // Trailer section up to the final blank line
            loop {
                let line = read_body_line(reader, idle_timeout).await?;
                writer.write_all(line.as_bytes()).await?;
                total += line.len() as u64;
                if line == "\r\n" || line == "\n" {
                    break;
                }
            }

            writer.flush().await?;
            Ok(total)
        }
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64, idle_timeout: Duration) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut limited = (&mut *reader).take(len);
    let copied = TunnelHandler::copy_one_way(&mut limited, writer, idle_timeout).await?;
    if copied < len {
        return Err(JobProxyError::InvalidRequest(
            "Request body truncated".to_string(),
        ));
    }
    Ok(copied)
}

async fn read_body_line<R>(reader: &mut R, idle_timeout: Duration) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    timeout(idle_timeout, read_line_limited(reader, MAX_LINE))
        .await
        .map_err(|_| JobProxyError::Timeout)?
}

/// Read header lines up to the blank-line terminator (not included)
async fn read_head_lines<R>(reader: &mut R) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut budget = MAX_HEAD;

    loop {
        let line = read_line_limited(reader, MAX_LINE.min(budget)).await?;
        if line == "\r\n" || line == "\n" {
            return Ok(lines);
        }
        budget = budget.saturating_sub(line.len());
        if budget == 0 {
            return Err(JobProxyError::InvalidRequest(
                "Request head too large".to_string(),
            ));
        }
        lines.push(line);
    }
}

async fn read_line_limited<R>(reader: &mut R, limit: usize) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(limit as u64).read_line(&mut line).await?;

    if n == 0 {
        return Err(JobProxyError::InvalidRequest(
            "Connection closed before request".to_string(),
        ));
    }
    if !line.ends_with('\n') {
        return Err(JobProxyError::InvalidRequest(
            "Request line too long or truncated".to_string(),
        ));
    }

    Ok(line)
}

async fn reject<W>(client: &mut W, error: &JobProxyError)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_all_flush(client, error.to_client_response().as_bytes()).await {
        debug!("Failed to send error response: {}", e);
    }
}
