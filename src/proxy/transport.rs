//! Upstream transport layer
//!
//! Holds the ordered upstream endpoints of a forwarding server, dials them with
//! sticky fallback, and speaks the CONNECT handshake to the chosen upstream.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{JobProxyError, Result};
use crate::models::{format_tcp_addr, ProxyEndpoint};
use crate::proxy::events::FailureReporter;

/// Upper bound for an upstream CONNECT response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Ordered upstream endpoints plus the index currently in use
///
/// Reads (serving any connection) take the read lock; the only write is a
/// successful fallback switch.
pub struct UpstreamSet {
    endpoints: Vec<Arc<ProxyEndpoint>>,
    current: RwLock<usize>,
}

impl UpstreamSet {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(JobProxyError::NoValidProxies);
        }
        Ok(Self {
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            current: RwLock::new(0),
        })
    }

    pub fn single(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoints: vec![Arc::new(endpoint)],
            current: RwLock::new(0),
        }
    }

    /// The endpoint new connections are sent to
    pub fn current(&self) -> Arc<ProxyEndpoint> {
        let index = *self.current.read();
        self.endpoints[index].clone()
    }

    pub fn current_index(&self) -> usize {
        *self.current.read()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn snapshot(&self) -> (usize, Arc<ProxyEndpoint>) {
        let index = *self.current.read();
        (index, self.endpoints[index].clone())
    }

    /// Make `index` the current endpoint, returning the previous one
    fn switch_to(&self, index: usize) -> Arc<ProxyEndpoint> {
        let mut current = self.current.write();
        let previous = self.endpoints[*current].clone();
        *current = index;
        previous
    }
}

/// Dials the current upstream, falling back to its siblings on failure
#[derive(Clone)]
pub struct UpstreamDialer {
    upstream: Arc<UpstreamSet>,
    connect_timeout: Duration,
    reporter: Option<Arc<dyn FailureReporter>>,
}

impl UpstreamDialer {
    pub fn new(
        upstream: Arc<UpstreamSet>,
        connect_timeout: Duration,
        reporter: Option<Arc<dyn FailureReporter>>,
    ) -> Self {
        Self {
            upstream,
            connect_timeout,
            reporter,
        }
    }

    /// Connect to the current endpoint, or the first reachable sibling.
    ///
    /// Returns the stream together with the endpoint that was actually dialed.
    pub async fn dial(&self) -> Result<(TcpStream, Arc<ProxyEndpoint>)> {
        let (index, endpoint) = self.upstream.snapshot();

        match self.dial_endpoint(&endpoint).await {
            Ok(stream) => Ok((stream, endpoint)),
            Err(e) => {
                warn!(endpoint = %endpoint, "Failed to connect to proxy: {}", e);
                self.report(&endpoint, &e);
                self.fallback(index).await
            }
        }
    }

    /// Try every other endpoint in order starting after `failed_index`.
    ///
    /// The first one that accepts a TCP connection becomes current for all
    /// future connections on this server.
    #[instrument(skip(self))]
    async fn fallback(&self, failed_index: usize) -> Result<(TcpStream, Arc<ProxyEndpoint>)> {
        let count = self.upstream.len();

        for offset in 1..count {
            let index = (failed_index + offset) % count;
            let endpoint = self.upstream.endpoints[index].clone();

            match self.dial_endpoint(&endpoint).await {
                Ok(stream) => {
                    let previous = self.upstream.switch_to(index);
                    info!(
                        "Switched to fallback proxy {}: {} (was {})",
                        index + 1,
                        endpoint,
                        previous
                    );
                    return Ok((stream, endpoint));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, "Fallback proxy failed: {}", e);
                    self.report(&endpoint, &e);
                }
            }
        }

        Err(JobProxyError::AllProxiesFailed { attempts: count })
    }

    async fn dial_endpoint(&self, endpoint: &ProxyEndpoint) -> Result<TcpStream> {
        let addr = endpoint.dial_addr();
        debug!("Connecting to proxy at {}", addr);

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(JobProxyError::ProxyConnectionFailed(format!(
                "TCP connect to {} failed: {}",
                addr, e
            ))),
            Err(_) => Err(JobProxyError::ProxyConnectionFailed(format!(
                "TCP connect to {} timed out after {}s",
                addr,
                self.connect_timeout.as_secs_f64()
            ))),
        }
    }

    fn report(&self, endpoint: &ProxyEndpoint, error: &JobProxyError) {
        if let Some(reporter) = &self.reporter {
            reporter.report_failure(endpoint, error);
        }
    }
}

/// Build the CONNECT request sent to an upstream proxy
pub fn build_connect_request(endpoint: &ProxyEndpoint, authority: &str) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(auth) = endpoint.basic_auth() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }

    request.push_str("Proxy-Connection: keep-alive\r\n\r\n");
    request
}

/// Send CONNECT to the upstream and return its raw response head
pub async fn open_tunnel(
    stream: &mut TcpStream,
    endpoint: &ProxyEndpoint,
    authority: &str,
    request_timeout: Duration,
) -> Result<BytesMut> {
    timeout(request_timeout, connect_handshake(stream, endpoint, authority))
        .await
        .map_err(|_| JobProxyError::Timeout)?
        .map_err(|e| JobProxyError::ConnectFailed(format!("{} via {}: {}", authority, endpoint, e)))
}

async fn connect_handshake(
    stream: &mut TcpStream,
    endpoint: &ProxyEndpoint,
    authority: &str,
) -> std::result::Result<BytesMut, anyhow::Error> {
    let request = build_connect_request(endpoint, authority);
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(stream).await?;
    if head.is_empty() {
        anyhow::bail!("empty CONNECT response");
    }
    Ok(head)
}

/// Read from `reader` until the end of an HTTP response head.
///
/// Everything read is returned untouched so it can be relayed verbatim. A
/// stream that ends early yields whatever arrived.
pub async fn read_response_head<R>(reader: &mut R) -> std::io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut head = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(head);
        }
        head.extend_from_slice(&chunk[..n]);

        if find_head_end(&head).is_some() {
            return Ok(head);
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Status code from the first line of a response head
pub fn parse_status_code(head: &[u8]) -> Option<u16> {
    let line_end = head.iter().position(|b| *b == b'\n').unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Parse host and port from authority (for CONNECT requests)
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(JobProxyError::InvalidRequest("Empty CONNECT target".to_string()));
    }

    // Bracketed IPv6, e.g. "[::1]:443"
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| JobProxyError::InvalidRequest("Unclosed IPv6 bracket".to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(port_str) => parse_port(port_str)?,
            None if tail.is_empty() => 443,
            None => {
                return Err(JobProxyError::InvalidRequest(format!(
                    "Invalid authority: {}",
                    authority
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if host.is_empty() || host.contains(':') {
            return Err(JobProxyError::InvalidRequest(format!(
                "Invalid authority: {}",
                authority
            )));
        }
        Ok((host.to_string(), parse_port(port_str)?))
    } else {
        // Default to port 443 for CONNECT (typically HTTPS)
        Ok((authority.to_string(), 443))
    }
}

/// Normalized `host:port` form of a CONNECT target
pub fn normalize_authority(authority: &str) -> Result<String> {
    let (host, port) = parse_authority(authority)?;
    Ok(format_tcp_addr(&host, port))
}

fn parse_port(port_str: &str) -> Result<u16> {
    port_str
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| JobProxyError::InvalidRequest("Invalid port".to_string()))
}

/// Write `bytes` to a writer and flush
pub async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;

    #[derive(Default)]
    struct CountingReporter {
        failures: parking_lot::Mutex<Vec<String>>,
    }

    impl FailureReporter for CountingReporter {
        fn report_failure(&self, endpoint: &ProxyEndpoint, _error: &JobProxyError) {
            self.failures.lock().push(endpoint.key());
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn accepting_listener() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (port, accepted)
    }

    #[test]
    fn test_upstream_set_rejects_empty() {
        assert!(matches!(
            UpstreamSet::new(Vec::new()),
            Err(JobProxyError::NoValidProxies)
        ));
    }

    #[test]
    fn test_build_connect_request_with_credentials() {
        let endpoint = ProxyEndpoint::new("h1", 100, "u1", "p1");
        let request = build_connect_request(&endpoint, "example.com:443");
        assert_eq!(
            request,
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\
             Proxy-Authorization: Basic dTE6cDE=\r\nProxy-Connection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn test_build_connect_request_anonymous() {
        let endpoint = ProxyEndpoint::new("h1", 100, "", "");
        let request = build_connect_request(&endpoint, "example.com:443");
        assert!(!request.contains("Proxy-Authorization"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:443").unwrap(),
            ("::1".to_string(), 443)
        );
        assert!(parse_authority("").is_err());
        assert!(parse_authority("example.com:http").is_err());
        assert!(parse_authority(":443").is_err());
        assert_eq!(normalize_authority("[::1]:8443").unwrap(), "[::1]:8443");
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(
            parse_status_code(b"HTTP/1.1 200 Connection established\r\n\r\n"),
            Some(200)
        );
        assert_eq!(parse_status_code(b"HTTP/1.0 407 Auth Required\r\n"), Some(407));
        assert_eq!(parse_status_code(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_read_response_head_stops_at_blank_line() {
        let (mut upstream, mut reader) = tokio::io::duplex(1024);
        upstream
            .write_all(b"HTTP/1.1 200 OK\r\nX-Test: 1\r\n\r\n")
            .await
            .unwrap();

        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(&head[..], b"HTTP/1.1 200 OK\r\nX-Test: 1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_response_head_returns_partial_on_eof() {
        let (mut upstream, mut reader) = tokio::io::duplex(1024);
        upstream.write_all(b"HTTP/1.1 502 Bad").await.unwrap();
        drop(upstream);

        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(&head[..], b"HTTP/1.1 502 Bad");
    }

    #[tokio::test]
    async fn test_dial_uses_current_endpoint() {
        let (port, accepted) = accepting_listener().await;
        let upstream = Arc::new(
            UpstreamSet::new(vec![ProxyEndpoint::new("127.0.0.1", port, "u", "p")]).unwrap(),
        );
        let dialer = UpstreamDialer::new(upstream.clone(), Duration::from_secs(2), None);

        let (_stream, endpoint) = dialer.dial().await.unwrap();
        assert_eq!(endpoint.port, port);
        assert_eq!(upstream.current_index(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_falls_back_and_sticks() {
        let dead = closed_port().await;
        let (live, _accepted) = accepting_listener().await;
        let upstream = Arc::new(
            UpstreamSet::new(vec![
                ProxyEndpoint::new("127.0.0.1", dead, "u1", "p1"),
                ProxyEndpoint::new("127.0.0.1", live, "u2", "p2"),
            ])
            .unwrap(),
        );
        let reporter = Arc::new(CountingReporter::default());
        let dialer = UpstreamDialer::new(
            upstream.clone(),
            Duration::from_secs(2),
            Some(reporter.clone() as Arc<dyn FailureReporter>),
        );

        let (_first, endpoint) = dialer.dial().await.unwrap();
        assert_eq!(endpoint.port, live);
        assert_eq!(endpoint.username, "u2");
        assert_eq!(upstream.current_index(), 1);

        let (_second, endpoint) = dialer.dial().await.unwrap();
        assert_eq!(endpoint.port, live);

        // The dead endpoint was dialed exactly once.
        assert_eq!(
            reporter.failures.lock().clone(),
            vec![format!("127.0.0.1:{}", dead)]
        );
    }

    #[tokio::test]
    async fn test_dial_all_endpoints_fail() {
        let first = closed_port().await;
        let second = closed_port().await;
        let upstream = Arc::new(
            UpstreamSet::new(vec![
                ProxyEndpoint::new("127.0.0.1", first, "", ""),
                ProxyEndpoint::new("127.0.0.1", second, "", ""),
            ])
            .unwrap(),
        );
        let dialer = UpstreamDialer::new(upstream.clone(), Duration::from_secs(2), None);

        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, JobProxyError::AllProxiesFailed { attempts: 2 }));
        assert_eq!(upstream.current_index(), 0);
    }
}
