//! Local forwarding proxy server
//!
//! Presents `127.0.0.1:<port>` as an anonymous forward proxy that relays every
//! connection to one upstream endpoint, injecting its credentials and failing
//! over to a sibling endpoint when it cannot be reached.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{JobProxyError, Result};
use crate::models::{parse_endpoints, ProxyEndpoint};
use crate::proxy::events::FailureReporter;
use crate::proxy::handler::{ConnectionHandler, ForwarderConfig};
use crate::proxy::transport::{UpstreamDialer, UpstreamSet};

/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Forwarding proxy server bound to a local port
///
/// Dropping a running server ends its accept loop; in-flight connections
/// drain on their own either way.
pub struct ForwardingServer {
    upstream: Arc<UpstreamSet>,
    config: ForwarderConfig,
    reporter: Option<Arc<dyn FailureReporter>>,
    local_port: AtomicU16,
    running: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ForwardingServer {
    /// Create a server that forwards to a single endpoint
    pub fn from_endpoint(endpoint: ProxyEndpoint, local_port: u16) -> Self {
        Self::build(UpstreamSet::single(endpoint), local_port)
    }

    /// Create a server from a single proxy URL
    pub fn from_url(url: &str, local_port: u16) -> Result<Self> {
        let endpoint = ProxyEndpoint::parse(url)?;
        Ok(Self::from_endpoint(endpoint, local_port))
    }

    /// Create a server with several proxies for fallback.
    ///
    /// Invalid URLs are skipped; fails only if none parse.
    pub fn with_fallback<S: AsRef<str>>(urls: &[S], local_port: u16) -> Result<Self> {
        let endpoints = parse_endpoints(urls)?;
        info!("Configured {} proxies for fallback", endpoints.len());
        Ok(Self::build(UpstreamSet::new(endpoints)?, local_port))
    }

    fn build(upstream: UpstreamSet, local_port: u16) -> Self {
        Self {
            upstream: Arc::new(upstream),
            config: ForwarderConfig::default(),
            reporter: None,
            local_port: AtomicU16::new(local_port),
            running: Mutex::new(None),
        }
    }

    /// Override the default deadlines
    pub fn with_config(mut self, config: ForwarderConfig) -> Self {
        self.config = config;
        self
    }

    /// Report failed upstream dials to `reporter`
    pub fn with_failure_reporter(mut self, reporter: Arc<dyn FailureReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Bind `127.0.0.1:<port>` and start accepting connections.
    ///
    /// Port 0 binds an ephemeral port; `local_port()` reports the real one.
    #[instrument(skip(self), fields(port = self.local_port()))]
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(JobProxyError::AlreadyRunning {
                port: self.local_port(),
            });
        }

        let listener = TcpListener::bind(("127.0.0.1", self.local_port())).await?;
        self.serve(listener)
    }

    /// Start on a listener that was already bound (port reservation)
    pub(crate) fn start_with_listener(&self, listener: std::net::TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        self.serve(listener)
    }

    fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(JobProxyError::AlreadyRunning {
                port: self.local_port(),
            });
        }

        let port = listener.local_addr()?.port();
        self.local_port.store(port, Ordering::SeqCst);

        let dialer = UpstreamDialer::new(
            self.upstream.clone(),
            self.config.connect_timeout,
            self.reporter.clone(),
        );
        let handler = Arc::new(ConnectionHandler::new(dialer, self.config.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, handler, shutdown_rx));
        *running = Some(RunningServer { shutdown_tx, task });

        info!(
            "Proxy server started on 127.0.0.1:{} (forwarding to {})",
            port,
            self.upstream.current()
        );
        if self.upstream.len() > 1 {
            info!("Fallback enabled with {} proxies", self.upstream.len());
        }

        Ok(())
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    ///
    /// In-flight tunnels are not interrupted. Calling this more than once is a
    /// no-op.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        info!(port = self.local_port(), "Proxy server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Local proxy URL to hand to HTTP clients
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_port())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    /// The endpoint new connections are currently sent to
    pub fn current_proxy(&self) -> Arc<ProxyEndpoint> {
        self.upstream.current()
    }

    /// Total number of configured proxies
    pub fn proxy_count(&self) -> usize {
        self.upstream.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => spawn_connection(stream, peer, handler.clone()),
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        error!("Proxy accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender means the server itself is gone.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, handler: Arc<ConnectionHandler>) {
    let span = info_span!("conn", id = %Uuid::new_v4(), peer = %peer);

    tokio::spawn(
        async move {
            if let Err(e) = handler.handle(stream).await {
                debug!("Connection error: {}", e);
            }
        }
        .instrument(span),
    );
}
