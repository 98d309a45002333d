//! Per-job proxy pool
//!
//! Owns the endpoint roster and issues each job its own started
//! [`ForwardingServer`], bound to a non-blocked endpoint and a free local port.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{JobProxyError, Result};
use crate::models::{parse_endpoints, PoolStats, ProxyEndpoint};
use crate::pool::blocklist::Blocklist;
use crate::pool::ports::PortAllocator;
use crate::proxy::events::FailureReporter;
use crate::proxy::handler::ForwarderConfig;
use crate::proxy::server::ForwardingServer;

/// Default time a blocked endpoint stays out of rotation
pub const DEFAULT_BLOCK_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub block_cooldown: Duration,
    /// Block an endpoint when one of the pool's servers fails to dial it
    ///
    /// On by default. A single failed dial, timeouts included, keeps the
    /// endpoint out of rotation for the whole `block_cooldown`, even when a
    /// fallback endpoint then serves the request. Set to `false` to block only
    /// through `PoolManager::mark_proxy_blocked`.
    pub block_on_failure: bool,
    pub forwarder: ForwarderConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_range_start: 9000,
            port_range_end: 9100,
            block_cooldown: DEFAULT_BLOCK_COOLDOWN,
            block_on_failure: true,
            forwarder: ForwarderConfig::default(),
        }
    }
}

/// Mutable pool state; selection, port allocation and blocking all go through
/// this one lock.
struct PoolState {
    cursor: usize,
    ports: PortAllocator,
    blocklist: Blocklist,
}

pub struct PoolManager {
    endpoints: Vec<Arc<ProxyEndpoint>>,
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl PoolManager {
    /// Build a pool with default settings and the given port range
    pub fn new<S: AsRef<str>>(urls: &[S], port_range_start: u16, port_range_end: u16) -> Result<Self> {
        Self::with_config(
            urls,
            PoolConfig {
                port_range_start,
                port_range_end,
                ..PoolConfig::default()
            },
        )
    }

    pub fn with_config<S: AsRef<str>>(urls: &[S], config: PoolConfig) -> Result<Self> {
        if config.port_range_start == 0 || config.port_range_start > config.port_range_end {
            return Err(JobProxyError::InvalidConfig(format!(
                "invalid port range {}-{}",
                config.port_range_start, config.port_range_end
            )));
        }

        let endpoints: Vec<Arc<ProxyEndpoint>> =
            parse_endpoints(urls)?.into_iter().map(Arc::new).collect();

        info!(
            proxies = endpoints.len(),
            port_range_start = config.port_range_start,
            port_range_end = config.port_range_end,
            "Proxy pool initialized"
        );

        let state = PoolState {
            cursor: 0,
            ports: PortAllocator::new(config.port_range_start, config.port_range_end),
            blocklist: Blocklist::new(config.block_cooldown),
        };

        Ok(Self {
            endpoints,
            config,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Start a forwarding server for `job_id` on the next eligible endpoint.
    ///
    /// The caller owns the returned server and is responsible for stopping it.
    #[instrument(skip(self))]
    pub async fn acquire_server_for_job(&self, job_id: &str) -> Result<ForwardingServer> {
        let (endpoint, port, listener) = {
            let mut state = self.state.lock();
            let endpoint = self.select_endpoint(&mut state)?;
            let (port, listener) = state.ports.allocate()?;
            (endpoint, port, listener)
        };

        let mut server = ForwardingServer::from_endpoint(endpoint.as_ref().clone(), port)
            .with_config(self.config.forwarder.clone());
        if self.config.block_on_failure {
            server = server.with_failure_reporter(Arc::new(PoolFailureReporter {
                state: Arc::downgrade(&self.state),
            }));
        }
        server.start_with_listener(listener)?;

        info!(endpoint = %endpoint, port, "Job assigned proxy");
        Ok(server)
    }

    /// Round-robin scan from the cursor, skipping blocked endpoints
    fn select_endpoint(&self, state: &mut PoolState) -> Result<Arc<ProxyEndpoint>> {
        let total = self.endpoints.len();

        for attempt in 0..total {
            let index = (state.cursor + attempt) % total;
            let endpoint = &self.endpoints[index];

            if state.blocklist.is_blocked(&endpoint.key()) {
                debug!(endpoint = %endpoint, "Proxy is blocked, skipping");
                continue;
            }

            state.cursor = (index + 1) % total;
            return Ok(endpoint.clone());
        }

        warn!(total, "No available proxies, all are blocked");
        Err(JobProxyError::AllProxiesBlocked { total })
    }

    /// Take `endpoint` out of rotation for the block cooldown
    pub fn mark_proxy_blocked(&self, endpoint: &ProxyEndpoint) {
        self.state.lock().blocklist.block(&endpoint.key());
        warn!(
            endpoint = %endpoint,
            cooldown_secs = self.config.block_cooldown.as_secs(),
            "Proxy marked as blocked"
        );
    }

    pub fn is_blocked(&self, endpoint: &ProxyEndpoint) -> bool {
        self.state.lock().blocklist.is_blocked(&endpoint.key())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let keys: HashSet<String> = self.endpoints.iter().map(|e| e.key()).collect();

        let blocked: Vec<_> = state
            .blocklist
            .snapshot()
            .into_iter()
            .filter(|entry| keys.contains(&entry.endpoint))
            .collect();
        let blocked_keys: HashSet<&str> = blocked.iter().map(|b| b.endpoint.as_str()).collect();
        let blocked_proxies = self
            .endpoints
            .iter()
            .filter(|e| blocked_keys.contains(e.key().as_str()))
            .count();

        let (start, end) = state.ports.range();
        PoolStats {
            total_proxies: self.endpoints.len(),
            blocked_proxies,
            available_proxies: self.endpoints.len() - blocked_proxies,
            port_range_start: start,
            port_range_end: end,
            port_range: format!("{}-{}", start, end),
            blocked,
        }
    }

    pub fn endpoints(&self) -> &[Arc<ProxyEndpoint>] {
        &self.endpoints
    }

    pub fn proxy_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// Blocks endpoints in the issuing pool when a server fails to reach them
struct PoolFailureReporter {
    state: Weak<Mutex<PoolState>>,
}

impl FailureReporter for PoolFailureReporter {
    fn report_failure(&self, endpoint: &ProxyEndpoint, error: &JobProxyError) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        state.lock().blocklist.block(&endpoint.key());
        warn!(endpoint = %endpoint, error = %error, "Proxy blocked after upstream failure");
    }
}
