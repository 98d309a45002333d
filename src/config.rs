use crate::error::{JobProxyError, Result};
use crate::pool::PoolConfig;
use crate::proxy::ForwarderConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream proxies and run mode
    pub proxy: ProxyConfig,
    /// Pool port range and blocking
    pub pool: PoolSettings,
    /// Connection deadlines
    pub timeouts: TimeoutConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One forwarding server with fallback across every endpoint
    Single,
    /// One forwarding server per job, issued by the pool
    Pool,
}

impl FromStr for RunMode {
    type Err = JobProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "pool" => Ok(Self::Pool),
            other => Err(JobProxyError::InvalidConfig(format!(
                "PROXY_MODE must be 'single' or 'pool', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream proxy URLs (comma-separated in PROXY_URLS)
    pub urls: Vec<String>,
    pub mode: RunMode,
    /// Local port in single mode (default: 8899)
    pub local_port: u16,
    /// Job servers to acquire in pool mode; 0 means one per endpoint
    pub jobs: usize,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Block cooldown in seconds
    pub block_cooldown: u64,
    pub block_on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Upstream dial deadline in seconds
    pub connect: u64,
    /// Request/response head deadline in seconds
    pub request: u64,
    /// Tunnel idle deadline in seconds
    pub idle: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            proxy: ProxyConfig {
                urls: get_env_or("PROXY_URLS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                mode: get_env_or("PROXY_MODE", "pool").parse()?,
                local_port: parse_env("PROXY_LOCAL_PORT", "8899", "a valid port number")?,
                jobs: parse_env("PROXY_JOBS", "0", "a valid number")?,
            },
            pool: PoolSettings {
                port_range_start: parse_env("PROXY_PORT_RANGE_START", "9000", "a valid port number")?,
                port_range_end: parse_env("PROXY_PORT_RANGE_END", "9100", "a valid port number")?,
                block_cooldown: parse_env("PROXY_BLOCK_COOLDOWN", "300", "a number of seconds")?,
                block_on_failure: parse_env("PROXY_BLOCK_ON_FAILURE", "true", "true or false")?,
            },
            timeouts: TimeoutConfig {
                connect: parse_env("PROXY_CONNECT_TIMEOUT", "10", "a number of seconds")?,
                request: parse_env("PROXY_REQUEST_TIMEOUT", "30", "a number of seconds")?,
                idle: parse_env("PROXY_IDLE_TIMEOUT", "300", "a number of seconds")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let (start, end) = (self.pool.port_range_start, self.pool.port_range_end);
        if start == 0 || start > end {
            return Err(JobProxyError::InvalidConfig(format!(
                "PROXY_PORT_RANGE_START..PROXY_PORT_RANGE_END must be a non-empty range, got {}-{}",
                start, end
            )));
        }
        if !matches!(self.log.format.as_str(), "json" | "pretty") {
            return Err(JobProxyError::InvalidConfig(
                "LOG_FORMAT must be 'json' or 'pretty'".into(),
            ));
        }
        Ok(())
    }

    /// Upstream URLs, failing when none are configured
    pub fn require_urls(&self) -> Result<&[String]> {
        if self.proxy.urls.is_empty() {
            return Err(JobProxyError::MissingEnvVar("PROXY_URLS".into()));
        }
        Ok(&self.proxy.urls)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            connect_timeout: Duration::from_secs(self.timeouts.connect),
            request_timeout: Duration::from_secs(self.timeouts.request),
            idle_timeout: Duration::from_secs(self.timeouts.idle),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            port_range_start: self.pool.port_range_start,
            port_range_end: self.pool.port_range_end,
            block_cooldown: Duration::from_secs(self.pool.block_cooldown),
            block_on_failure: self.pool.block_on_failure,
            forwarder: self.forwarder_config(),
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str, expected: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| JobProxyError::InvalidConfig(format!("{} must be {}", key, expected)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_URLS",
        "PROXY_MODE",
        "PROXY_LOCAL_PORT",
        "PROXY_JOBS",
        "PROXY_PORT_RANGE_START",
        "PROXY_PORT_RANGE_END",
        "PROXY_CONNECT_TIMEOUT",
        "PROXY_REQUEST_TIMEOUT",
        "PROXY_IDLE_TIMEOUT",
        "PROXY_BLOCK_COOLDOWN",
        "PROXY_BLOCK_ON_FAILURE",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert!(config.proxy.urls.is_empty());
        assert_eq!(config.proxy.mode, RunMode::Pool);
        assert_eq!(config.proxy.local_port, 8899);
        assert_eq!(config.proxy.jobs, 0);
        assert_eq!(config.pool.port_range_start, 9000);
        assert_eq!(config.pool.port_range_end, 9100);
        assert_eq!(config.pool.block_cooldown, 300);
        assert!(config.pool.block_on_failure);
        assert_eq!(config.log.format, "json");

        assert!(matches!(
            config.require_urls(),
            Err(JobProxyError::MissingEnvVar(_))
        ));

        let forwarder = config.forwarder_config();
        assert_eq!(forwarder.connect_timeout, Duration::from_secs(10));
        assert_eq!(forwarder.request_timeout, Duration::from_secs(30));
        assert_eq!(forwarder.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_URLS", "http://u1:p1@h1:100, http://u2:p2@h2:200,");
        env::set_var("PROXY_MODE", "single");
        env::set_var("PROXY_LOCAL_PORT", "18899");
        env::set_var("PROXY_PORT_RANGE_START", "9000");
        env::set_var("PROXY_PORT_RANGE_END", "9010");
        env::set_var("PROXY_BLOCK_COOLDOWN", "60");
        env::set_var("PROXY_BLOCK_ON_FAILURE", "false");
        env::set_var("PROXY_CONNECT_TIMEOUT", "3");
        env::set_var("LOG_FORMAT", "pretty");

        let config = Config::from_env().unwrap();

        assert_eq!(
            config.require_urls().unwrap(),
            ["http://u1:p1@h1:100", "http://u2:p2@h2:200"]
        );
        assert_eq!(config.proxy.mode, RunMode::Single);
        assert_eq!(config.proxy.local_port, 18899);

        let pool = config.pool_config();
        assert_eq!((pool.port_range_start, pool.port_range_end), (9000, 9010));
        assert_eq!(pool.block_cooldown, Duration::from_secs(60));
        assert!(!pool.block_on_failure);
        assert_eq!(pool.forwarder.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_config_from_env_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();

        for (key, value) in [
            ("PROXY_LOCAL_PORT", "not-a-port"),
            ("PROXY_MODE", "cluster"),
            ("PROXY_PORT_RANGE_START", "0"),
            ("PROXY_PORT_RANGE_START", "9200"),
            ("PROXY_BLOCK_ON_FAILURE", "maybe"),
            ("PROXY_IDLE_TIMEOUT", "-1"),
            ("LOG_FORMAT", "xml"),
        ] {
            let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
            env::set_var(key, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, JobProxyError::InvalidConfig(_)),
                "{}={} gave {:?}",
                key,
                value,
                err
            );
        }
    }
}
