use http::StatusCode;
use thiserror::Error;

/// Unified error type for jobproxy
#[derive(Error, Debug)]
pub enum JobProxyError {
    // Configuration errors
    #[error("Invalid proxy URL '{url}': {reason}")]
    InvalidProxyUrl { url: String, reason: String },

    #[error("No valid proxy URLs provided")]
    NoValidProxies,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Pool errors
    #[error("No available proxies (all {total} blocked)")]
    AllProxiesBlocked { total: usize },

    #[error("No available ports in range {start}-{end}")]
    NoAvailablePorts { start: u16, end: u16 },

    // Upstream errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("All {attempts} proxies failed")]
    AllProxiesFailed { attempts: usize },

    #[error("CONNECT failed: {0}")]
    ConnectFailed(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // Lifecycle errors
    #[error("Proxy server already running on port {port}")]
    AlreadyRunning { port: u16 },

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for jobproxy operations
pub type Result<T> = std::result::Result<T, JobProxyError>;

impl JobProxyError {
    /// Get the HTTP status code reported to a proxy client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            JobProxyError::InvalidRequest(_)
            | JobProxyError::InvalidProxyUrl { .. }
            | JobProxyError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            JobProxyError::ProxyConnectionFailed(_) | JobProxyError::ConnectFailed(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            JobProxyError::NoValidProxies
            | JobProxyError::AllProxiesBlocked { .. }
            | JobProxyError::NoAvailablePorts { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            JobProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            JobProxyError::AllProxiesFailed { .. }
            | JobProxyError::MissingEnvVar(_)
            | JobProxyError::AlreadyRunning { .. }
            | JobProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reason phrase for the status line sent to a proxy client
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            JobProxyError::AllProxiesFailed { .. } => "All proxies failed",
            other => other
                .status_code()
                .canonical_reason()
                .unwrap_or("Proxy Error"),
        }
    }

    /// Render a minimal HTTP/1.1 response for a client that cannot be served
    pub fn to_client_response(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            self.status_code().as_u16(),
            self.reason_phrase()
        )
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}
