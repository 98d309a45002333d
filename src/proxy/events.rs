//! Upstream failure reporting
//!
//! A forwarding server does not own block state; it reports failed dials to
//! whoever issued it.

use crate::error::JobProxyError;
use crate::models::ProxyEndpoint;

/// Receives upstream failures observed by a forwarding server
pub trait FailureReporter: Send + Sync {
    /// Called once per failed dial to `endpoint`
    fn report_failure(&self, endpoint: &ProxyEndpoint, error: &JobProxyError);
}
