//! Time-boxed endpoint blocklist
//!
//! Entries expire after a fixed cooldown and are dropped lazily by the next
//! lookup that finds them expired.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::BlockedEndpoint;

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    blocked_at: Instant,
    blocked_at_wall: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Blocklist {
    cooldown: Duration,
    entries: HashMap<String, BlockEntry>,
}

impl Blocklist {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: HashMap::new(),
        }
    }

    /// Block `key` from now on, restarting the cooldown if already blocked
    pub fn block(&mut self, key: &str) {
        self.entries.insert(
            key.to_string(),
            BlockEntry {
                blocked_at: Instant::now(),
                blocked_at_wall: Utc::now(),
            },
        );
    }

    /// Whether `key` is blocked, removing the entry if its cooldown elapsed
    pub fn is_blocked(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };

        if entry.blocked_at.elapsed() >= self.cooldown {
            self.entries.remove(key);
            info!(endpoint = key, "Proxy unblocked after cooldown");
            return false;
        }

        true
    }

    /// Unexpired entries, sorted by endpoint key
    pub fn snapshot(&self) -> Vec<BlockedEndpoint> {
        let mut blocked: Vec<BlockedEndpoint> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let remaining = self.cooldown.checked_sub(entry.blocked_at.elapsed())?;
                if remaining.is_zero() {
                    return None;
                }
                Some(BlockedEndpoint {
                    endpoint: key.clone(),
                    blocked_at: entry.blocked_at_wall,
                    expires_in_secs: remaining.as_secs(),
                })
            })
            .collect();

        blocked.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        blocked
    }
}
