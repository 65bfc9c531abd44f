use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// How long an unreachable upstream stays suppressed after its last failure.
const BLOCK_DURATION: Duration = Duration::from_secs(30);

/// Time-bounded set of upstream hosts that recently refused a connection.
///
/// The proxy finder consults this to skip candidates that are known to be
/// down, so a dead corporate proxy does not add a dial timeout to every
/// request. Entries expire on their own; the network monitor clears the
/// whole set early when the host configuration changes.
pub struct Blocklist {
    entries: Mutex<HashMap<String, Instant>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Blocklist {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `host` unreachable until `now + BLOCK_DURATION`, extending the
    /// expiry if the host is already blocked.
    pub fn block(&self, host: &str) {
        let expiry = Instant::now() + BLOCK_DURATION;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(host.to_string()).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
        debug!("blocked upstream {host} for {BLOCK_DURATION:?}");
    }

    /// Returns true if `host` has an unexpired entry. Expired entries are
    /// pruned here so readers never observe them.
    pub fn is_blocked(&self, host: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(host) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                entries.remove(host);
                false
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if !entries.is_empty() {
            debug!("clearing {} blocked upstream(s)", entries.len());
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_host_reports_blocked() {
        let blocklist = Blocklist::new();
        assert!(!blocklist.is_blocked("proxy.example.com"));
        blocklist.block("proxy.example.com");
        assert!(blocklist.is_blocked("proxy.example.com"));
        assert!(!blocklist.is_blocked("other.example.com"));
    }

    #[test]
    fn test_expired_entry_is_pruned() {
        let blocklist = Blocklist::new();
        blocklist
            .entries
            .lock()
            .unwrap()
            .insert("stale.example.com".to_string(), Instant::now());
        assert!(!blocklist.is_blocked("stale.example.com"));
        assert!(blocklist.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_unblocks_everything() {
        let blocklist = Blocklist::new();
        blocklist.block("a.example.com");
        blocklist.block("b.example.com");
        blocklist.clear();
        assert!(!blocklist.is_blocked("a.example.com"));
        assert!(!blocklist.is_blocked("b.example.com"));
    }

    #[test]
    fn test_block_extends_expiry() {
        let blocklist = Blocklist::new();
        let early = Instant::now() + Duration::from_secs(1);
        blocklist
            .entries
            .lock()
            .unwrap()
            .insert("proxy.example.com".to_string(), early);
        blocklist.block("proxy.example.com");
        let expiry = *blocklist
            .entries
            .lock()
            .unwrap()
            .get("proxy.example.com")
            .unwrap();
        assert!(expiry > early);
    }
}
