// =============================================================================
// Nonce manager
// =============================================================================
//
// Per-API-key sequence tracking for venues whose signing protocol carries an
// explicit nonce (the nonce-flavored venue, §4.F). `refresh` hard-refetches
// the next valid nonce from the venue and is idempotent and cheap to retry;
// `is_nonce_error` pattern-matches the small set of known nonce-rejection
// signatures so callers can decide to refresh-and-retry-once.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::info;

/// A callback that fetches the next valid nonce for `api_key_index` from the
/// venue. Supplied by the concrete connector at construction time since only
/// it knows how to ask the venue.
pub type NonceFetcher = dyn Fn(u32) -> u64 + Send + Sync;

pub struct NonceManager {
    nonces: Mutex<HashMap<u32, u64>>,
    fetcher: Box<NonceFetcher>,
}

impl NonceManager {
    pub fn new(fetcher: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        Self {
            nonces: Mutex::new(HashMap::new()),
            fetcher: Box::new(fetcher),
        }
    }

    /// Current nonce for `api_key_index`, allocating and incrementing it.
    /// Returns `None` if the key has never been seeded (caller should
    /// `refresh` first).
    pub fn next(&self, api_key_index: u32) -> Option<u64> {
        let mut nonces = self.nonces.lock();
        let entry = nonces.get_mut(&api_key_index)?;
        let value = *entry;
        *entry += 1;
        Some(value)
    }

    /// Snapshot the current nonce for logging, without mutating it.
    pub fn snapshot(&self, api_key_index: u32) -> Option<u64> {
        self.nonces.lock().get(&api_key_index).copied()
    }

    /// Hard-refresh the nonce for `api_key_index` from the venue. Blocking
    /// from the caller's perspective but cheap; safe to call repeatedly.
    pub fn refresh(&self, api_key_index: u32) {
        let fresh = (self.fetcher)(api_key_index);
        let mut nonces = self.nonces.lock();
        nonces.insert(api_key_index, fresh);
        info!(api_key_index, nonce = fresh, "nonce hard-refreshed");
    }

    /// Pattern-match a rejection payload against the known nonce-error
    /// taxonomy: specific venue error codes, or substrings of a free-form
    /// reason string.
    pub fn is_nonce_error(info: &serde_json::Value, reason: &str) -> bool {
        const NONCE_CODES: &[&str] = &["21104", "100001"];

        let code_matches = info
            .get("code")
            .map(|c| {
                let code_str = match c {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    _ => return false,
                };
                NONCE_CODES.contains(&code_str.as_str())
            })
            .unwrap_or(false);

        let reason_lower = reason.to_lowercase();
        let reason_matches = reason_lower.contains("invalid nonce")
            || reason_lower.contains("nonce")
                && (reason_lower.contains("out of sync") || reason_lower.contains("out-of-sync"));

        code_matches || reason_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn refresh_seeds_and_next_increments() {
        let counter = Arc::new(AtomicU64::new(100));
        let counter2 = counter.clone();
        let manager = NonceManager::new(move |_key| counter2.fetch_add(1, Ordering::SeqCst));

        manager.refresh(0);
        let first = manager.next(0).unwrap();
        let second = manager.next(0).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn next_without_refresh_returns_none() {
        let manager = NonceManager::new(|_key| 0);
        assert_eq!(manager.next(5), None);
    }

    #[test]
    fn is_nonce_error_matches_known_codes() {
        let info = serde_json::json!({ "code": "21104" });
        assert!(NonceManager::is_nonce_error(&info, ""));

        let info2 = serde_json::json!({ "code": 100001 });
        assert!(NonceManager::is_nonce_error(&info2, ""));
    }

    #[test]
    fn is_nonce_error_matches_known_substrings() {
        assert!(NonceManager::is_nonce_error(&serde_json::json!({}), "Invalid nonce supplied"));
        assert!(NonceManager::is_nonce_error(
            &serde_json::json!({}),
            "nonce is out of sync with server"
        ));
    }

    #[test]
    fn is_nonce_error_false_for_unrelated_errors() {
        assert!(!NonceManager::is_nonce_error(
            &serde_json::json!({ "code": "400" }),
            "insufficient balance"
        ));
    }

    #[test]
    fn snapshot_does_not_mutate_state() {
        let manager = NonceManager::new(|_key| 5);
        manager.refresh(1);
        let a = manager.snapshot(1);
        let b = manager.snapshot(1);
        assert_eq!(a, b);
    }
}
