// =============================================================================
// Client-order-id allocator
// =============================================================================
//
// Per-venue monotonic integer ids with wrap-around below a venue-specific
// limit. `next()` is the only mutator on the hot path and must stay O(1); a
// single mutex guarding a small map is plenty — contention is negligible
// since every submit path calls it at most once.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

struct CoiState {
    limit: u64,
    current: u64,
}

/// Per-venue client-order-id allocator.
pub struct CoiAllocator {
    venues: Mutex<HashMap<String, CoiState>>,
}

impl CoiAllocator {
    pub fn new() -> Self {
        Self {
            venues: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or update) the wraparound `limit` for `venue`. If the venue
    /// has not been seeded yet, seeds it from the current time.
    pub fn register_limit(&self, venue: &str, limit: u64) {
        let mut venues = self.venues.lock();
        let current = Self::time_seed(limit);
        venues
            .entry(venue.to_string())
            .and_modify(|s| s.limit = limit)
            .or_insert(CoiState { limit, current });
    }

    /// Explicitly seed the allocator's current counter for `venue`. Mostly
    /// useful in tests where a deterministic starting point is required.
    pub fn seed(&self, venue: &str, value: u64, limit: u64) {
        let mut venues = self.venues.lock();
        venues.insert(
            venue.to_string(),
            CoiState {
                limit,
                current: value,
            },
        );
    }

    fn time_seed(limit: u64) -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if limit == 0 {
            0
        } else {
            now_ms % limit
        }
    }

    /// Allocate the next client-order-id for `venue`, wrapping to `1` once
    /// `limit` is reached. Registers the venue with a `u32::MAX`-class
    /// default limit on first use if `register_limit` was never called.
    pub fn next(&self, venue: &str) -> u64 {
        let mut venues = self.venues.lock();
        let state = venues
            .entry(venue.to_string())
            .or_insert_with(|| CoiState {
                limit: u32::MAX as u64,
                current: Self::time_seed(u32::MAX as u64),
            });

        if state.current >= state.limit {
            state.current = 1;
        } else {
            state.current += 1;
        }
        state.current
    }
}

impl Default for CoiAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coi_allocator_wraps_at_limit() {
        let allocator = CoiAllocator::new();
        allocator.seed("V", 0, 3);
        let ids: Vec<u64> = (0..5).map(|_| allocator.next("V")).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn successive_ids_are_distinct_within_one_cycle() {
        let allocator = CoiAllocator::new();
        allocator.seed("V", 0, 1000);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = allocator.next("V");
            assert!(id >= 1 && id <= 1000);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn unregistered_venue_still_produces_ids() {
        let allocator = CoiAllocator::new();
        let first = allocator.next("unseen");
        let second = allocator.next("unseen");
        assert_ne!(first, second);
    }

    #[test]
    fn register_limit_updates_existing_state_without_resetting_current() {
        let allocator = CoiAllocator::new();
        allocator.seed("V", 5, 10);
        allocator.register_limit("V", 20);
        let next = allocator.next("V");
        assert_eq!(next, 6);
    }
}
