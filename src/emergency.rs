// =============================================================================
// Emergency unwind — reduce every venue's position to zero (§4.K)
// =============================================================================
//
// Per-venue failures are logged and recorded as `false`; one venue failing
// to flatten never stops the sweep across the rest. An optional notifier
// callback receives the full per-venue result map once the sweep completes.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::router::ExecutionRouter;

/// Reduce-only-unwind every registered venue's position in `canonical_symbol`
/// toward zero, within `tolerance`, using up to 3 attempts per venue.
pub async fn emergency_unwind(
    router: &ExecutionRouter,
    canonical_symbol: &str,
    tolerance: f64,
    venues: Option<&[String]>,
) -> HashMap<String, bool> {
    let target_venues: Vec<String> = match venues {
        Some(v) => v.to_vec(),
        None => router.venues(),
    };

    let mut results = HashMap::new();
    for venue in target_venues {
        let success = router
            .flatten(&venue, canonical_symbol, tolerance, 3, Duration::from_millis(500))
            .await;
        info!(venue = %venue, symbol = canonical_symbol, success, "emergency unwind");
        results.insert(venue, success);
    }
    results
}

/// Run `emergency_unwind` and hand the result map to `notify`. A panicking
/// or failing notifier is logged and swallowed — it must never mask the
/// unwind result itself.
pub async fn emergency_unwind_and_notify<F, Fut>(
    router: &ExecutionRouter,
    canonical_symbol: &str,
    tolerance: f64,
    venues: Option<&[String]>,
    notify: F,
) -> HashMap<String, bool>
where
    F: FnOnce(HashMap<String, bool>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let results = emergency_unwind(router, canonical_symbol, tolerance, venues).await;
    notify(results.clone()).await;
    results
}

/// Default warning-log notifier matching the reference implementation's
/// behaviour when no dashboard/alerting hook is wired up.
pub fn log_emergency_results(results: &HashMap<String, bool>) {
    let summary: Vec<String> = results
        .iter()
        .map(|(venue, ok)| format!("{venue}:{}", if *ok { "ok" } else { "fail" }))
        .collect();
    warn!(results = %summary.join(", "), "emergency unwind results");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_emergency_results_does_not_panic_on_empty_map() {
        log_emergency_results(&HashMap::new());
    }
}
