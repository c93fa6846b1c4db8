// =============================================================================
// Diagnostic harness (§4.M) — fire test orders, observe timelines, report
// =============================================================================
//
// Not owned by a single original-source file: it is assembled from the
// reconciliation helpers it reports on (`Order::timeline_summary`,
// `Order::detect_race_conditions`) plus the JSON report schema. Every task
// submits a small order through the router, waits for a terminal state
// bounded by a harness-level timeout, and folds the observed timeline into
// the report regardless of outcome.
// =============================================================================

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

use crate::order::{Order, TimelineSummary};
use crate::router::ExecutionRouter;
use crate::tracking_limit::TrackingLimitParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSide {
    Buy,
    Sell,
}

impl TestSide {
    fn is_ask(self) -> bool {
        matches!(self, TestSide::Sell)
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticTask {
    pub venue: String,
    pub symbol: String,
    pub mode: TestMode,
    pub side: TestSide,
    pub size_i: i64,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderReportEntry {
    pub id: String,
    pub state: String,
    pub side: String,
    pub timeline_summary: TimelineSummary,
    pub race_conditions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceStats {
    pub avg_spread_bps: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub venue: String,
    pub symbol: String,
    pub mode: String,
    pub side: String,
    pub success: bool,
    pub attempts: u32,
    pub duration_secs: f64,
    pub events: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub orders: Vec<OrderReportEntry>,
    pub price_stats: PriceStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub test_run_time: u64,
    pub total_tasks: u32,
    pub successful_tasks: u32,
    pub failed_tasks: u32,
    pub reports: Vec<TaskReport>,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn spread_bps(bid: Option<i64>, ask: Option<i64>, scale: i64) -> Option<f64> {
    let (bid, ask) = (bid?, ask?);
    if bid <= 0 || scale <= 0 {
        return None;
    }
    let mid = (bid + ask) as f64 / 2.0;
    if mid <= 0.0 {
        return None;
    }
    Some(((ask - bid) as f64 / mid) * 10_000.0)
}

/// Run every task in `tasks` against `router`, collecting a full report. No
/// task failure aborts the sweep; it is recorded and counted.
pub async fn run_diagnostics(router: &ExecutionRouter, tasks: &[DiagnosticTask]) -> DiagnosticReport {
    let mut reports = Vec::with_capacity(tasks.len());
    let mut successful = 0u32;

    for task in tasks {
        let report = run_single_task(router, task).await;
        if report.success {
            successful += 1;
        }
        reports.push(report);
    }

    let total = reports.len() as u32;
    DiagnosticReport {
        test_run_time: unix_now(),
        total_tasks: total,
        successful_tasks: successful,
        failed_tasks: total - successful,
        reports,
    }
}

async fn run_single_task(router: &ExecutionRouter, task: &DiagnosticTask) -> TaskReport {
    let started = Instant::now();
    let mut events = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut orders = Vec::new();

    let mut spread_samples = Vec::new();
    if let Some(top) = router.top_of_book(&task.venue, &task.symbol).await {
        if let Some(bps) = spread_bps(top.bid_i, top.ask_i, top.scale) {
            spread_samples.push(bps);
        }
    }

    let is_ask = task.side.is_ask();
    let mode_str = match task.mode {
        TestMode::Market => "market",
        TestMode::Limit => "limit",
    };
    let side_str = if is_ask { "sell" } else { "buy" };

    let result = match task.mode {
        TestMode::Market => router.market_order(&task.venue, &task.symbol, task.size_i, is_ask, false, None).await,
        TestMode::Limit => {
            let mut params = TrackingLimitParams::default();
            params.timeout_secs = task.timeout.as_secs_f64();
            router.limit_order(&task.venue, &task.symbol, task.size_i, is_ask, params).await
        }
    };

    let (success, order, race_conditions): (bool, Option<Order>, Vec<String>) = match result {
        Ok(order) => {
            events.push(format!("submitted coi={}", order.client_order_id()));
            let final_event = tokio::time::timeout(task.timeout, order.wait_final(Some(task.timeout)))
                .await
                .ok()
                .flatten();
            if let Some(ev) = &final_event {
                events.push(format!("final state={:?}", ev.state));
            } else {
                warnings.push("order did not reach a terminal state before the harness timeout".to_string());
            }

            let races = order.detect_race_conditions();
            if !races.is_empty() {
                warnings.extend(races.iter().cloned());
            }

            let reached_filled = order.state() == crate::order::OrderState::Filled;
            let success = reached_filled && races.is_empty();
            (success, Some(order), races)
        }
        Err(e) => {
            errors.push(e.to_string());
            (false, None, Vec::new())
        }
    };

    if let Some(top) = router.top_of_book(&task.venue, &task.symbol).await {
        if let Some(bps) = spread_bps(top.bid_i, top.ask_i, top.scale) {
            spread_samples.push(bps);
        }
    }
    let price_stats = if spread_samples.is_empty() {
        PriceStats { avg_spread_bps: 0.0, min: 0.0, max: 0.0 }
    } else {
        let sum: f64 = spread_samples.iter().sum();
        PriceStats {
            avg_spread_bps: sum / spread_samples.len() as f64,
            min: spread_samples.iter().cloned().fold(f64::INFINITY, f64::min),
            max: spread_samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    };

    if let Some(order) = &order {
        orders.push(OrderReportEntry {
            id: order.id(),
            state: format!("{:?}", order.state()),
            side: side_str.to_string(),
            timeline_summary: order.timeline_summary(),
            race_conditions: race_conditions.clone(),
        });
    }

    if !success {
        warn!(venue = %task.venue, symbol = %task.symbol, mode = mode_str, "diagnostic task failed");
    } else {
        info!(venue = %task.venue, symbol = %task.symbol, mode = mode_str, "diagnostic task succeeded");
    }

    TaskReport {
        venue: task.venue.clone(),
        symbol: task.symbol.clone(),
        mode: mode_str.to_string(),
        side: side_str.to_string(),
        success,
        attempts: 1,
        duration_secs: started.elapsed().as_secs_f64(),
        events,
        errors,
        warnings,
        orders,
        price_stats,
    }
}

/// Write the report to `path` using the same atomic tmp+rename pattern as
/// `ExecutionConfig::save`.
pub fn save_report(report: &DiagnosticReport, path: &str) -> anyhow::Result<()> {
    use std::io::Write;

    let json = serde_json::to_string_pretty(report)?;
    let tmp_path = format!("{path}.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_bps_computes_basis_points_from_mid() {
        let bps = spread_bps(Some(100), Some(102), 1).unwrap();
        assert!((bps - 198.0).abs() < 1.0);
    }

    #[test]
    fn spread_bps_none_without_both_sides() {
        assert!(spread_bps(None, Some(100), 1).is_none());
    }
}
