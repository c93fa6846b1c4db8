// =============================================================================
// Central Application State — Execution Core
// =============================================================================
//
// The single source of truth the dashboard reads from. The router and its
// connectors own the actual trading state (positions, orders, books);
// AppState ties them together with the config and the version counter the
// WebSocket feed uses to detect changes worth pushing.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for the mutable config handle.
//   - The router and connectors manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ExecutionConfig;
use crate::diagnostic::DiagnosticReport;
use crate::router::ExecutionRouter;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

const MAX_RECENT_ERRORS: usize = 50;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation. The WebSocket feed uses this to detect changes worth
    /// pushing.
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    pub config: Arc<RwLock<ExecutionConfig>>,
    pub router: Arc<ExecutionRouter>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub last_diagnostic_report: RwLock<Option<DiagnosticReport>>,

    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: ExecutionConfig, router: Arc<ExecutionRouter>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            config: Arc::new(RwLock::new(config)),
            router,
            recent_errors: RwLock::new(Vec::new()),
            last_diagnostic_report: RwLock::new(None),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),
            start_time: Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }

        self.increment_version();
    }

    pub fn record_diagnostic_report(&self, report: DiagnosticReport) {
        *self.last_diagnostic_report.write() = Some(report);
        self.increment_version();
    }

    /// Build a serialisable snapshot of engine state for the dashboard's
    /// `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let version = self.current_state_version();

        let ws_user_event_age_ms = self.last_ws_user_event.read().elapsed().as_millis() as u64;

        let config = self.config.read();
        let config_summary = ConfigSummary {
            max_position_ratio: config.max_position_ratio,
            min_collateral_buffer: config.min_collateral_buffer,
            max_venue_concentration: config.max_venue_concentration,
            tick_size_secs: config.tick_size_secs,
        };
        drop(config);

        let venues = self.router.venues();

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            ws_user_connected: *self.ws_user_connected.read(),
            last_ws_user_event_age_ms: ws_user_event_age_ms,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            venues,
            config: config_summary,
            recent_errors: self.recent_errors.read().clone(),
            last_diagnostic_report: self.last_diagnostic_report.read().clone(),
        }
    }
}

/// Summary of the live `ExecutionConfig` for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub max_position_ratio: f64,
    pub min_collateral_buffer: f64,
    pub max_venue_concentration: f64,
    pub tick_size_secs: f64,
}

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub ws_user_connected: bool,
    pub last_ws_user_event_age_ms: u64,
    pub ws_sequence_number: u64,
    pub venues: Vec<String>,
    pub config: ConfigSummary,
    pub recent_errors: Vec<ErrorRecord>,
    pub last_diagnostic_report: Option<DiagnosticReport>,
}
