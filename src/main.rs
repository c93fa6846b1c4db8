// =============================================================================
// Execution Core — Main Entry Point
// =============================================================================
//
// Wires the symbol mapper, COI allocator, rate limiters, connectors, and risk
// service into one `ExecutionRouter`, spawns the tick dispatcher and the
// axum dashboard as background tasks, then waits for `ctrl_c()`.
//
// Strategy selection (`--strategy`) is intentionally a no-op label here: the
// execution core treats strategies as an opaque producer of order intents
// that call through the router's public API from outside this binary.
// =============================================================================

mod api;
mod app_state;
mod clock;
mod coi;
mod config;
mod connector;
mod credentials;
mod emergency;
mod error;
mod nonce;
mod order;
mod position;
mod rate_limiter;
mod risk;
mod router;
mod symbol;
mod tracking_limit;
mod types;
mod diagnostic;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::clock::Clock;
use crate::coi::CoiAllocator;
use crate::config::ExecutionConfig;
use crate::connector::ed25519_venue::Ed25519VenueConnector;
use crate::connector::Connector;
use crate::credentials::Credentials;
use crate::diagnostic::{run_diagnostics, save_report, DiagnosticTask, TestMode, TestSide};
use crate::rate_limiter::RateLimiter;
use crate::risk::{RiskLimits, RiskService};
use crate::router::ExecutionRouter;
use crate::symbol::SymbolMapper;

/// Parsed command-line flags, per the CLI contract: `--config`, `--strategy`,
/// `--list`, plus the ambient `--diagnostic` and `--dashboard-addr` flags.
struct Cli {
    config_path: String,
    strategy: Option<String>,
    list: bool,
    diagnostic: bool,
    dashboard_addr: String,
}

impl Cli {
    fn parse(args: &[String]) -> Self {
        let mut cli = Cli {
            config_path: std::env::var("EXEC_CONFIG").unwrap_or_else(|_| "execution_config.json".to_string()),
            strategy: None,
            list: false,
            diagnostic: false,
            dashboard_addr: "127.0.0.1:8080".to_string(),
        };

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    if let Some(v) = args.get(i + 1) {
                        cli.config_path = v.clone();
                        i += 1;
                    }
                }
                "--strategy" => {
                    if let Some(v) = args.get(i + 1) {
                        cli.strategy = Some(v.clone());
                        i += 1;
                    }
                }
                "--list" => cli.list = true,
                "--diagnostic" => cli.diagnostic = true,
                "--dashboard-addr" => {
                    if let Some(v) = args.get(i + 1) {
                        cli.dashboard_addr = v.clone();
                        i += 1;
                    }
                }
                other => {
                    warn!(flag = other, "ignoring unrecognized CLI flag");
                }
            }
            i += 1;
        }

        cli
    }
}

/// Build one Ed25519-signed connector from credentials and env-configured
/// venue name/base URL. Returns `None` when the env vars aren't set, so a
/// single-venue or multi-venue deployment both work without code changes.
fn build_ed25519_connector(
    credentials: &Credentials,
    symbols: Arc<SymbolMapper>,
    coi: Arc<CoiAllocator>,
    config: &ExecutionConfig,
) -> anyhow::Result<Option<(String, Arc<dyn Connector>)>> {
    let Some(creds) = &credentials.ed25519 else {
        return Ok(None);
    };
    let venue = std::env::var("EXEC_ED25519_VENUE").unwrap_or_else(|_| "backpack".to_string());
    let base_url = std::env::var("EXEC_ED25519_BASE_URL")
        .unwrap_or_else(|_| "https://api.backpack.exchange".to_string());

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_capacity("default")));
    let connector = Ed25519VenueConnector::new(
        venue.clone(),
        base_url,
        creds,
        symbols,
        rate_limiter,
        coi,
        config.book_freshness_horizon_secs,
    )?;
    Ok(Some((venue, Arc::new(connector))))
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = Cli::parse(&args);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    info!("execution core starting up");

    let config = match ExecutionConfig::load(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, path = %cli.config_path, "no execution config found, using defaults");
            ExecutionConfig::default()
        }
    };

    let credentials_path = std::env::var("EXEC_CREDENTIALS").unwrap_or_else(|_| "credentials.txt".to_string());
    let credentials = Credentials::load(&credentials_path)?;

    let symbols = Arc::new(SymbolMapper::new());
    let coi = Arc::new(CoiAllocator::new());

    let risk_limits = RiskLimits {
        max_position_ratio: config.max_position_ratio,
        min_collateral_buffer: config.min_collateral_buffer,
        max_venue_concentration: config.max_venue_concentration,
        max_order_size_ratio: config.max_order_size_ratio,
    };
    let risk = RiskService::new(symbols.clone(), risk_limits);

    let mut router = ExecutionRouter::new(symbols.clone(), coi.clone(), risk);

    if let Some((venue, connector)) = build_ed25519_connector(&credentials, symbols.clone(), coi.clone(), &config)? {
        connector.start().await?;
        connector.ensure_markets().await?;
        for canonical in configured_symbols() {
            symbols.register(&canonical, &venue, &canonical);
        }
        connector.start_ws_state(&configured_symbols()).await?;
        coi.register_limit(&venue, config.coi_limit(&venue));
        router.register_connector(&venue, connector);
        info!(venue = %venue, "connector registered");
    }

    if credentials.nonce_venue.is_some() {
        warn!(
            "nonce-venue credentials present but no TxSigner implementation is wired into this binary — \
             register a concrete signer SDK for that venue before trading against it"
        );
    }

    let router = Arc::new(router);

    if cli.list {
        println!("configured venues:");
        for venue in router.venues() {
            println!("  {venue}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(strategy) = &cli.strategy {
        info!(strategy = %strategy, "strategy label recorded (execution core does not load strategy code)");
    }

    if cli.diagnostic {
        let tasks = diagnostic_tasks(&router);
        let report = run_diagnostics(&router, &tasks).await;
        save_report(&report, &config.diagnostic_report_path)?;
        info!(
            total = report.total_tasks,
            successful = report.successful_tasks,
            failed = report.failed_tasks,
            "diagnostic run complete"
        );
        return Ok(ExitCode::SUCCESS);
    }

    let clock = Arc::new(Clock::new(config.tick_size_secs));
    clock.start();

    let app_state = Arc::new(AppState::new(config, router));
    let app = crate::api::rest::router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&cli.dashboard_addr).await?;
    info!(addr = %cli.dashboard_addr, "dashboard listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "dashboard server exited with error");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received, shutting down"),
        Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway"),
    }

    clock.stop().await;
    server.abort();

    Ok(ExitCode::SUCCESS)
}

fn configured_symbols() -> Vec<String> {
    std::env::var("EXEC_SYMBOLS")
        .unwrap_or_else(|_| "BTC-PERP".to_string())
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Minimal diagnostic sweep: one market buy against each registered venue for
/// the first configured symbol. A richer task list can be supplied via the
/// dashboard's `POST /api/v1/diagnostic/run` instead.
fn diagnostic_tasks(router: &ExecutionRouter) -> Vec<DiagnosticTask> {
    let symbol = configured_symbols().into_iter().next().unwrap_or_else(|| "BTC-PERP".to_string());
    router
        .venues()
        .into_iter()
        .map(|venue| DiagnosticTask {
            venue,
            symbol: symbol.clone(),
            mode: TestMode::Market,
            side: TestSide::Buy,
            size_i: 1,
            timeout: std::time::Duration::from_secs(30),
        })
        .collect()
}
