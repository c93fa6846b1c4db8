// =============================================================================
// Error taxonomy for the execution core
// =============================================================================
//
// `ExecError` is the typed surface every component boundary raises; callers
// match on it (`ExecError::OrderRejected { .. }`, `ExecError::RiskViolation`)
// instead of string-sniffing. Setup/glue code that cannot recover (config
// load, credential parsing, connector bootstrap) wraps it in `anyhow::Result`
// via `.context(...)` instead of inventing its own error type.
// =============================================================================

use thiserror::Error;

/// A single pre-trade risk check that failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskViolation {
    #[error("order size {size_i} below minimum {min_size_i} for {venue}/{symbol}")]
    MinSize {
        venue: String,
        symbol: String,
        size_i: i64,
        min_size_i: i64,
    },
    #[error("estimated collateral requirement exceeds available buffer on {venue}: required {required:.4} > allowed {allowed:.4}")]
    Collateral {
        venue: String,
        required: f64,
        allowed: f64,
    },
    #[error("new position {new_position:.4} would exceed position limit {limit:.4} on {venue}")]
    PositionLimit {
        venue: String,
        new_position: f64,
        limit: f64,
    },
    #[error("venue concentration {concentration:.4} would exceed limit {limit:.4} on {venue}")]
    VenueConcentration {
        venue: String,
        concentration: f64,
        limit: f64,
    },
}

/// Typed error surface for the execution core.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("network error talking to {venue}: {source}")]
    Network {
        venue: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{venue} returned http {status}: {body}")]
    Http {
        venue: String,
        status: u16,
        body: String,
    },

    #[error("authentication failed for {venue}: {message}")]
    AuthInvalid { venue: String, message: String },

    #[error("nonce out of sync for {venue} api key index {api_key_index}: {message}")]
    NonceError {
        venue: String,
        api_key_index: u32,
        message: String,
    },

    #[error("{venue} rejected order {client_order_id}: {reason}")]
    OrderRejected {
        venue: String,
        client_order_id: u64,
        reason: String,
    },

    #[error("cancel target not found on {venue}: {detail}")]
    OrderNotFound { venue: String, detail: String },

    #[error("unknown symbol {symbol} on {venue}")]
    UnknownSymbol { venue: String, symbol: String },

    #[error(transparent)]
    RiskViolation(#[from] RiskViolation),

    #[error("tracking-limit order on {venue}/{symbol} exceeded its deadline after {attempts} attempts")]
    TrackingLimitTimeout {
        venue: String,
        symbol: String,
        attempts: u32,
    },

    #[error("could not parse response from {venue}: {detail}")]
    InvalidResponse { venue: String, detail: String },

    #[error("{venue} does not support {capability}")]
    NotSupported { venue: String, capability: String },

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// `true` for errors the submit/cancel retry loops should retry once
    /// before giving up (ground truth: spec §7 "Recovery").
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Network { .. } | ExecError::NonceError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_violation_converts_into_exec_error() {
        let violation = RiskViolation::MinSize {
            venue: "v".into(),
            symbol: "BTC".into(),
            size_i: 1,
            min_size_i: 10,
        };
        let err: ExecError = violation.into();
        assert!(matches!(err, ExecError::RiskViolation(_)));
    }

    #[test]
    fn transient_classification() {
        let nonce_err = ExecError::NonceError {
            venue: "v".into(),
            api_key_index: 0,
            message: "stale".into(),
        };
        assert!(nonce_err.is_transient());

        let rejected = ExecError::OrderRejected {
            venue: "v".into(),
            client_order_id: 1,
            reason: "bad size".into(),
        };
        assert!(!rejected.is_transient());
    }
}
