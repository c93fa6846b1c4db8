// =============================================================================
// Risk service — pre-trade checks and post-order risk assessment
// =============================================================================
//
// Four pre-trade checks run before any order reaches a connector (§4.I):
// minimum size, collateral adequacy, position limit, and venue concentration.
// Each raises the matching `RiskViolation` variant through `ExecError`. Post-
// order assessment never raises — it returns metrics and a list of warning
// strings for the caller to log or surface on the dashboard.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::error;

use crate::error::{ExecError, RiskViolation};
use crate::position::PositionService;
use crate::symbol::SymbolMapper;

/// Post-order risk metrics. Never represents a hard failure — callers decide
/// what to do with the warnings.
#[derive(Debug, Clone, Serialize)]
pub struct PostOrderRisk {
    pub venue_position: f64,
    pub net_position: f64,
    pub total_collateral: f64,
    pub position_ratio: f64,
    pub venue_concentration: f64,
    pub warnings: Vec<String>,
}

pub struct RiskLimits {
    pub max_position_ratio: f64,
    pub min_collateral_buffer: f64,
    pub max_venue_concentration: f64,
    pub max_order_size_ratio: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_ratio: 0.8,
            min_collateral_buffer: 0.1,
            max_venue_concentration: 0.6,
            max_order_size_ratio: 0.2,
        }
    }
}

pub struct RiskService {
    limits: RiskLimits,
    symbols: Arc<SymbolMapper>,
}

impl RiskService {
    pub fn new(symbols: Arc<SymbolMapper>, limits: RiskLimits) -> Self {
        Self { limits, symbols }
    }

    fn min_size_i(&self, venue: &str, canonical_symbol: &str) -> i64 {
        self.symbols
            .metadata(venue, canonical_symbol)
            .map(|m| (m.min_qty * m.size_scale() as f64).round() as i64)
            .unwrap_or(1)
    }

    fn size_scale(&self, venue: &str, canonical_symbol: &str) -> i64 {
        self.symbols.metadata(venue, canonical_symbol).map(|m| m.size_scale()).unwrap_or(1)
    }

    /// Run all four pre-order checks. The first violation found is returned.
    pub async fn check_pre_order_risk(
        &self,
        positions: &PositionService,
        venue: &str,
        canonical_symbol: &str,
        size_i: i64,
        is_ask: bool,
    ) -> Result<(), ExecError> {
        self.check_minimum_size(venue, canonical_symbol, size_i)?;
        self.check_collateral_adequacy(positions, venue, canonical_symbol, size_i, is_ask).await?;
        self.check_position_limits(positions, venue, canonical_symbol, size_i, is_ask).await?;
        self.check_concentration_limits(positions, venue, canonical_symbol, size_i, is_ask).await?;
        Ok(())
    }

    fn check_minimum_size(&self, venue: &str, canonical_symbol: &str, size_i: i64) -> Result<(), ExecError> {
        let min_size_i = self.min_size_i(venue, canonical_symbol);
        if size_i < min_size_i {
            return Err(RiskViolation::MinSize {
                venue: venue.to_string(),
                symbol: canonical_symbol.to_string(),
                size_i,
                min_size_i,
            }
            .into());
        }
        Ok(())
    }

    async fn check_collateral_adequacy(
        &self,
        positions: &PositionService,
        venue: &str,
        canonical_symbol: &str,
        size_i: i64,
        is_ask: bool,
    ) -> Result<(), ExecError> {
        if is_ask {
            return Ok(());
        }

        let collateral = positions.get_collateral(venue).await.unwrap_or(0.0);
        let size_scale = self.size_scale(venue, canonical_symbol);
        let order_size = size_i as f64 / size_scale as f64;

        let required = order_size;
        let available = collateral * (1.0 - self.limits.min_collateral_buffer);

        if required > available {
            return Err(RiskViolation::Collateral {
                venue: venue.to_string(),
                required,
                allowed: available,
            }
            .into());
        }
        Ok(())
    }

    async fn check_position_limits(
        &self,
        positions: &PositionService,
        venue: &str,
        canonical_symbol: &str,
        size_i: i64,
        is_ask: bool,
    ) -> Result<(), ExecError> {
        let current_position = positions.get_position(venue, canonical_symbol).await.unwrap_or(0.0);
        let size_scale = self.size_scale(venue, canonical_symbol);
        let order_size = size_i as f64 / size_scale as f64;
        let new_position = current_position + if is_ask { -order_size } else { order_size };

        let collateral = positions.get_collateral(venue).await.unwrap_or(0.0);
        let max_position = collateral * self.limits.max_position_ratio;

        if new_position.abs() > max_position {
            return Err(RiskViolation::PositionLimit {
                venue: venue.to_string(),
                new_position,
                limit: max_position,
            }
            .into());
        }
        Ok(())
    }

    async fn check_concentration_limits(
        &self,
        positions: &PositionService,
        venue: &str,
        canonical_symbol: &str,
        size_i: i64,
        is_ask: bool,
    ) -> Result<(), ExecError> {
        let net = positions.get_net_position(canonical_symbol, None).await;
        let current_venue_position = net.per_venue.get(venue).copied().unwrap_or(0.0);
        let current_net_position = net.total;

        let size_scale = self.size_scale(venue, canonical_symbol);
        let order_size = size_i as f64 / size_scale as f64;
        let signed = if is_ask { -order_size } else { order_size };
        let new_venue_position = current_venue_position + signed;
        let new_net_position = current_net_position + signed;

        if new_net_position.abs() > 0.0 {
            let concentration = new_venue_position.abs() / new_net_position.abs();
            if concentration > self.limits.max_venue_concentration {
                return Err(RiskViolation::VenueConcentration {
                    venue: venue.to_string(),
                    concentration,
                    limit: self.limits.max_venue_concentration,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Post-order risk metrics. Logs and returns a degraded (empty-warnings)
    /// report on internal failure rather than propagating an error.
    pub async fn check_post_order_risk(
        &self,
        positions: &PositionService,
        venue: &str,
        canonical_symbol: &str,
        filled_size_i: i64,
        is_ask: bool,
    ) -> PostOrderRisk {
        let current_position = positions.get_position(venue, canonical_symbol).await.unwrap_or(0.0);
        let size_scale = self.size_scale(venue, canonical_symbol);
        let filled_size = filled_size_i as f64 / size_scale as f64;
        let signed = if is_ask { -filled_size } else { filled_size };

        let new_position = current_position + signed;
        let net = positions.get_net_position(canonical_symbol, None).await;
        let new_net_position = net.total + signed;
        let collaterals = positions.get_total_collateral(None).await;
        let total_collateral = collaterals.total;

        let position_ratio = new_net_position.abs() / total_collateral.max(1.0);
        let venue_concentration = new_position.abs() / new_net_position.abs().max(1.0);

        let mut warnings = Vec::new();
        if position_ratio > self.limits.max_position_ratio {
            warnings.push(format!(
                "high position ratio: {:.2}% > {:.2}%",
                position_ratio * 100.0,
                self.limits.max_position_ratio * 100.0
            ));
        }
        if venue_concentration > self.limits.max_venue_concentration {
            warnings.push(format!(
                "high venue concentration: {:.2}% > {:.2}%",
                venue_concentration * 100.0,
                self.limits.max_venue_concentration * 100.0
            ));
        }

        if !warnings.is_empty() {
            error!(venue, symbol = canonical_symbol, warnings = ?warnings, "post-order risk warnings");
        }

        PostOrderRisk {
            venue_position: new_position,
            net_position: new_net_position,
            total_collateral,
            position_ratio,
            venue_concentration,
            warnings,
        }
    }

    /// Largest size_i the caller may safely submit for a directional order.
    pub async fn get_max_order_size(
        &self,
        positions: &PositionService,
        venue: &str,
        canonical_symbol: &str,
        is_ask: bool,
    ) -> i64 {
        let collateral = positions.get_collateral(venue).await.unwrap_or(0.0);
        let current_position = positions.get_position(venue, canonical_symbol).await.unwrap_or(0.0);
        let size_scale = self.size_scale(venue, canonical_symbol);
        let min_size_i = self.min_size_i(venue, canonical_symbol);

        let max_position_value = collateral * self.limits.max_position_ratio;
        let current_position_value = current_position.abs();

        let max_size_float = if is_ask {
            current_position.max(0.0)
        } else {
            (max_position_value - current_position_value).max(0.0)
        };

        let max_size_i = (max_size_float * size_scale as f64) as i64;
        if max_size_i < min_size_i {
            0
        } else {
            max_size_i
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_reference_values() {
        let limits = RiskLimits::default();
        assert_eq!(limits.max_position_ratio, 0.8);
        assert_eq!(limits.min_collateral_buffer, 0.1);
        assert_eq!(limits.max_venue_concentration, 0.6);
        assert_eq!(limits.max_order_size_ratio, 0.2);
    }

    #[test]
    fn min_size_without_metadata_defaults_to_one() {
        let symbols = Arc::new(SymbolMapper::new());
        let svc = RiskService::new(symbols, RiskLimits::default());
        assert_eq!(svc.min_size_i("backpack", "BTC-PERP"), 1);
    }
}
