// =============================================================================
// Symbol mapper
// =============================================================================
//
// Bidirectional canonical <-> venue symbol translation plus the per-(venue,
// symbol) market metadata cache (§3). Canonical symbols are stored uppercase;
// lookups are case-insensitive. Registration is additive — there is no
// runtime deletion, matching the "markets loaded lazily, never evicted"
// lifecycle rule (§3).
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::MarketMetadata;

fn normalize_canonical(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect::<String>()
        .to_uppercase()
}

#[derive(Default)]
struct SymbolState {
    /// canonical -> venue -> venue_symbol
    to_venue: HashMap<String, HashMap<String, String>>,
    /// venue -> venue_symbol (normalized) -> canonical
    to_canonical: HashMap<String, HashMap<String, String>>,
    /// (venue, canonical) -> metadata
    metadata: HashMap<(String, String), MarketMetadata>,
}

/// Bidirectional symbol mapper shared across connectors and services.
pub struct SymbolMapper {
    state: RwLock<SymbolState>,
}

impl SymbolMapper {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SymbolState::default()),
        }
    }

    /// Register a canonical symbol's mapping to one venue's native symbol.
    /// Additive: re-registering the same (canonical, venue) pair overwrites
    /// only that pair, never removes other venues' mappings.
    pub fn register(&self, canonical: &str, venue: &str, venue_symbol: &str) {
        let canonical = normalize_canonical(canonical);
        let mut state = self.state.write();

        state
            .to_venue
            .entry(canonical.clone())
            .or_default()
            .insert(venue.to_string(), venue_symbol.to_string());

        state
            .to_canonical
            .entry(venue.to_string())
            .or_default()
            .insert(normalize_canonical(venue_symbol), canonical);
    }

    /// Resolve a canonical symbol to `venue`'s native symbol string.
    /// Unknown pairs fall back to `default`, or to the canonical string
    /// itself if no default is supplied (best-effort, per §3).
    pub fn to_venue(&self, canonical: &str, venue: &str, default: Option<&str>) -> Option<String> {
        let canonical = normalize_canonical(canonical);
        let state = self.state.read();
        if let Some(found) = state
            .to_venue
            .get(&canonical)
            .and_then(|m| m.get(venue))
            .cloned()
        {
            return Some(found);
        }
        default.map(|d| d.to_string()).or(Some(canonical))
    }

    /// Resolve a venue-native symbol to its canonical identifier.
    pub fn to_canonical(&self, venue: &str, venue_symbol: &str, default: Option<&str>) -> Option<String> {
        let normalized = normalize_canonical(venue_symbol);
        let state = self.state.read();
        if let Some(found) = state
            .to_canonical
            .get(venue)
            .and_then(|m| m.get(&normalized))
            .cloned()
        {
            return Some(found);
        }
        default.map(|d| d.to_string()).or(Some(normalized))
    }

    /// `true` if `canonical` has a registered mapping for `venue`.
    pub fn has(&self, canonical: &str, venue: &str) -> bool {
        let canonical = normalize_canonical(canonical);
        self.state
            .read()
            .to_venue
            .get(&canonical)
            .map(|m| m.contains_key(venue))
            .unwrap_or(false)
    }

    /// Store (or replace) market metadata for a (venue, canonical) pair.
    /// Refetch is permitted and replaces the whole entry (§3).
    pub fn set_metadata(&self, venue: &str, canonical: &str, metadata: MarketMetadata) {
        let canonical = normalize_canonical(canonical);
        self.state
            .write()
            .metadata
            .insert((venue.to_string(), canonical), metadata);
    }

    pub fn metadata(&self, venue: &str, canonical: &str) -> Option<MarketMetadata> {
        let canonical = normalize_canonical(canonical);
        self.state
            .read()
            .metadata
            .get(&(venue.to_string(), canonical))
            .cloned()
    }
}

impl Default for SymbolMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_round_trip() {
        let mapper = SymbolMapper::new();
        mapper.register("BTC-PERP", "backpack", "BTC_USDC_PERP");
        let venue_symbol = mapper.to_venue("BTC-PERP", "backpack", None).unwrap();
        let canonical = mapper.to_canonical("backpack", &venue_symbol, None).unwrap();
        assert_eq!(canonical, "BTC-PERP");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mapper = SymbolMapper::new();
        mapper.register("btc-perp", "backpack", "BTC_USDC_PERP");
        assert!(mapper.has("BTC-PERP", "backpack"));
        assert_eq!(
            mapper.to_venue("btc-perp", "backpack", None).unwrap(),
            "BTC_USDC_PERP"
        );
    }

    #[test]
    fn unknown_pair_falls_back_to_canonical() {
        let mapper = SymbolMapper::new();
        assert_eq!(mapper.to_venue("ETH-PERP", "lighter", None).unwrap(), "ETH-PERP");
    }

    #[test]
    fn unknown_pair_uses_supplied_default() {
        let mapper = SymbolMapper::new();
        assert_eq!(
            mapper.to_venue("ETH-PERP", "lighter", Some("ETH_USDC")).unwrap(),
            "ETH_USDC"
        );
    }

    #[test]
    fn registration_is_additive_across_venues() {
        let mapper = SymbolMapper::new();
        mapper.register("BTC-PERP", "backpack", "BTC_USDC_PERP");
        mapper.register("BTC-PERP", "lighter", "BTC-USD");
        assert!(mapper.has("BTC-PERP", "backpack"));
        assert!(mapper.has("BTC-PERP", "lighter"));
    }

    #[test]
    fn metadata_refetch_replaces_entry() {
        let mapper = SymbolMapper::new();
        mapper.set_metadata("backpack", "BTC-PERP", MarketMetadata::with_defaults(1, 3));
        mapper.set_metadata("backpack", "BTC-PERP", MarketMetadata::with_defaults(2, 4));
        let meta = mapper.metadata("backpack", "BTC-PERP").unwrap();
        assert_eq!(meta.price_decimals, 2);
        assert_eq!(meta.size_decimals, 4);
    }
}
