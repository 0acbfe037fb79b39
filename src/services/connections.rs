//! Per-market connection state and the price-crossover seam.
//!
//! The alerting subsystem lives outside this crate; it observes price
//! ranges through [`PriceCrossoverHook`] and feeds alert mutations back in
//! through the persistence gateway's alert sink.

use std::collections::HashMap;

use tracing::debug;

use crate::models::Bar;

/// Consumes the running high/low of each market after a batch closes bars.
pub trait PriceCrossoverHook: Send + Sync {
    fn price_crossover(&self, market: &str, high: f64, low: f64);
}

/// Default hook: just trace the range.
pub struct LoggingCrossoverHook;

impl PriceCrossoverHook for LoggingCrossoverHook {
    fn price_crossover(&self, market: &str, high: f64, low: f64) {
        debug!(market, high, low, "price range updated");
    }
}

/// Mutable per-market state: running high/low since the batch's first close
/// and a reference to the most recently closed bar. The closed bar seeds new
/// bars correctly after a flush or restart; the range feeds crossover checks.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub high: f64,
    pub low: f64,
    pub bar: Option<Bar>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            high: f64::NEG_INFINITY,
            low: f64::INFINITY,
            bar: None,
        }
    }
}

impl ConnectionState {
    pub fn reset_range(&mut self) {
        self.high = f64::NEG_INFINITY;
        self.low = f64::INFINITY;
    }
}

/// Owned registry of connection states, one per market this node tracks.
/// Constructed once per node and passed explicitly to the aggregator.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    states: HashMap<String, ConnectionState>,
}

impl ConnectionRegistry {
    pub fn ensure(&mut self, market: &str) -> &mut ConnectionState {
        self.states.entry(market.to_string()).or_default()
    }

    pub fn get(&self, market: &str) -> Option<&ConnectionState> {
        self.states.get(market)
    }

    pub fn last_bar(&self, market: &str) -> Option<&Bar> {
        self.states.get(market).and_then(|state| state.bar.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_initializes_unbounded_range() {
        let mut registry = ConnectionRegistry::default();
        let state = registry.ensure("BINANCE:BTCUSDT");
        assert_eq!(state.high, f64::NEG_INFINITY);
        assert_eq!(state.low, f64::INFINITY);
        assert!(state.bar.is_none());
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut registry = ConnectionRegistry::default();
        registry.ensure("BINANCE:BTCUSDT").high = 101.0;
        assert_eq!(registry.ensure("BINANCE:BTCUSDT").high, 101.0);
        assert!(registry.get("BITMEX:XBTUSD").is_none());
    }
}
