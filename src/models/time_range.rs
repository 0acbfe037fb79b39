use serde::{Deserialize, Serialize};

/// Span and market set covered by an import or resample operation.
/// `from`/`to` are inclusive bucket-time bounds in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
    pub markets: Vec<String>,
}

impl TimeRange {
    pub fn empty() -> Self {
        Self {
            from: i64::MAX,
            to: i64::MIN,
            markets: Vec::new(),
        }
    }

    /// Grow the range to cover a bar at `time` for `market`.
    pub fn extend(&mut self, market: &str, time: i64) {
        self.from = self.from.min(time);
        self.to = self.to.max(time);
        if !self.markets.iter().any(|m| m == market) {
            self.markets.push(market.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::empty()
    }
}
