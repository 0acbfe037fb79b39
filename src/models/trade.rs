use serde::{Deserialize, Serialize};
use std::fmt;

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Normalized trade event, as produced by the exchange feed adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: String,
    pub pair: String,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    /// ms epoch
    pub timestamp: i64,
    #[serde(default)]
    pub liquidation: bool,
    /// Number of underlying trades this event represents (aggregated feeds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

impl Trade {
    /// Market identifier, `EXCHANGE:pair`.
    pub fn market(&self) -> String {
        format!("{}:{}", self.exchange, self.pair)
    }

    pub fn effective_count(&self) -> i64 {
        self.count.unwrap_or(1)
    }

    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}
