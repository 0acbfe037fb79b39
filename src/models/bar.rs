use serde::{Deserialize, Serialize};

/// One fixed-duration aggregation window for one market.
///
/// OHLC fields stay null until the first non-liquidation trade arrives in
/// the bucket; liquidation trades only ever touch `lbuy`/`lsell`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub market: String,
    /// Bucket start, ms epoch, multiple of the bar's timeframe
    pub time: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    /// Notional buy/sell volume
    pub vbuy: f64,
    pub vsell: f64,
    /// Trade counts
    pub cbuy: i64,
    pub csell: i64,
    /// Liquidation notional volume
    pub lbuy: f64,
    pub lsell: f64,
}

impl Bar {
    pub fn new(market: impl Into<String>, time: i64) -> Self {
        Self {
            market: market.into(),
            time,
            open: None,
            high: None,
            low: None,
            close: None,
            vbuy: 0.0,
            vsell: 0.0,
            cbuy: 0,
            csell: 0,
            lbuy: 0.0,
            lsell: 0.0,
        }
    }

    /// Whether at least one non-liquidation trade contributed to this bar.
    pub fn has_trades(&self) -> bool {
        self.close.is_some()
    }

    /// Fold another bar into this one. Used both when merging a recovered
    /// persisted row into a pending bar and when resampling source rows into
    /// a higher-timeframe bucket: the first seen open wins, the last seen
    /// close wins, highs/lows widen and volumes/counts accumulate.
    pub fn merge(&mut self, other: &Bar) {
        if self.open.is_none() {
            self.open = other.open;
        }
        self.high = match (self.high, other.high) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.low = match (self.low, other.low) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if other.close.is_some() {
            self.close = other.close;
        }
        self.vbuy += other.vbuy;
        self.vsell += other.vsell;
        self.cbuy += other.cbuy;
        self.csell += other.csell;
        self.lbuy += other.lbuy;
        self.lsell += other.lsell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(time: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            vbuy: 10.0,
            cbuy: 1,
            ..Bar::new("BINANCE:BTCUSDT", time)
        }
    }

    #[test]
    fn merge_keeps_first_open_and_last_close() {
        let mut first = bar(0, 100.0, 105.0, 99.0, 101.0);
        let second = bar(0, 101.0, 110.0, 95.0, 96.0);
        first.merge(&second);

        assert_eq!(first.open, Some(100.0));
        assert_eq!(first.high, Some(110.0));
        assert_eq!(first.low, Some(95.0));
        assert_eq!(first.close, Some(96.0));
        assert_eq!(first.vbuy, 20.0);
        assert_eq!(first.cbuy, 2);
    }

    #[test]
    fn merge_into_empty_bar_copies_ohlc() {
        let mut empty = Bar::new("BINANCE:BTCUSDT", 0);
        empty.merge(&bar(0, 100.0, 105.0, 99.0, 101.0));
        assert_eq!(empty.open, Some(100.0));
        assert_eq!(empty.close, Some(101.0));
        assert!(empty.has_trades());
    }

    #[test]
    fn liquidation_only_bar_has_no_trades() {
        let mut bar = Bar::new("BINANCE:BTCUSDT", 0);
        bar.lsell = 102.0;
        assert!(!bar.has_trades());
    }
}
