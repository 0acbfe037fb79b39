//! Trade batch → pending bar state machine.
//!
//! One aggregator instance owns the pending bars and connection registry of
//! a node. Batches are folded sequentially; there is no intra-process
//! parallelism over this state, callers serialize access behind a mutex.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, error};

use crate::models::timeframe::floor_time;
use crate::models::{Bar, PendingBars, Side, TimeRange, Trade};
use crate::services::connections::{ConnectionRegistry, PriceCrossoverHook};

pub struct BarAggregator {
    timeframe: i64,
    pending: PendingBars,
    connections: ConnectionRegistry,
    hook: Arc<dyn PriceCrossoverHook>,
}

impl BarAggregator {
    pub fn new(timeframe: i64, hook: Arc<dyn PriceCrossoverHook>) -> Self {
        Self {
            timeframe,
            pending: PendingBars::new(),
            connections: ConnectionRegistry::default(),
            hook,
        }
    }

    /// Fold a batch of trades, in arrival order, into pending bars.
    ///
    /// A bar is closed the moment a trade maps to a strictly later bucket
    /// for its market, plus a final pass closes every bar still active at
    /// the end of the batch; closed bars stay pending until the next drain
    /// and can keep accumulating if more trades target the same bucket.
    pub fn process(&mut self, trades: &[Trade]) {
        if trades.is_empty() {
            return;
        }

        // market -> index of its active bar in the pending list
        let mut active: HashMap<String, usize> = HashMap::new();
        let mut changed: BTreeSet<String> = BTreeSet::new();

        for trade in trades {
            let market = trade.market();

            let mut bucket = floor_time(trade.timestamp, self.timeframe);
            if let Some(last_closed) = self.connections.last_bar(&market) {
                // out-of-order delivery: clamp forward into the last closed
                // bucket instead of creating a stale duplicate
                if bucket < last_closed.time {
                    bucket = last_closed.time;
                }
            }

            let roll = match active.get(&market) {
                Some(&index) => match self.pending_bar(&market, index) {
                    Some(bar) => bar.time < bucket,
                    None => {
                        error!(market, "active bar missing from pending set");
                        true
                    }
                },
                None => true,
            };

            if roll {
                if let Some(index) = active.remove(&market) {
                    self.close_bar(&market, index, &mut changed);
                } else {
                    // first activity for this market in the batch
                    self.connections.ensure(&market).reset_range();
                }

                let index = self.activate_bar(&market, bucket);
                active.insert(market.clone(), index);
            }

            let Some(index) = active.get(&market).copied() else {
                continue;
            };
            let Some(bar) = self
                .pending
                .get_mut(&market)
                .and_then(|bars| bars.get_mut(index))
            else {
                error!(market, "active bar vanished, skipping trade");
                continue;
            };

            apply_trade(bar, trade);
        }

        // end of batch: close everything still active; the batch boundary
        // does not by itself mean the bucket is finished, the bars stay
        // pending and reopen through the connection reference
        let still_active: Vec<(String, usize)> = active.drain().collect();
        for (market, index) in still_active {
            self.close_bar(&market, index, &mut changed);
        }

        for market in changed {
            if let Some(state) = self.connections.get(&market) {
                if state.high.is_finite() && state.low.is_finite() {
                    self.hook.price_crossover(&market, state.high, state.low);
                }
            }
        }
    }

    /// Find or create the pending bar for `bucket`, returning its index.
    fn activate_bar(&mut self, market: &str, bucket: i64) -> usize {
        let recovered = self
            .connections
            .last_bar(market)
            .filter(|bar| bar.time == bucket)
            .cloned();

        let bars = self.pending.entry(market.to_string()).or_default();

        if let Some(last) = bars.last() {
            if last.time == bucket {
                return bars.len() - 1;
            }
        }

        if let Some(bar) = recovered {
            // the bucket was flushed (or closed last batch) but is still the
            // market's newest: resume it from the connection reference
            bars.push(bar);
            return bars.len() - 1;
        }

        if let Some(position) = bars.iter().position(|bar| bar.time == bucket) {
            return position;
        }

        bars.push(Bar::new(market, bucket));
        bars.len() - 1
    }

    fn pending_bar(&self, market: &str, index: usize) -> Option<&Bar> {
        self.pending.get(market).and_then(|bars| bars.get(index))
    }

    /// Freeze a bar: fold its range into the market's running high/low and
    /// remember it as the market's most recently closed bar.
    fn close_bar(&mut self, market: &str, index: usize, changed: &mut BTreeSet<String>) {
        let Some(bar) = self.pending_bar(market, index).cloned() else {
            error!(market, index, "cannot close undefined active bar");
            return;
        };

        let state = self.connections.ensure(market);
        if bar.close.is_some() {
            if let (Some(high), Some(low)) = (bar.high, bar.low) {
                state.high = state.high.max(high);
                state.low = state.low.min(low);
                changed.insert(market.to_string());
            }
        }
        state.bar = Some(bar);
    }

    /// Merge a bar recovered from the persisted last row into the pending
    /// set, used on startup so the current bucket keeps accumulating
    /// instead of being overwritten by a fresh partial bar.
    pub fn restore_bar(&mut self, bar: Bar) {
        debug!(market = %bar.market, time = bar.time, "restoring last persisted bar");
        let bars = self.pending.entry(bar.market.clone()).or_default();
        if let Some(existing) = bars.iter_mut().find(|existing| existing.time == bar.time) {
            existing.merge(&bar);
        } else {
            bars.push(bar);
        }
    }

    /// Atomically move every pending bar out of the shared structure,
    /// returning them time-sorted together with the covering range. Trades
    /// arriving afterwards create fresh bars instead of racing the write.
    pub fn drain(&mut self) -> (Vec<Bar>, TimeRange) {
        let drained = std::mem::take(&mut self.pending);

        let mut range = TimeRange::empty();
        let mut bars = Vec::new();
        for (market, list) in drained {
            for bar in list {
                range.extend(&market, bar.time);
                bars.push(bar);
            }
        }
        bars.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.market.cmp(&b.market)));

        (bars, range)
    }

    /// Pending bars for a collector peer request: `[from, to]` inclusive,
    /// regardless of whether the bar has trades yet.
    pub fn pending_bars(&self, markets: &[String], from: i64, to: i64) -> Vec<Bar> {
        let mut results = Vec::new();
        for market in markets {
            if let Some(bars) = self.pending.get(market) {
                results.extend(
                    bars.iter()
                        .filter(|bar| bar.time >= from && bar.time <= to)
                        .cloned(),
                );
            }
        }
        results
    }

    /// Pending bars for a local query splice: `[from, to)` and only bars
    /// that already carry a close.
    pub fn closed_pending_bars(&self, markets: &[String], from: i64, to: i64) -> Vec<Bar> {
        let mut results = Vec::new();
        for market in markets {
            if let Some(bars) = self.pending.get(market) {
                results.extend(
                    bars.iter()
                        .filter(|bar| bar.time >= from && bar.time < to && bar.has_trades())
                        .cloned(),
                );
            }
        }
        results.sort_by_key(|bar| bar.time);
        results
    }

    pub fn pending_bar_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn last_closed_bar(&self, market: &str) -> Option<&Bar> {
        self.connections.last_bar(market)
    }
}

fn apply_trade(bar: &mut Bar, trade: &Trade) {
    if trade.liquidation {
        match trade.side {
            Side::Buy => bar.lbuy += trade.notional(),
            Side::Sell => bar.lsell += trade.notional(),
        }
        return;
    }

    let price = trade.price;
    if bar.open.is_none() {
        bar.open = Some(price);
        bar.high = Some(price);
        bar.low = Some(price);
        bar.close = Some(price);
    } else {
        bar.high = bar.high.map(|high| high.max(price));
        bar.low = bar.low.map(|low| low.min(price));
        bar.close = Some(price);
    }

    match trade.side {
        Side::Buy => {
            bar.cbuy += trade.effective_count();
            bar.vbuy += trade.notional();
        }
        Side::Sell => {
            bar.csell += trade.effective_count();
            bar.vsell += trade.notional();
        }
    }
}
