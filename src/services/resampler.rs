//! Multi-level timeframe resampling.
//!
//! Starts from the base timeframe and updates every configured timeframe
//! above it: 10s into 30s, 1m into 3m, 5m into 15m, 3m into 21m and so on.
//! Each target is recomputed from the largest configured source that evenly
//! divides it, over the floored covering range of the flushed bars, and
//! written back with overwrite semantics — re-running a range is idempotent,
//! which flush timing and crash recovery both rely on.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::models::timeframe::{
    day_anchored_floor, floor_time, floor_with_phase, is_odd_timeframe, DAY_MS,
};
use crate::models::{Bar, TimeRange};
use crate::services::persistence::Persistence;

pub struct Resampler {
    persistence: Arc<Persistence>,
    config: Arc<Config>,
}

impl Resampler {
    pub fn new(persistence: Arc<Persistence>, config: Arc<Config>) -> Self {
        Self {
            persistence,
            config,
        }
    }

    /// Recompute every configured timeframe above `from_timeframe` (the
    /// whole hierarchy when omitted) over the given range, optionally
    /// restricted to a single `to_timeframe`.
    pub async fn resample(
        &self,
        range: &TimeRange,
        from_timeframe: Option<i64>,
        to_timeframe: Option<i64>,
    ) -> Result<()> {
        if range.is_empty() || range.markets.is_empty() {
            return Ok(());
        }

        debug!(markets = range.markets.len(), "resampling");

        let minimum = from_timeframe
            .map(|timeframe| timeframe.max(self.config.timeframe))
            .unwrap_or(self.config.timeframe);
        let targets: Vec<i64> = self
            .config
            .resample_to
            .iter()
            .copied()
            .filter(|&timeframe| match from_timeframe {
                Some(from) => timeframe > from,
                None => true,
            })
            .collect();

        for (position, &timeframe) in targets.iter().enumerate() {
            if let Some(only) = to_timeframe {
                if timeframe != only {
                    continue;
                }
            }

            let odd = is_odd_timeframe(timeframe);

            // covering range floored to the target grid; odd timeframes are
            // anchored to the day boundary so the grid cannot drift
            let (floor_from, floor_to) = if odd {
                // both bounds on the grid anchored at the range start's day
                let day_open = floor_time(range.from, DAY_MS);
                (
                    day_anchored_floor(range.from, timeframe),
                    day_open + (range.to - day_open) / timeframe * timeframe + timeframe,
                )
            } else {
                (
                    floor_time(range.from, timeframe),
                    floor_time(range.to, timeframe) + timeframe,
                )
            };

            let source = source_timeframe(&targets, position, timeframe, minimum);
            let phase = if odd { floor_from % timeframe } else { 0 };

            let rows = self
                .persistence
                .fetch_bars(source, floor_from, floor_to, &range.markets)
                .await?;
            let buckets = aggregate_buckets(rows, timeframe, phase);
            self.persistence.write_points(&buckets, timeframe).await?;

            debug!(
                timeframe,
                source,
                buckets = buckets.len(),
                "resampled range"
            );
        }

        Ok(())
    }
}

/// Largest configured timeframe below the target that evenly divides it,
/// falling back to the base timeframe.
fn source_timeframe(targets: &[i64], position: usize, timeframe: i64, minimum: i64) -> i64 {
    for index in (0..position).rev() {
        if timeframe > targets[index] && timeframe % targets[index] == 0 {
            return targets[index];
        }
    }
    minimum
}

/// Fold time-ascending source rows into target buckets: first open, last
/// close, widened high/low, summed counts and volumes.
fn aggregate_buckets(rows: Vec<Bar>, timeframe: i64, phase: i64) -> Vec<Bar> {
    let mut buckets: HashMap<(String, i64), Bar> = HashMap::new();

    for row in rows {
        let bucket_time = floor_with_phase(row.time, timeframe, phase);
        buckets
            .entry((row.market.clone(), bucket_time))
            .or_insert_with(|| Bar::new(&row.market, bucket_time))
            .merge(&row);
    }

    let mut bars: Vec<Bar> = buckets.into_values().collect();
    bars.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.market.cmp(&b.market)));
    bars
}
