//! Periodic flush worker.
//!
//! Buffers incoming trades, folds them into pending bars on every backup
//! interval, and on every resample interval drains the pending set into the
//! store and recomputes the timeframe hierarchy over the drained range.
//! Collectors in a cluster skip the self-triggered import; the coordinator
//! drives their flushes so the write load stays staggered.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument};

use crate::config::{Config, NodeRole};
use crate::error::Result;
use crate::models::timeframe::floor_time;
use crate::models::Trade;
use crate::services::aggregator::BarAggregator;
use crate::services::persistence::Persistence;
use crate::services::resampler::Resampler;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Intake buffer between exchange feeds and the flush worker.
#[derive(Default)]
pub struct TradeQueue {
    trades: std::sync::Mutex<Vec<Trade>>,
}

impl TradeQueue {
    pub fn push(&self, trades: Vec<Trade>) {
        self.trades.lock().unwrap_or_else(|e| e.into_inner()).extend(trades);
    }

    pub fn drain(&self) -> Vec<Trade> {
        std::mem::take(&mut *self.trades.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.trades.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct FlushPipeline {
    aggregator: Arc<Mutex<BarAggregator>>,
    persistence: Arc<Persistence>,
    resampler: Resampler,
    config: Arc<Config>,
}

impl FlushPipeline {
    pub fn new(
        aggregator: Arc<Mutex<BarAggregator>>,
        persistence: Arc<Persistence>,
        config: Arc<Config>,
    ) -> Self {
        let resampler = Resampler::new(persistence.clone(), config.clone());
        Self {
            aggregator,
            persistence,
            resampler,
            config,
        }
    }

    pub fn aggregator(&self) -> Arc<Mutex<BarAggregator>> {
        self.aggregator.clone()
    }

    /// Drain every pending bar, persist them at the base timeframe and
    /// update the resampled hierarchy over the drained range.
    pub async fn import(&self) -> Result<()> {
        let (bars, range) = self.aggregator.lock().await.drain();
        if bars.is_empty() {
            return Ok(());
        }

        debug!(bars = bars.len(), "importing pending bars");
        self.persistence
            .write_points(&bars, self.config.timeframe)
            .await?;
        self.resampler.resample(&range, None, None).await
    }

    /// Fold a batch of trades and, when the backup tick lands on a resample
    /// boundary (or the process is exiting), import the result.
    pub async fn save(&self, trades: Vec<Trade>, is_exiting: bool) -> Result<()> {
        if !trades.is_empty() {
            self.aggregator.lock().await.process(&trades);
        }

        if is_exiting {
            return self.import().await;
        }

        // collectors flush on the coordinator's schedule instead
        if self.config.role == NodeRole::Collector {
            return Ok(());
        }

        let now = now_ms();
        if floor_time(now, self.config.backup_interval)
            == floor_time(now, self.config.resample_interval)
        {
            self.import().await?;
        }
        Ok(())
    }

    /// Tick every backup interval, aligned to the interval grid; errors are
    /// logged and the loop keeps going, dropping a flush never kills the
    /// worker.
    #[instrument(skip_all)]
    pub async fn run(&self, queue: Arc<TradeQueue>) {
        info!(
            backup_interval = self.config.backup_interval,
            resample_interval = self.config.resample_interval,
            "flush worker started"
        );

        let mut last_sweep = now_ms();

        loop {
            let now = now_ms();
            let next = floor_time(now, self.config.backup_interval) + self.config.backup_interval;
            sleep(Duration::from_millis((next - now).max(1) as u64)).await;

            if let Err(err) = self.save(queue.drain(), false).await {
                error!(error = %err, "flush failed");
            }

            let now = now_ms();
            if now - last_sweep >= self.config.resample_interval {
                last_sweep = now;
                if let Err(err) = self.persistence.sweep_retention(now).await {
                    error!(error = %err, "retention sweep failed");
                }
            }
        }
    }
}
