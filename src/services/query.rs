//! Historical bar queries in the point format.
//!
//! Persisted rows come straight from the store; when the requested range
//! reaches into the current resample window the not-yet-persisted pending
//! bars are appended after them. The pending tail is only sorted within
//! itself, persisted rows always come first.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::Coordinator;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::Bar;
use crate::services::aggregator::BarAggregator;
use crate::services::persistence::Persistence;
use crate::worker::now_ms;

const COLUMNS: [&str; 12] = [
    "time", "open", "high", "low", "close", "vbuy", "vsell", "cbuy", "csell", "lbuy", "lsell",
    "market",
];

/// Where live pending bars come from: the node's own aggregator, or the
/// cluster's collectors.
pub enum PendingSource {
    Local(Arc<Mutex<BarAggregator>>),
    Cluster(Coordinator),
}

#[derive(Debug, Clone)]
pub struct FetchParams {
    /// ms epoch, inclusive
    pub from: i64,
    /// ms epoch, exclusive
    pub to: i64,
    pub timeframe: i64,
    pub markets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub format: &'static str,
    pub columns: HashMap<String, usize>,
    pub results: Vec<Vec<Value>>,
}

pub struct QueryService {
    persistence: Arc<Persistence>,
    config: Arc<Config>,
    pending: PendingSource,
}

impl QueryService {
    pub fn new(persistence: Arc<Persistence>, config: Arc<Config>, pending: PendingSource) -> Self {
        Self {
            persistence,
            config,
            pending,
        }
    }

    pub async fn fetch(&self, params: &FetchParams) -> Result<FetchResponse> {
        self.fetch_at(params, now_ms()).await
    }

    async fn fetch_at(&self, params: &FetchParams, now: i64) -> Result<FetchResponse> {
        if params.from > params.to {
            return Err(AppError::InvalidInput(format!(
                "invalid range {} to {}",
                params.from, params.to
            )));
        }
        if !self.config.timeframes().contains(&params.timeframe) {
            return Err(AppError::InvalidInput(format!(
                "unknown timeframe {}",
                params.timeframe
            )));
        }

        let persisted = self
            .persistence
            .fetch_bars(params.timeframe, params.from, params.to, &params.markets)
            .await?;
        let mut results: Vec<Vec<Value>> = persisted.iter().map(bar_to_point).collect();

        // within the current resample window the store lags behind the
        // aggregators; splice the live pending bars onto the tail
        if params.to > now - self.config.resample_interval {
            let pending = self.pending_bars(params).await;
            debug!(
                persisted = results.len(),
                pending = pending.len(),
                "appending pending bars"
            );
            results.extend(pending.iter().map(bar_to_point));
        }

        Ok(FetchResponse {
            format: "point",
            columns: column_map(),
            results,
        })
    }

    async fn pending_bars(&self, params: &FetchParams) -> Vec<Bar> {
        match &self.pending {
            PendingSource::Local(aggregator) => aggregator
                .lock()
                .await
                .closed_pending_bars(&params.markets, params.from, params.to),
            PendingSource::Cluster(coordinator) => {
                coordinator
                    .request_pending_bars(&params.markets, params.from, params.to)
                    .await
            }
        }
    }
}

fn column_map() -> HashMap<String, usize> {
    COLUMNS
        .iter()
        .enumerate()
        .map(|(index, name)| (name.to_string(), index))
        .collect()
}

fn bar_to_point(bar: &Bar) -> Vec<Value> {
    vec![
        json!(bar.time),
        json!(bar.open),
        json!(bar.high),
        json!(bar.low),
        json!(bar.close),
        json!(bar.vbuy),
        json!(bar.vsell),
        json!(bar.cbuy),
        json!(bar.csell),
        json!(bar.lbuy),
        json!(bar.lsell),
        json!(bar.market),
    ]
}
