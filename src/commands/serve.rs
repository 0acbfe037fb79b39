//! Node entrypoint: wires the store, aggregator, flush worker, cluster role
//! and query API together and runs until interrupted.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::cluster::{CollectorNode, Coordinator};
use crate::config::{Config, NodeRole};
use crate::error::Result;
use crate::server;
use crate::services::connections::LoggingCrossoverHook;
use crate::services::{BarAggregator, PendingSource, Persistence, QueryService};
use crate::worker::{now_ms, FlushPipeline, TradeQueue};

pub async fn run(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.api_port = port;
    }
    let config = Arc::new(config);

    info!(
        role = ?config.role,
        timeframe = config.timeframe,
        pairs = config.pairs.len(),
        "starting node"
    );

    let persistence = Arc::new(Persistence::connect(config.clone()).await);
    persistence.ensure_retention_policies().await?;

    let aggregator = Arc::new(Mutex::new(BarAggregator::new(
        config.timeframe,
        Arc::new(LoggingCrossoverHook),
    )));

    // resume the current bucket from the last persisted rows so the
    // post-restart rewrite does not zero out accumulated volume
    if config.role.collects() {
        let recovered = persistence.previous_bars(now_ms()).await?;
        if !recovered.is_empty() {
            info!(bars = recovered.len(), "resuming last persisted bars");
            let mut aggregator = aggregator.lock().await;
            for bar in recovered {
                aggregator.restore_bar(bar);
            }
        }
    }

    let pipeline = Arc::new(FlushPipeline::new(
        aggregator.clone(),
        persistence.clone(),
        config.clone(),
    ));
    let queue = Arc::new(TradeQueue::default());

    if config.role.collects() {
        let worker = pipeline.clone();
        let worker_queue = queue.clone();
        tokio::spawn(async move { worker.run(worker_queue).await });
    }

    let pending = match config.role {
        NodeRole::Standalone => Some(PendingSource::Local(aggregator.clone())),
        NodeRole::Coordinator => {
            let coordinator = Coordinator::new(config.clone());
            let accepting = coordinator.clone();
            tokio::spawn(async move {
                if let Err(err) = accepting.run().await {
                    error!(error = %err, "coordinator stopped");
                }
            });
            Some(PendingSource::Cluster(coordinator))
        }
        NodeRole::Collector => {
            let collector = CollectorNode::new(config.clone(), pipeline.clone());
            tokio::spawn(async move { collector.run().await });
            None
        }
    };

    if let Some(pending) = pending {
        let query = Arc::new(QueryService::new(
            persistence.clone(),
            config.clone(),
            pending,
        ));
        let api_port = config.api_port;
        tokio::spawn(async move {
            if let Err(err) = server::serve(query, api_port).await {
                error!(error = %err, "query API stopped");
            }
        });
    }

    signal::ctrl_c().await?;
    info!("interrupted, flushing pending bars");

    // forced final flush: whatever is buffered goes to the store before exit
    pipeline.save(queue.drain(), true).await?;
    info!("shutdown complete");

    Ok(())
}
