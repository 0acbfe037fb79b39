//! Collector side of the cluster bridge.
//!
//! Dials the coordinator, announces the markets this node tracks and then
//! answers two kinds of frames for the rest of the connection: `import`
//! (flush pending bars to the store, always acknowledged) and
//! `requestPendingBars` (snapshot the in-memory pending set).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cluster::protocol::{
    read_frame, write_frame, Frame, Hello, PendingBarsRequest, PendingBarsResponse, OP_HELLO,
    OP_IMPORT, OP_REQUEST_PENDING_BARS,
};
use crate::config::Config;
use crate::error::Result;
use crate::worker::FlushPipeline;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct CollectorNode {
    config: Arc<Config>,
    pipeline: Arc<FlushPipeline>,
}

impl CollectorNode {
    pub fn new(config: Arc<Config>, pipeline: Arc<FlushPipeline>) -> Self {
        Self { config, pipeline }
    }

    /// Dial the coordinator and serve the connection, reconnecting with a
    /// fixed delay whenever it drops.
    pub async fn run(&self) {
        loop {
            match TcpStream::connect(&self.config.cluster_coordinator).await {
                Ok(stream) => {
                    info!(coordinator = %self.config.cluster_coordinator, "connected");
                    if let Err(err) = self.serve(stream).await {
                        warn!(error = %err, "coordinator connection lost");
                    }
                }
                Err(err) => {
                    warn!(
                        coordinator = %self.config.cluster_coordinator,
                        error = %err,
                        "coordinator unreachable"
                    );
                }
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let hello = Hello {
            markets: self.config.pairs.clone(),
        };
        write_frame(&mut writer, &Frame::with_data(OP_HELLO, &hello)?).await?;

        while let Some(frame) = read_frame(&mut reader).await? {
            match frame.op.as_str() {
                OP_IMPORT => {
                    // the ack goes out even when the flush fails; the
                    // coordinator only staggers rounds, it does not retry
                    if let Err(err) = self.pipeline.import().await {
                        error!(error = %err, "coordinator-triggered import failed");
                    }
                    write_frame(&mut writer, &Frame::bare(OP_IMPORT)).await?;
                }
                OP_REQUEST_PENDING_BARS => {
                    let request: PendingBarsRequest = match frame.parse_data() {
                        Ok(request) => request,
                        Err(err) => {
                            warn!(error = %err, "bad pending bars request");
                            continue;
                        }
                    };
                    debug!(
                        request_id = %request.pending_bars_request_id,
                        markets = request.markets.len(),
                        "answering pending bars request"
                    );

                    let results = self
                        .pipeline
                        .aggregator()
                        .lock()
                        .await
                        .pending_bars(&request.markets, request.from, request.to);
                    let response = PendingBarsResponse {
                        pending_bars_request_id: request.pending_bars_request_id,
                        results,
                    };
                    write_frame(
                        &mut writer,
                        &Frame::with_data(OP_REQUEST_PENDING_BARS, &response)?,
                    )
                    .await?;
                }
                other => warn!(op = %other, "unknown op from coordinator"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;
    use crate::models::{Side, Trade};
    use crate::services::aggregator::BarAggregator;
    use crate::services::connections::LoggingCrossoverHook;
    use crate::services::persistence::Persistence;
    use tempfile::TempDir;
    use tokio::io::duplex;
    use tokio::sync::Mutex;

    fn trade(timestamp: i64, price: f64) -> Trade {
        Trade {
            exchange: "BINANCE".to_string(),
            pair: "BTCUSDT".to_string(),
            price,
            size: 1.0,
            side: Side::Buy,
            timestamp,
            liquidation: false,
            count: None,
        }
    }

    async fn collector(dir: &TempDir) -> (CollectorNode, Arc<Persistence>) {
        let config = Arc::new(Config {
            database_path: dir.path().join("test.db"),
            timeframe: 60_000,
            resample_to: vec![180_000],
            pairs: vec!["BINANCE:BTCUSDT".to_string()],
            role: NodeRole::Collector,
            ..Config::default()
        });
        let persistence = Arc::new(Persistence::try_connect(config.clone()).await.unwrap());
        persistence.ensure_retention_policies().await.unwrap();
        let aggregator = Arc::new(Mutex::new(BarAggregator::new(
            config.timeframe,
            Arc::new(LoggingCrossoverHook),
        )));
        let pipeline = Arc::new(FlushPipeline::new(
            aggregator,
            persistence.clone(),
            config.clone(),
        ));
        (CollectorNode::new(config, pipeline), persistence)
    }

    #[tokio::test]
    async fn announces_markets_then_answers_pending_bars() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _persistence) = collector(&dir).await;
        node.pipeline
            .aggregator()
            .lock()
            .await
            .process(&[trade(60_005, 100.0)]);

        let (collector_side, coordinator_side) = duplex(4096);
        let serving = tokio::spawn(async move { node.serve(collector_side).await });

        let (read_half, mut writer) = tokio::io::split(coordinator_side);
        let mut reader = BufReader::new(read_half);

        let hello_frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(hello_frame.op, OP_HELLO);
        let hello: Hello = hello_frame.parse_data().unwrap();
        assert_eq!(hello.markets, vec!["BINANCE:BTCUSDT".to_string()]);

        let request = PendingBarsRequest {
            pending_bars_request_id: "req-1".to_string(),
            markets: vec!["BINANCE:BTCUSDT".to_string()],
            from: 0,
            to: 120_000,
        };
        write_frame(
            &mut writer,
            &Frame::with_data(OP_REQUEST_PENDING_BARS, &request).unwrap(),
        )
        .await
        .unwrap();

        let response_frame = read_frame(&mut reader).await.unwrap().unwrap();
        let response: PendingBarsResponse = response_frame.parse_data().unwrap();
        assert_eq!(response.pending_bars_request_id, "req-1");
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].time, 60_000);

        drop(writer);
        drop(reader);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn import_flushes_and_acks() {
        let dir = tempfile::tempdir().unwrap();
        let (node, persistence) = collector(&dir).await;
        node.pipeline
            .aggregator()
            .lock()
            .await
            .process(&[trade(60_005, 100.0)]);

        let (collector_side, coordinator_side) = duplex(4096);
        let serving = tokio::spawn(async move { node.serve(collector_side).await });

        let (read_half, mut writer) = tokio::io::split(coordinator_side);
        let mut reader = BufReader::new(read_half);
        let _hello = read_frame(&mut reader).await.unwrap().unwrap();

        write_frame(&mut writer, &Frame::bare(OP_IMPORT)).await.unwrap();
        let ack = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(ack.op, OP_IMPORT);

        assert_eq!(persistence.measurement_row_count(60_000).await.unwrap(), 1);

        drop(writer);
        drop(reader);
        serving.await.unwrap().unwrap();
    }
}
