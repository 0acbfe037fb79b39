//! Coordinator side of the cluster bridge.
//!
//! Accepts collector connections, tracks which markets each collector owns,
//! fans pending-bar requests out to the owning collectors and periodically
//! broadcasts `import` to force a synchronized flush. Every outstanding
//! request is bounded by a timeout and degrades to an empty result so a
//! dead collector can never stall a query or a flush round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::protocol::{
    read_frame, write_frame, Frame, Hello, PendingBarsRequest, PendingBarsResponse, OP_HELLO,
    OP_IMPORT, OP_REQUEST_PENDING_BARS,
};
use crate::config::Config;
use crate::error::Result;
use crate::models::Bar;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

struct CollectorPeer {
    markets: Vec<String>,
    sender: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Shared {
    collectors: Mutex<HashMap<u64, CollectorPeer>>,
    pending_requests: Mutex<HashMap<String, oneshot::Sender<Vec<Bar>>>>,
    import_waiter: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
    config: Arc<Config>,
    next_peer_id: Arc<AtomicU64>,
}

impl Coordinator {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            config,
            next_peer_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the configured address, start the periodic import broadcast and
    /// accept collectors until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.cluster_bind).await?;
        info!(bind = %self.config.cluster_bind, "coordinator listening");

        let broadcaster = self.clone();
        tokio::spawn(async move { broadcaster.import_loop().await });

        self.listen(listener).await
    }

    pub async fn listen(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "collector connected");
            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(err) = coordinator.handle_collector(stream).await {
                    warn!(%addr, error = %err, "collector connection ended");
                }
            });
        }
    }

    async fn handle_collector(&self, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (sender, receiver) = mpsc::channel::<Frame>(32);
        tokio::spawn(write_loop(write_half, receiver));

        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.shared.collectors.lock().await.insert(
            peer_id,
            CollectorPeer {
                markets: Vec::new(),
                sender,
            },
        );

        let result = async {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => self.dispatch(peer_id, frame).await,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(peer_id, error = %err, "dropping malformed frame");
                    }
                }
            }
            Ok(())
        }
        .await;

        self.shared.collectors.lock().await.remove(&peer_id);
        info!(peer_id, "collector disconnected");
        result
    }

    async fn dispatch(&self, peer_id: u64, frame: Frame) {
        match frame.op.as_str() {
            OP_HELLO => match frame.parse_data::<Hello>() {
                Ok(hello) => {
                    info!(peer_id, markets = hello.markets.len(), "collector announced");
                    if let Some(peer) = self.shared.collectors.lock().await.get_mut(&peer_id) {
                        peer.markets = hello.markets;
                    }
                }
                Err(err) => warn!(peer_id, error = %err, "bad hello payload"),
            },
            OP_IMPORT => {
                // flush acknowledgment: release the waiter for this round
                if let Some(waiter) = self.shared.import_waiter.lock().await.take() {
                    let _ = waiter.send(());
                }
            }
            OP_REQUEST_PENDING_BARS => match frame.parse_data::<PendingBarsResponse>() {
                Ok(response) => {
                    let waiter = self
                        .shared
                        .pending_requests
                        .lock()
                        .await
                        .remove(&response.pending_bars_request_id);
                    match waiter {
                        Some(sender) => {
                            let _ = sender.send(response.results);
                        }
                        None => error!(
                            request_id = %response.pending_bars_request_id,
                            "no waiter for pending bars response"
                        ),
                    }
                }
                Err(err) => warn!(peer_id, error = %err, "bad pending bars payload"),
            },
            other => warn!(peer_id, op = %other, "unknown op"),
        }
    }

    /// Query every collector owning any of the requested markets and return
    /// the concatenated, time-sorted pending bars.
    pub async fn request_pending_bars(
        &self,
        markets: &[String],
        from: i64,
        to: i64,
    ) -> Vec<Bar> {
        let owners: Vec<mpsc::Sender<Frame>> = {
            let collectors = self.shared.collectors.lock().await;
            collectors
                .values()
                .filter(|peer| peer.markets.iter().any(|market| markets.contains(market)))
                .map(|peer| peer.sender.clone())
                .collect()
        };

        let mut handles = Vec::with_capacity(owners.len());
        for sender in owners {
            let coordinator = self.clone();
            let markets = markets.to_vec();
            handles.push(tokio::spawn(async move {
                coordinator
                    .request_collector_pending_bars(sender, markets, from, to)
                    .await
            }));
        }

        let mut bars = Vec::new();
        for handle in handles {
            if let Ok(collected) = handle.await {
                bars.extend(collected);
            }
        }
        bars.sort_by_key(|bar| bar.time);
        bars
    }

    /// Ask a single collector for its pending bars; resolves to an empty
    /// result if no response arrives within the timeout.
    async fn request_collector_pending_bars(
        &self,
        peer: mpsc::Sender<Frame>,
        markets: Vec<String>,
        from: i64,
        to: i64,
    ) -> Vec<Bar> {
        let request_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.shared
            .pending_requests
            .lock()
            .await
            .insert(request_id.clone(), sender);

        let frame = match Frame::with_data(
            OP_REQUEST_PENDING_BARS,
            &PendingBarsRequest {
                pending_bars_request_id: request_id.clone(),
                markets,
                from,
                to,
            },
        ) {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "failed to encode pending bars request");
                self.shared.pending_requests.lock().await.remove(&request_id);
                return Vec::new();
            }
        };

        if peer.send(frame).await.is_err() {
            self.shared.pending_requests.lock().await.remove(&request_id);
            return Vec::new();
        }

        match timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(bars)) => bars,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                error!(request_id = %request_id, "pending bars request timed out");
                self.shared.pending_requests.lock().await.remove(&request_id);
                Vec::new()
            }
        }
    }

    async fn import_loop(&self) {
        let interval = Duration::from_millis(self.config.resample_interval as u64);
        loop {
            sleep(interval).await;
            self.import_collectors().await;
        }
    }

    /// Broadcast `import` to every collector, waiting for each
    /// acknowledgment (bounded) before triggering the next one so write
    /// load stays staggered across collectors.
    pub async fn import_collectors(&self) {
        let peers: Vec<mpsc::Sender<Frame>> = {
            let collectors = self.shared.collectors.lock().await;
            collectors.values().map(|peer| peer.sender.clone()).collect()
        };

        for peer in peers {
            let (sender, receiver) = oneshot::channel();
            *self.shared.import_waiter.lock().await = Some(sender);

            if peer.send(Frame::bare(OP_IMPORT)).await.is_err() {
                self.shared.import_waiter.lock().await.take();
                continue;
            }

            match timeout(REQUEST_TIMEOUT, receiver).await {
                Ok(_) => {}
                Err(_) => {
                    error!("collector import acknowledgment timed out");
                    self.shared.import_waiter.lock().await.take();
                }
            }
        }
    }

    pub async fn collector_count(&self) -> usize {
        self.shared.collectors.lock().await.len()
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut receiver: mpsc::Receiver<Frame>) {
    while let Some(frame) = receiver.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            warn!(error = %err, "collector write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bar;
    use tokio::io::BufReader as TokioBufReader;
    use tokio::net::TcpStream;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            cluster_bind: "127.0.0.1:0".to_string(),
            ..Config::default()
        })
    }

    async fn bound_coordinator() -> (Coordinator, std::net::SocketAddr) {
        let coordinator = Coordinator::new(test_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepting = coordinator.clone();
        tokio::spawn(async move {
            let _ = accepting.listen(listener).await;
        });
        (coordinator, addr)
    }

    async fn announced_collector(
        addr: std::net::SocketAddr,
        markets: &[&str],
    ) -> (TokioBufReader<tokio::net::tcp::OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let hello = Hello {
            markets: markets.iter().map(|m| m.to_string()).collect(),
        };
        write_frame(&mut write_half, &Frame::with_data(OP_HELLO, &hello).unwrap())
            .await
            .unwrap();
        (TokioBufReader::new(read_half), write_half)
    }

    async fn wait_for_collectors(coordinator: &Coordinator, count: usize) {
        for _ in 0..100 {
            if coordinator.collector_count().await == count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("collectors never registered");
    }

    #[tokio::test]
    async fn pending_bars_roundtrip_with_owning_collector() {
        let (coordinator, addr) = bound_coordinator().await;
        let (mut reader, mut writer) =
            announced_collector(addr, &["BINANCE:BTCUSDT"]).await;
        wait_for_collectors(&coordinator, 1).await;

        // collector side: answer the one request we expect
        let responder = tokio::spawn(async move {
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(frame.op, OP_REQUEST_PENDING_BARS);
            let request: PendingBarsRequest = frame.parse_data().unwrap();

            let mut bar = Bar::new("BINANCE:BTCUSDT", 60_000);
            bar.close = Some(100.0);
            let response = PendingBarsResponse {
                pending_bars_request_id: request.pending_bars_request_id,
                results: vec![bar],
            };
            write_frame(
                &mut writer,
                &Frame::with_data(OP_REQUEST_PENDING_BARS, &response).unwrap(),
            )
            .await
            .unwrap();
            (reader, writer)
        });

        let markets = vec!["BINANCE:BTCUSDT".to_string()];
        let bars = coordinator.request_pending_bars(&markets, 0, 120_000).await;
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].time, 60_000);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn non_owning_collector_is_not_queried() {
        let (coordinator, addr) = bound_coordinator().await;
        let (_reader, _writer) = announced_collector(addr, &["BITMEX:XBTUSD"]).await;
        wait_for_collectors(&coordinator, 1).await;

        let markets = vec!["BINANCE:BTCUSDT".to_string()];
        let bars = coordinator.request_pending_bars(&markets, 0, 120_000).await;
        assert!(bars.is_empty());
        assert!(coordinator.shared.pending_requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn silent_collector_resolves_empty_after_timeout() {
        let (coordinator, addr) = bound_coordinator().await;
        // announce but never answer
        let (_reader, _writer) = announced_collector(addr, &["BINANCE:BTCUSDT"]).await;
        wait_for_collectors(&coordinator, 1).await;

        let markets = vec!["BINANCE:BTCUSDT".to_string()];
        let started = tokio::time::Instant::now();
        let bars = coordinator.request_pending_bars(&markets, 0, 120_000).await;
        assert!(bars.is_empty());
        assert!(started.elapsed() >= REQUEST_TIMEOUT);
        // the correlation entry was discarded with the timeout
        assert!(coordinator.shared.pending_requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let (coordinator, addr) = bound_coordinator().await;
        let (_reader, mut writer) = announced_collector(addr, &["BINANCE:BTCUSDT"]).await;
        wait_for_collectors(&coordinator, 1).await;

        let response = PendingBarsResponse {
            pending_bars_request_id: "never-issued".to_string(),
            results: vec![Bar::new("BINANCE:BTCUSDT", 0)],
        };
        write_frame(
            &mut writer,
            &Frame::with_data(OP_REQUEST_PENDING_BARS, &response).unwrap(),
        )
        .await
        .unwrap();

        // coordinator must stay alive and registered
        sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.collector_count().await, 1);
    }

    #[tokio::test]
    async fn import_broadcast_waits_for_ack() {
        let (coordinator, addr) = bound_coordinator().await;
        let (mut reader, mut writer) = announced_collector(addr, &["BINANCE:BTCUSDT"]).await;
        wait_for_collectors(&coordinator, 1).await;

        let responder = tokio::spawn(async move {
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(frame.op, OP_IMPORT);
            write_frame(&mut writer, &Frame::bare(OP_IMPORT)).await.unwrap();
            (reader, writer)
        });

        coordinator.import_collectors().await;
        responder.await.unwrap();
        assert!(coordinator.shared.import_waiter.lock().await.is_none());
    }
}
