//! Retried gateway to the SQLite time-series store.
//!
//! One table per configured timeframe (`trades_<literal>`), written with
//! `INSERT OR REPLACE` so re-imports of the same range are idempotent
//! overwrites. Retention policies are provisioned per timeframe and
//! enforced by a periodic sweep; orphaned policies are only warned about
//! because cooperating nodes may still reference them.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::timeframe::{measurement_name, retention_policy_name, timeframe_literal};
use crate::models::Bar;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Mutation event produced by the external alerting subsystem, persisted
/// into the `alerts` measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChange {
    pub market: String,
    pub price: f64,
    pub user: String,
    pub kind: String,
    pub previous_price: Option<f64>,
    /// ms epoch
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct Persistence {
    pool: SqlitePool,
    config: Arc<Config>,
}

impl Persistence {
    /// Connect to the store, retrying indefinitely: without a store the
    /// process cannot make progress.
    pub async fn connect(config: Arc<Config>) -> Self {
        loop {
            match Self::try_connect(config.clone()).await {
                Ok(persistence) => {
                    info!(path = ?config.database_path, "store connected");
                    return persistence;
                }
                Err(err) => {
                    error!(error = %err, "store connection failed, retrying in 1s");
                    sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    pub async fn try_connect(config: Arc<Config>) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePool::connect_with(options).await?;

        let persistence = Self { pool, config };
        persistence.initialize_schema().await?;
        Ok(persistence)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retention_policies (
                name TEXT PRIMARY KEY,
                timeframe INTEGER NOT NULL,
                duration INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                market TEXT NOT NULL,
                time INTEGER NOT NULL,
                price REAL NOT NULL,
                user TEXT NOT NULL,
                kind TEXT NOT NULL,
                previous_price REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Provision one retention policy (and its measurement table) per
    /// configured timeframe. Policies no longer in the hierarchy are
    /// warned about but never dropped.
    pub async fn ensure_retention_policies(&self) -> Result<()> {
        let existing: Vec<(String,)> = sqlx::query_as("SELECT name FROM retention_policies")
            .fetch_all(&self.pool)
            .await?;
        let mut orphaned: HashSet<String> = existing.into_iter().map(|row| row.0).collect();

        for timeframe in self.config.timeframes() {
            let name = retention_policy_name(&self.config.retention_prefix, timeframe);
            let duration = timeframe * self.config.retention_per_timeframe;

            self.create_measurement_table(timeframe).await?;

            if !orphaned.remove(&name) {
                info!(
                    policy = %name,
                    duration = %timeframe_literal(duration),
                    "creating retention policy"
                );
            }

            sqlx::query(
                "INSERT OR REPLACE INTO retention_policies (name, timeframe, duration) VALUES (?, ?, ?)",
            )
            .bind(&name)
            .bind(timeframe)
            .bind(duration)
            .execute(&self.pool)
            .await?;
        }

        for name in orphaned {
            if name.starts_with(&self.config.retention_prefix) {
                warn!(policy = %name, "unused retention policy?");
            }
        }

        Ok(())
    }

    async fn create_measurement_table(&self, timeframe: i64) -> Result<()> {
        let table = measurement_name(timeframe);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                market TEXT NOT NULL,
                time INTEGER NOT NULL,
                open REAL,
                high REAL,
                low REAL,
                close REAL,
                vbuy REAL NOT NULL DEFAULT 0,
                vsell REAL NOT NULL DEFAULT 0,
                cbuy INTEGER NOT NULL DEFAULT 0,
                csell INTEGER NOT NULL DEFAULT 0,
                lbuy REAL NOT NULL DEFAULT 0,
                lsell REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (market, time)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_time ON {table} (time)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write bars into the measurement for `timeframe`, retrying transient
    /// failures. Exhausting retries surfaces a fatal error tagged with the
    /// measurement and time span; no points are dropped silently.
    pub async fn write_points(&self, bars: &[Bar], timeframe: i64) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }

        let measurement = measurement_name(timeframe);
        let from = bars.first().map(|bar| bar.time).unwrap_or_default();
        let to = bars.last().map(|bar| bar.time).unwrap_or_default();

        with_retry(
            "write points",
            || format!("{measurement}, {from} to {to}"),
            || Box::pin(self.insert_bars(&measurement, bars)),
        )
        .await
    }

    async fn insert_bars(&self, table: &str, bars: &[Bar]) -> Result<()> {
        let mut transaction = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT OR REPLACE INTO {table}
                (market, time, open, high, low, close, vbuy, vsell, cbuy, csell, lbuy, lsell)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        );

        for bar in bars {
            sqlx::query(&sql)
                .bind(&bar.market)
                .bind(bar.time)
                .bind(bar.open)
                .bind(bar.high)
                .bind(bar.low)
                .bind(bar.close)
                .bind(bar.vbuy)
                .bind(bar.vsell)
                .bind(bar.cbuy)
                .bind(bar.csell)
                .bind(bar.lbuy)
                .bind(bar.lsell)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    /// Execute a statement with the same bounded retry policy as
    /// `write_points`; failures carry the raw query text for diagnostics.
    pub async fn execute_query(&self, query: &str) -> Result<u64> {
        with_retry(
            "execute query",
            || query.to_string(),
            || {
                Box::pin(async move {
                    let result = sqlx::query(query).execute(&self.pool).await?;
                    Ok(result.rows_affected())
                })
            },
        )
        .await
    }

    /// Ranged, market-filtered select over one measurement, time-ascending.
    /// Retried like writes; the resampler depends on this read succeeding
    /// after the pending bars were already drained.
    pub async fn fetch_bars(
        &self,
        timeframe: i64,
        from: i64,
        to: i64,
        markets: &[String],
    ) -> Result<Vec<Bar>> {
        let table = measurement_name(timeframe);

        with_retry(
            "fetch bars",
            || format!("{table}, {from} to {to}"),
            || Box::pin(self.select_bars(&table, from, to, markets)),
        )
        .await
    }

    async fn select_bars(
        &self,
        table: &str,
        from: i64,
        to: i64,
        markets: &[String],
    ) -> Result<Vec<Bar>> {
        let mut sql = format!(
            "SELECT market, time, open, high, low, close, vbuy, vsell, cbuy, csell, lbuy, lsell \
             FROM {table} WHERE time >= ? AND time < ?"
        );
        if !markets.is_empty() {
            let placeholders = vec!["?"; markets.len()].join(", ");
            sql.push_str(&format!(" AND market IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY time ASC, market ASC");

        let mut query = sqlx::query(&sql).bind(from).bind(to);
        for market in markets {
            query = query.bind(market);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_bar).collect()
    }

    /// Most recent persisted base-timeframe bar per configured market, for
    /// seeding pending bars after a restart. Bars older than one resample
    /// interval are too stale to resume and are skipped.
    pub async fn previous_bars(&self, now: i64) -> Result<Vec<Bar>> {
        if self.config.pairs.is_empty() {
            return Ok(Vec::new());
        }

        let table = measurement_name(self.config.timeframe);
        let placeholders = vec!["?"; self.config.pairs.len()].join(", ");
        let sql = format!(
            "SELECT t.market, t.time, t.open, t.high, t.low, t.close, \
                    t.vbuy, t.vsell, t.cbuy, t.csell, t.lbuy, t.lsell \
             FROM {table} t \
             JOIN (SELECT market, MAX(time) AS time FROM {table} \
                   WHERE market IN ({placeholders}) GROUP BY market) last \
               ON t.market = last.market AND t.time = last.time"
        );

        let mut query = sqlx::query(&sql);
        for market in &self.config.pairs {
            query = query.bind(market);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut bars = Vec::new();
        for row in &rows {
            let bar = row_to_bar(row)?;
            if now - bar.time > self.config.resample_interval {
                debug!(
                    market = %bar.market,
                    age_ms = now - bar.time,
                    "last persisted bar too old to resume"
                );
                continue;
            }
            bars.push(bar);
        }
        Ok(bars)
    }

    /// Delete rows older than each policy's duration. The SQLite
    /// counterpart of store-side retention expiry.
    pub async fn sweep_retention(&self, now: i64) -> Result<()> {
        for timeframe in self.config.timeframes() {
            let table = measurement_name(timeframe);
            let horizon = now - timeframe * self.config.retention_per_timeframe;
            let deleted = self
                .execute_query(&format!("DELETE FROM {table} WHERE time < {horizon}"))
                .await?;
            if deleted > 0 {
                debug!(measurement = %table, deleted, "retention sweep");
            }
        }
        Ok(())
    }

    /// Alert-changed hook sink.
    pub async fn write_alert_change(&self, change: &AlertChange) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (market, time, price, user, kind, previous_price) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&change.market)
        .bind(change.timestamp)
        .bind(change.price)
        .bind(&change.user)
        .bind(&change.kind)
        .bind(change.previous_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn measurement_row_count(&self, timeframe: i64) -> Result<i64> {
        let table = measurement_name(timeframe);
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .next()
            .unwrap_or((0,));
        Ok(row.0)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn row_to_bar(row: &SqliteRow) -> Result<Bar> {
    Ok(Bar {
        market: row.try_get("market")?,
        time: row.try_get("time")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        vbuy: row.try_get("vbuy")?,
        vsell: row.try_get("vsell")?,
        cbuy: row.try_get("cbuy")?,
        csell: row.try_get("csell")?,
        lbuy: row.try_get("lbuy")?,
        lsell: row.try_get("lsell")?,
    })
}

type RetryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Bounded retry loop: fixed backoff, attempt-numbered logging, fatal error
/// with the caller's context after the last attempt.
async fn with_retry<'a, T>(
    label: &str,
    context: impl Fn() -> String,
    mut op: impl FnMut() -> RetryFuture<'a, T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "{label} succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                attempt += 1;
                error!(attempt, error = %err, "{label} failed");

                if attempt >= MAX_ATTEMPTS {
                    return Err(AppError::Database(format!(
                        "too many attempts at {label} ({}) -> abort",
                        context()
                    )));
                }

                sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Arc<Config> {
        Arc::new(Config {
            database_path: dir.path().join("test.db"),
            timeframe: 60_000,
            resample_to: vec![180_000, 900_000],
            pairs: vec!["BINANCE:BTCUSDT".to_string()],
            ..Config::default()
        })
    }

    fn bar(market: &str, time: i64, close: f64) -> Bar {
        Bar {
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            vbuy: 10.0,
            cbuy: 1,
            ..Bar::new(market, time)
        }
    }

    #[tokio::test]
    async fn provisions_retention_policies_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();
        persistence.ensure_retention_policies().await.unwrap();

        let names: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM retention_policies ORDER BY timeframe")
                .fetch_all(&persistence.pool)
                .await
                .unwrap();
        let names: Vec<String> = names.into_iter().map(|row| row.0).collect();
        assert_eq!(names, vec!["aggr_1m", "aggr_3m", "aggr_15m"]);

        // measurement tables exist and are writable
        assert_eq!(persistence.measurement_row_count(60_000).await.unwrap(), 0);
        assert_eq!(persistence.measurement_row_count(900_000).await.unwrap(), 0);

        // idempotent
        persistence.ensure_retention_policies().await.unwrap();
    }

    #[tokio::test]
    async fn orphaned_policies_survive() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();
        sqlx::query("INSERT INTO retention_policies (name, timeframe, duration) VALUES ('aggr_30s', 30000, 1000)")
            .execute(&persistence.pool)
            .await
            .unwrap();

        persistence.ensure_retention_policies().await.unwrap();

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM retention_policies WHERE name = 'aggr_30s'")
                .fetch_one(&persistence.pool)
                .await
                .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn write_and_fetch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();
        persistence.ensure_retention_policies().await.unwrap();

        let mut empty = Bar::new("BINANCE:BTCUSDT", 120_000);
        empty.lsell = 50.0;
        let bars = vec![
            bar("BINANCE:BTCUSDT", 60_000, 100.0),
            bar("BINANCE:ETHUSDT", 60_000, 10.0),
            empty,
        ];
        persistence.write_points(&bars, 60_000).await.unwrap();

        let markets = vec!["BINANCE:BTCUSDT".to_string()];
        let fetched = persistence
            .fetch_bars(60_000, 0, 180_000, &markets)
            .await
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].time, 60_000);
        assert_eq!(fetched[0].close, Some(100.0));
        assert_eq!(fetched[1].open, None);
        assert_eq!(fetched[1].lsell, 50.0);
    }

    #[tokio::test]
    async fn rewrite_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();
        persistence.ensure_retention_policies().await.unwrap();

        persistence
            .write_points(&[bar("BINANCE:BTCUSDT", 60_000, 100.0)], 60_000)
            .await
            .unwrap();
        persistence
            .write_points(&[bar("BINANCE:BTCUSDT", 60_000, 105.0)], 60_000)
            .await
            .unwrap();

        assert_eq!(persistence.measurement_row_count(60_000).await.unwrap(), 1);
        let fetched = persistence.fetch_bars(60_000, 0, 120_000, &[]).await.unwrap();
        assert_eq!(fetched[0].close, Some(105.0));
    }

    #[tokio::test]
    async fn previous_bars_skips_stale_rows() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();
        persistence.ensure_retention_policies().await.unwrap();

        let now = 10_000_000;
        persistence
            .write_points(
                &[
                    bar("BINANCE:BTCUSDT", now - 120_000, 99.0),
                    bar("BINANCE:BTCUSDT", now - 30_000, 100.0),
                ],
                60_000,
            )
            .await
            .unwrap();

        let recovered = persistence.previous_bars(now).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].time, now - 30_000);

        // everything stale -> nothing to resume
        let recovered = persistence.previous_bars(now + 600_000).await.unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn retention_sweep_deletes_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            retention_per_timeframe: 2,
            ..(*test_config(&dir)).clone()
        });
        let persistence = Persistence::try_connect(config).await.unwrap();
        persistence.ensure_retention_policies().await.unwrap();

        // 1m policy keeps 2 minutes of data
        let now = 1_000_000;
        persistence
            .write_points(
                &[
                    bar("BINANCE:BTCUSDT", now - 300_000, 90.0),
                    bar("BINANCE:BTCUSDT", now - 60_000, 100.0),
                ],
                60_000,
            )
            .await
            .unwrap();

        persistence.sweep_retention(now).await.unwrap();

        let remaining = persistence.fetch_bars(60_000, 0, now, &[]).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].time, now - 60_000);
    }

    #[tokio::test]
    async fn alert_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();

        persistence
            .write_alert_change(&AlertChange {
                market: "BINANCE:BTCUSDT".to_string(),
                price: 50_000.0,
                user: "u1".to_string(),
                kind: "triggered".to_string(),
                previous_price: Some(49_000.0),
                timestamp: 1_700_000_000_000,
            })
            .await
            .unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alerts")
            .fetch_one(&persistence.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn fetch_from_missing_measurement_retries_then_aborts() {
        let dir = tempfile::tempdir().unwrap();
        // schema not provisioned: every read attempt fails, the retry loop
        // must exhaust and surface the measurement and window
        let persistence = Persistence::try_connect(test_config(&dir)).await.unwrap();

        let err = persistence
            .fetch_bars(180_000, 0, 360_000, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("trades_3m, 0 to 360000"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_fifth_attempt() {
        let failures = AtomicU32::new(4);
        let calls = AtomicU32::new(0);

        let result = with_retry(
            "test op",
            || "ctx".to_string(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                let fail = failures.load(Ordering::SeqCst) > 0;
                if fail {
                    failures.fetch_sub(1, Ordering::SeqCst);
                }
                Box::pin(async move {
                    if fail {
                        Err(AppError::Database("transient".into()))
                    } else {
                        Ok(42)
                    }
                })
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_aborts_after_five_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(
            "test op",
            || "trades_1m, 0 to 60000".to_string(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(AppError::Database("down".into())) })
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("trades_1m, 0 to 60000"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
