use std::env;
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::models::timeframe::DAY_MS;

/// What a node is responsible for.
///
/// A standalone node both collects trades and answers queries. In clustered
/// deployments collectors own the live trade streams while a single
/// coordinator answers queries and triggers synchronized flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Standalone,
    Collector,
    Coordinator,
}

impl NodeRole {
    pub fn collects(&self) -> bool {
        matches!(self, NodeRole::Standalone | NodeRole::Collector)
    }

    pub fn serves_queries(&self) -> bool {
        matches!(self, NodeRole::Standalone | NodeRole::Coordinator)
    }

    pub fn clustered(&self) -> bool {
        matches!(self, NodeRole::Collector | NodeRole::Coordinator)
    }
}

impl std::str::FromStr for NodeRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" => Ok(NodeRole::Standalone),
            "collector" => Ok(NodeRole::Collector),
            "coordinator" | "cluster" => Ok(NodeRole::Coordinator),
            other => Err(AppError::Config(format!("unknown node role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database location
    pub database_path: PathBuf,

    /// Base bar timeframe in milliseconds
    pub timeframe: i64,

    /// Higher timeframes maintained by the resampler, ascending
    pub resample_to: Vec<i64>,

    /// Retention policy name prefix (policy name = prefix + timeframe literal)
    pub retention_prefix: String,

    /// Retention duration multiplier: each timeframe keeps
    /// `timeframe * retention_per_timeframe` ms of data
    pub retention_per_timeframe: i64,

    /// Interval between pending-bar drains (ms)
    pub backup_interval: i64,

    /// Interval between resample rounds; also the freshness window for
    /// splicing pending bars into query responses (ms)
    pub resample_interval: i64,

    /// Markets this node tracks, as `EXCHANGE:pair` identifiers
    pub pairs: Vec<String>,

    /// HTTP query API port
    pub api_port: u16,

    pub role: NodeRole,

    /// Coordinator listen address (coordinator role)
    pub cluster_bind: String,

    /// Coordinator address collectors dial (collector role)
    pub cluster_coordinator: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/tradebars.db"),
            timeframe: 10_000,
            resample_to: vec![
                30_000,
                60_000,
                180_000,
                300_000,
                900_000,
                1_800_000,
                3_600_000,
                DAY_MS,
            ],
            retention_prefix: "aggr_".to_string(),
            retention_per_timeframe: 5_000,
            backup_interval: 10_000,
            resample_interval: 60_000,
            pairs: Vec::new(),
            api_port: 3000,
            role: NodeRole::Standalone,
            cluster_bind: "127.0.0.1:7901".to_string(),
            cluster_coordinator: "127.0.0.1:7901".to_string(),
        }
    }
}

impl Config {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            database_path: env_str("TRADEBARS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            timeframe: env_i64("TRADEBARS_TIMEFRAME")?.unwrap_or(defaults.timeframe),
            resample_to: env_i64_list("TRADEBARS_RESAMPLE_TO")?.unwrap_or(defaults.resample_to),
            retention_prefix: env_str("TRADEBARS_RETENTION_PREFIX")
                .unwrap_or(defaults.retention_prefix),
            retention_per_timeframe: env_i64("TRADEBARS_RETENTION_PER_TIMEFRAME")?
                .unwrap_or(defaults.retention_per_timeframe),
            backup_interval: env_i64("TRADEBARS_BACKUP_INTERVAL")?
                .unwrap_or(defaults.backup_interval),
            resample_interval: env_i64("TRADEBARS_RESAMPLE_INTERVAL")?
                .unwrap_or(defaults.resample_interval),
            pairs: env_str_list("TRADEBARS_PAIRS").unwrap_or(defaults.pairs),
            api_port: env_u16("TRADEBARS_API_PORT")?.unwrap_or(defaults.api_port),
            role: match env_str("TRADEBARS_ROLE") {
                Some(raw) => raw.parse()?,
                None => defaults.role,
            },
            cluster_bind: env_str("TRADEBARS_CLUSTER_BIND").unwrap_or(defaults.cluster_bind),
            cluster_coordinator: env_str("TRADEBARS_CLUSTER_COORDINATOR")
                .unwrap_or(defaults.cluster_coordinator),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeframe <= 0 {
            return Err(AppError::Config("timeframe must be positive".into()));
        }
        if self.backup_interval <= 0 || self.resample_interval <= 0 {
            return Err(AppError::Config("intervals must be positive".into()));
        }
        let mut previous = self.timeframe;
        for &timeframe in &self.resample_to {
            if timeframe <= previous {
                return Err(AppError::Config(format!(
                    "resample timeframes must be ascending and greater than the base timeframe (got {timeframe} after {previous})"
                )));
            }
            previous = timeframe;
        }
        Ok(())
    }

    /// Base timeframe followed by every resample target.
    pub fn timeframes(&self) -> Vec<i64> {
        let mut all = Vec::with_capacity(1 + self.resample_to.len());
        all.push(self.timeframe);
        all.extend(self.resample_to.iter().copied());
        all
    }
}

fn env_str(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_str_list(name: &str) -> Option<Vec<String>> {
    env_str(name).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn env_i64(name: &str) -> Result<Option<i64>> {
    match env_str(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{name} must be an integer (got '{raw}')"))),
        None => Ok(None),
    }
}

fn env_i64_list(name: &str) -> Result<Option<Vec<i64>>> {
    match env_str(name) {
        Some(raw) => {
            let mut values = Vec::new();
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                values.push(part.parse().map_err(|_| {
                    AppError::Config(format!("{name} must be a list of integers (got '{part}')"))
                })?);
            }
            Ok(Some(values))
        }
        None => Ok(None),
    }
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    match env_str(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{name} must be a port number (got '{raw}')"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_unordered_resample_hierarchy() {
        let config = Config {
            resample_to: vec![60_000, 30_000],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_resample_target_below_base() {
        let config = Config {
            timeframe: 60_000,
            resample_to: vec![30_000],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn role_parsing() {
        assert_eq!(
            "collector".parse::<NodeRole>().unwrap(),
            NodeRole::Collector
        );
        assert_eq!(
            "cluster".parse::<NodeRole>().unwrap(),
            NodeRole::Coordinator
        );
        assert!("proxy".parse::<NodeRole>().is_err());
    }

    #[test]
    fn timeframes_starts_with_base() {
        let config = Config::default();
        let timeframes = config.timeframes();
        assert_eq!(timeframes[0], config.timeframe);
        assert_eq!(timeframes.len(), 1 + config.resample_to.len());
    }
}
