//! Bridge configuration.
//!
//! Layering, lowest priority first:
//! - built-in defaults
//! - JSON file (`SPECTRE_BRIDGE_CONFIG`, else `bridge_config.json` if present)
//! - `SPECTRE_*` environment variables
//! - command-line flags (applied by the binary)
//!
//! [`BridgeConfig::validate`] runs last and rejects unusable combinations.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::blockchain::RetryPolicy;
use crate::difficulty::Difficulty;
use crate::extranonce::MAX_EXTRANONCE_SIZE;
use crate::vardiff::VarDiffConfig;

pub const DEFAULT_CONFIG_FILE: &str = "bridge_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    Env { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Stratum listen address (`:5555` binds all interfaces).
    pub stratum_port: String,
    /// spectred RPC address.
    pub rpc_server: String,
    /// Prometheus exporter address; empty disables it.
    pub prom_port: String,
    /// Optional `/readyz` address; empty disables it.
    pub health_check_port: String,

    pub print_stats: bool,
    pub stats_interval_secs: u64,

    /// Force a template refresh when no new tip arrives within this period.
    pub block_wait_ms: u64,
    pub min_share_diff: u64,
    pub max_share_diff: u64,
    pub var_diff: bool,
    pub shares_per_min: u32,
    pub var_diff_stats: bool,
    pub extranonce_size: u8,

    pub vardiff_tick_secs: u64,
    pub vardiff_window_secs: u64,
    pub vardiff_tolerance: f64,
    pub vardiff_max_step: f64,
    pub vardiff_min_samples: usize,

    /// Number of previous jobs whose shares are still accepted.
    pub stale_window: usize,
    /// Per-session duplicate-detection capacity.
    pub recent_shares: usize,

    /// Coinbase address for templates; falls back to `default_wallet`.
    pub mining_address: String,
    /// Replaces banned wallets on authorize.
    pub default_wallet: String,
    pub banned_wallets_path: String,

    pub rpc_timeout_ms: u64,
    pub rpc_retries: u32,
    pub tip_poll_ms: u64,
    /// Refuse block submissions when the newest template is older than this.
    pub template_max_age_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stratum_port: ":5555".to_string(),
            rpc_server: "localhost:18110".to_string(),
            prom_port: ":2114".to_string(),
            health_check_port: String::new(),
            print_stats: true,
            stats_interval_secs: 10,
            block_wait_ms: 3_000,
            min_share_diff: 64,
            max_share_diff: 1 << 40,
            var_diff: true,
            shares_per_min: 20,
            var_diff_stats: false,
            extranonce_size: 0,
            vardiff_tick_secs: 10,
            vardiff_window_secs: 120,
            vardiff_tolerance: 0.25,
            vardiff_max_step: 4.0,
            vardiff_min_samples: 6,
            stale_window: 4,
            recent_shares: 1024,
            mining_address: String::new(),
            default_wallet: String::new(),
            banned_wallets_path: "banned_wallets.json".to_string(),
            rpc_timeout_ms: 5_000,
            rpc_retries: 3,
            tip_poll_ms: 500,
            template_max_age_secs: 60,
            idle_timeout_secs: 300,
        }
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: raw,
        }),
    }
}

/// `:5555` binds every interface.
pub fn normalize_listen(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

impl BridgeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the config file, then the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("SPECTRE_BRIDGE_CONFIG").ok().map(PathBuf::from);
        let mut cfg = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Apply `SPECTRE_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SPECTRE_STRATUM") {
            self.stratum_port = v;
        }
        if let Some(v) = lookup("SPECTRE_RPC") {
            self.rpc_server = v;
        }
        if let Some(v) = lookup("SPECTRE_PROM") {
            self.prom_port = v;
        }
        if let Some(v) = lookup("SPECTRE_HCP") {
            self.health_check_port = v;
        }
        if let Some(v) = lookup("SPECTRE_MINING_ADDRESS") {
            self.mining_address = v;
        }
        if let Some(v) = lookup("SPECTRE_DEFAULT_WALLET") {
            self.default_wallet = v;
        }
        if let Some(v) = lookup("SPECTRE_BANNED_WALLETS") {
            self.banned_wallets_path = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_STATS")? {
            self.print_stats = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_BLOCKWAIT_MS")? {
            self.block_wait_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_MINDIFF")? {
            self.min_share_diff = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_MAXDIFF")? {
            self.max_share_diff = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_VARDIFF")? {
            self.var_diff = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_SHARESPERMIN")? {
            self.shares_per_min = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_VARDIFFSTATS")? {
            self.var_diff_stats = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_EXTRANONCE")? {
            self.extranonce_size = v;
        }
        if let Some(v) = env_parse(&lookup, "SPECTRE_STALE_WINDOW")? {
            self.stale_window = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if normalize_listen(&self.stratum_port).parse::<SocketAddr>().is_err() {
            return invalid(format!("stratum_port '{}' is not a socket address", self.stratum_port));
        }
        for (name, addr) in [("prom_port", &self.prom_port), ("health_check_port", &self.health_check_port)] {
            if !addr.is_empty() && normalize_listen(addr).parse::<SocketAddr>().is_err() {
                return invalid(format!("{} '{}' is not a socket address", name, addr));
            }
        }
        if self.rpc_server.trim().is_empty() {
            return invalid("rpc_server is empty".into());
        }
        if self.extranonce_size > MAX_EXTRANONCE_SIZE {
            return invalid(format!(
                "extranonce_size {} exceeds {}",
                self.extranonce_size, MAX_EXTRANONCE_SIZE
            ));
        }
        if self.min_share_diff == 0 {
            return invalid("min_share_diff must be at least 1".into());
        }
        if self.max_share_diff < self.min_share_diff {
            return invalid("max_share_diff is below min_share_diff".into());
        }
        if self.shares_per_min == 0 {
            return invalid("shares_per_min must be positive".into());
        }
        if self.block_wait_ms == 0 {
            return invalid("block_wait_ms must be positive".into());
        }
        if !(self.vardiff_tolerance.is_finite() && self.vardiff_tolerance >= 0.0) {
            return invalid("vardiff_tolerance must be a non-negative number".into());
        }
        if !(self.vardiff_max_step.is_finite() && self.vardiff_max_step >= 1.0) {
            return invalid("vardiff_max_step must be at least 1".into());
        }
        if self.vardiff_tick_secs == 0 || self.vardiff_window_secs == 0 {
            return invalid("vardiff tick and window must be positive".into());
        }
        if self.payout_address().is_empty() {
            return invalid("mining_address or default_wallet must be set".into());
        }
        Ok(())
    }

    /// Address templates are built for.
    pub fn payout_address(&self) -> &str {
        if self.mining_address.is_empty() {
            &self.default_wallet
        } else {
            &self.mining_address
        }
    }

    pub fn stratum_listen(&self) -> String {
        normalize_listen(&self.stratum_port)
    }

    pub fn block_wait(&self) -> Duration {
        Duration::from_millis(self.block_wait_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn template_max_age(&self) -> Duration {
        Duration::from_secs(self.template_max_age_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.rpc_retries.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn vardiff(&self) -> VarDiffConfig {
        VarDiffConfig {
            enabled: self.var_diff,
            shares_per_minute: self.shares_per_min as f64,
            tick: Duration::from_secs(self.vardiff_tick_secs),
            window: Duration::from_secs(self.vardiff_window_secs),
            tolerance: self.vardiff_tolerance,
            max_step: self.vardiff_max_step,
            min_samples: self.vardiff_min_samples,
            min_difficulty: Difficulty::new(self.min_share_diff),
            max_difficulty: Difficulty::new(self.max_share_diff),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> BridgeConfig {
        BridgeConfig {
            default_wallet: "spectre:qqdefault".into(),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn defaults_need_only_a_wallet() {
        assert!(BridgeConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
        assert_eq!(valid().payout_address(), "spectre:qqdefault");
        assert_eq!(valid().stratum_listen(), "0.0.0.0:5555");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: BridgeConfig =
            serde_json::from_str(r#"{"stratum_port": ":6000", "extranonce_size": 2}"#).unwrap();
        assert_eq!(cfg.stratum_port, ":6000");
        assert_eq!(cfg.extranonce_size, 2);
        assert_eq!(cfg.shares_per_min, 20);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("SPECTRE_MINDIFF", "128"),
            ("SPECTRE_VARDIFF", "false"),
            ("SPECTRE_EXTRANONCE", "1"),
            ("SPECTRE_RPC", "node:18110"),
        ]
        .into_iter()
        .collect();
        let mut cfg = valid();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.min_share_diff, 128);
        assert!(!cfg.var_diff);
        assert_eq!(cfg.extranonce_size, 1);
        assert_eq!(cfg.rpc_server, "node:18110");
        assert_eq!(cfg.vardiff().min_difficulty, Difficulty::new(128));
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut cfg = valid();
        let err = cfg
            .apply_env(|k| (k == "SPECTRE_MINDIFF").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            BridgeConfig { extranonce_size: 5, ..valid() },
            BridgeConfig { min_share_diff: 0, ..valid() },
            BridgeConfig { max_share_diff: 10, min_share_diff: 100, ..valid() },
            BridgeConfig { shares_per_min: 0, ..valid() },
            BridgeConfig { vardiff_max_step: 0.5, ..valid() },
            BridgeConfig { stratum_port: "nowhere".into(), ..valid() },
            BridgeConfig { prom_port: "bad".into(), ..valid() },
        ];
        for cfg in cases {
            assert!(cfg.validate().is_err(), "{:?} should be invalid", cfg);
        }
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = BridgeConfig::from_file(Path::new("/nonexistent/bridge.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
