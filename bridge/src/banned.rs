//! Banned wallet list.
//!
//! Loaded once at startup and shared read-only. A miner authorizing with a
//! banned wallet keeps its connection but mines to the default wallet.

use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct BannedWallets {
    wallets: HashSet<String>,
}

/// Accepted file shapes: `["addr", ...]` or `{"addr": <anything>, ...}`.
/// In the map form every listed key is banned; the value is ignored.
#[derive(Deserialize)]
#[serde(untagged)]
enum BannedFile {
    List(Vec<String>),
    Map(HashMap<String, IgnoredAny>),
}

impl BannedWallets {
    pub fn from_wallets<I, S>(wallets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            wallets: wallets
                .into_iter()
                .map(|w| normalize(w.as_ref()))
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_str::<BannedFile>(raw)? {
            BannedFile::List(list) => Self::from_wallets(list),
            BannedFile::Map(map) => Self::from_wallets(map.into_keys()),
        })
    }

    /// Load from a JSON file. A missing file means nothing is banned.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No banned wallet list at {}", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let banned = Self::from_json(&raw)?;
        tracing::info!("🚫 Loaded {} banned wallets from {}", banned.len(), path.display());
        Ok(banned)
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// Whether the wallet part of `identity` (`wallet[.worker]`) is banned.
    pub fn is_banned(&self, identity: &str) -> bool {
        let (wallet, _) = split_identity(identity);
        self.wallets.contains(&normalize(wallet))
    }
}

fn normalize(wallet: &str) -> String {
    wallet.trim().to_lowercase()
}

/// Split `wallet.worker`. Spectre addresses contain `:` but never `.`.
pub fn split_identity(identity: &str) -> (&str, Option<&str>) {
    match identity.split_once('.') {
        Some((wallet, worker)) if !worker.is_empty() => (wallet.trim(), Some(worker.trim())),
        Some((wallet, _)) => (wallet.trim(), None),
        None => (identity.trim(), None),
    }
}
