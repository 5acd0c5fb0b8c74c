/// Bridge error taxonomy
///
/// Per-share rejections keep the session open; protocol errors close it.
/// Upstream and capacity errors are process-wide conditions that never
/// terminate the coordinator.

use thiserror::Error;

use crate::stratum::protocol::StratumError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or out-of-order message. The session is closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stale share: job {0} is no longer tracked")]
    StaleShare(u64),

    #[error("share difficulty {achieved} below required {required}")]
    LowDifficultyShare { achieved: u64, required: u64 },

    #[error("duplicate share")]
    DuplicateShare,

    /// Node RPC failed or the cached template is older than the staleness bound.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Extranonce space is fully allocated.
    #[error("extranonce space exhausted")]
    CapacityExhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether the owning session must be torn down after this error.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Io(_) | Self::Json(_))
    }

    /// Stratum error object reported back to the miner.
    pub fn to_stratum(&self) -> StratumError {
        match self {
            Self::StaleShare(_) => StratumError::job_not_found(),
            Self::LowDifficultyShare { .. } => StratumError::low_difficulty(),
            Self::DuplicateShare => StratumError::duplicate_share(),
            Self::UpstreamUnavailable(_) => StratumError::upstream_unavailable(),
            Self::CapacityExhausted => StratumError::other("Extranonce space exhausted"),
            Self::Protocol(msg) => StratumError::other(msg.clone()),
            Self::Io(e) => StratumError::other(e.to_string()),
            Self::Json(e) => StratumError::other(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
