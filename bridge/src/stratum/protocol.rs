/// Stratum protocol message types and serialization
///
/// EthereumStratum/1.0.0 dialect used by kHeavyHash-family ASICs:
/// - `mining.subscribe` / `mining.extranonce.subscribe`
/// - `mining.authorize`
/// - `mining.submit`
/// - server pushes: `mining.set_extranonce`, `mining.set_difficulty`, `mining.notify`

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::difficulty::Difficulty;

/// Protocol string returned from `mining.subscribe`.
pub const PROTOCOL_VERSION: &str = "EthereumStratum/1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// JSON-RPC version (some firmwares send "2.0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request ID
    #[serde(default)]
    pub id: Value,

    /// Method name
    pub method: String,

    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl StratumRequest {
    /// Positional params. A missing `params` field reads as an empty list.
    pub fn params(&self) -> &[Value] {
        match &self.params {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        }
    }

    /// String param at `index`, if present.
    pub fn str_param(&self, index: usize) -> Option<&str> {
        self.params().get(index).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    /// Request ID
    pub id: Value,

    /// Result (if success)
    #[serde(default)]
    pub result: Option<Value>,

    /// Error (if failure)
    #[serde(default)]
    pub error: Option<StratumError>,
}

impl StratumResponse {
    /// Create success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create error response
    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumError {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Additional error data
    #[serde(default)]
    pub data: Option<Value>,
}

impl StratumError {
    pub const UNKNOWN: i32 = -1;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub const OTHER: i32 = 20;

    /// Job not found (stale)
    pub const JOB_NOT_FOUND: i32 = 21;

    /// Invalid share
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;

    /// Not authorized
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;

    /// Node unreachable or template too old
    pub const UPSTREAM_UNAVAILABLE: i32 = 26;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Unknown method: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Job not found")
    }

    pub fn duplicate_share() -> Self {
        Self::new(Self::DUPLICATE_SHARE, "Duplicate share")
    }

    pub fn low_difficulty() -> Self {
        Self::new(Self::LOW_DIFFICULTY, "Share difficulty too low")
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "Not subscribed")
    }

    pub fn upstream_unavailable() -> Self {
        Self::new(Self::UPSTREAM_UNAVAILABLE, "Upstream node unavailable")
    }
}

/// Server-initiated push. Stratum notifications carry a null id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumNotification {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl StratumNotification {
    fn new(method: &str, params: Value) -> Self {
        Self {
            id: Value::Null,
            method: method.to_string(),
            params,
        }
    }

    /// `mining.set_extranonce [extranonce_hex, nonce_bytes_left]`
    pub fn set_extranonce(extranonce_hex: &str, nonce_bytes_left: u8) -> Self {
        Self::new("mining.set_extranonce", json!([extranonce_hex, nonce_bytes_left]))
    }

    /// `mining.set_difficulty [difficulty]`
    pub fn set_difficulty(difficulty: Difficulty) -> Self {
        Self::new("mining.set_difficulty", json!([difficulty.value()]))
    }

    /// `mining.notify [job_id, [w0, w1, w2, w3], timestamp]`
    pub fn notify_words(job_id: u64, words: [u64; 4], timestamp: u64) -> Self {
        Self::new(
            "mining.notify",
            json!([job_id.to_string(), words, timestamp]),
        )
    }

    /// `mining.notify [job_id, header_hex]`
    pub fn notify_hex(job_id: u64, header_hex: &str) -> Self {
        Self::new("mining.notify", json!([job_id.to_string(), header_hex]))
    }
}

/// How `mining.notify` encodes the work for a given miner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobFormat {
    /// Four little-endian u64 words of the pre-PoW hash plus timestamp.
    #[default]
    Words,
    /// Single hex string: pre-PoW hash followed by the LE timestamp.
    Hex,
}

impl JobFormat {
    /// Pick the job encoding from the `mining.subscribe` user agent.
    pub fn from_agent(agent: &str) -> Self {
        let agent = agent.to_ascii_lowercase();
        if agent.contains("godminer") || agent.contains("bitmain") {
            JobFormat::Hex
        } else {
            JobFormat::Words
        }
    }
}

/// Submit params: `[worker, job_id, nonce_hex]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: u64,
    pub nonce_hex: String,
}

impl SubmitParams {
    pub fn parse(request: &StratumRequest) -> Result<Self, String> {
        let params = request.params();
        if params.len() < 3 {
            return Err(format!("mining.submit expects 3 params, got {}", params.len()));
        }

        let worker = params[0].as_str().unwrap_or_default().to_string();
        let job_id = match &params[1] {
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid job id '{}'", s))?,
            Value::Number(n) => n.as_u64().ok_or_else(|| format!("invalid job id {}", n))?,
            other => return Err(format!("invalid job id {}", other)),
        };
        let nonce_hex = params[2]
            .as_str()
            .ok_or_else(|| "nonce must be a hex string".to_string())?
            .trim_start_matches("0x")
            .to_ascii_lowercase();

        Ok(Self {
            worker,
            job_id,
            nonce_hex,
        })
    }
}
