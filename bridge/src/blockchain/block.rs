/// Block and block-template types as exchanged with the Spectre node.
///
/// Field names follow the node's JSON-RPC encoding (camelCase). Hashes are
/// kept as hex strings and only decoded when the header is hashed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("invalid {field} hash: {value}")]
    InvalidHash { field: &'static str, value: String },

    #[error("invalid blue work: {0}")]
    InvalidBlueWork(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlockHeader {
    pub version: u16,
    #[serde(default)]
    pub parents_by_level: Vec<Vec<String>>,
    pub hash_merkle_root: String,
    pub accepted_id_merkle_root: String,
    pub utxo_commitment: String,
    pub timestamp: u64,
    pub bits: u32,
    #[serde(default)]
    pub nonce: u64,
    pub daa_score: u64,
    #[serde(default)]
    pub blue_work: String,
    pub blue_score: u64,
    pub pruning_point: String,
}

impl RpcBlockHeader {
    /// Parent hashes of the first level (direct DAG parents).
    pub fn direct_parents(&self) -> &[String] {
        self.parents_by_level.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Canonical byte serialization used for hashing.
    ///
    /// `timestamp` and `nonce` are substituted so the pre-PoW hash can be
    /// computed with both zeroed.
    pub fn hashing_bytes(&self, timestamp: u64, nonce: u64) -> Result<Vec<u8>, HeaderError> {
        let mut buf = Vec::with_capacity(256 + 32 * self.parents_by_level.len());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.parents_by_level.len() as u64).to_le_bytes());
        for level in &self.parents_by_level {
            buf.extend_from_slice(&(level.len() as u64).to_le_bytes());
            for parent in level {
                buf.extend_from_slice(&decode_hash("parent", parent)?);
            }
        }
        buf.extend_from_slice(&decode_hash("hashMerkleRoot", &self.hash_merkle_root)?);
        buf.extend_from_slice(&decode_hash("acceptedIdMerkleRoot", &self.accepted_id_merkle_root)?);
        buf.extend_from_slice(&decode_hash("utxoCommitment", &self.utxo_commitment)?);
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&nonce.to_le_bytes());
        buf.extend_from_slice(&self.daa_score.to_le_bytes());
        buf.extend_from_slice(&self.blue_score.to_le_bytes());

        let blue_work = decode_blue_work(&self.blue_work)?;
        buf.extend_from_slice(&(blue_work.len() as u64).to_le_bytes());
        buf.extend_from_slice(&blue_work);

        buf.extend_from_slice(&decode_hash("pruningPoint", &self.pruning_point)?);
        Ok(buf)
    }
}

/// Full block: header plus opaque transactions, exactly as the node sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub header: RpcBlockHeader,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

impl RpcBlock {
    /// Copy of this block with the solved nonce filled in.
    pub fn with_nonce(&self, nonce: u64) -> RpcBlock {
        let mut block = self.clone();
        block.header.nonce = nonce;
        block
    }
}

/// Result of `getBlockTemplate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTemplate {
    pub block: RpcBlock,
    #[serde(default = "default_synced")]
    pub is_synced: bool,
}

fn default_synced() -> bool {
    true
}

impl BlockTemplate {
    /// Parse from RPC response
    pub fn from_rpc_response(value: &Value) -> Result<Self, serde_json::Error> {
        // Some node builds return the block directly instead of wrapping it.
        if value.get("block").is_none() && value.get("header").is_some() {
            let block: RpcBlock = serde_json::from_value(value.clone())?;
            return Ok(Self {
                block,
                is_synced: true,
            });
        }
        serde_json::from_value(value.clone())
    }
}

fn decode_hash(field: &'static str, value: &str) -> Result<[u8; 32], HeaderError> {
    let invalid = || HeaderError::InvalidHash {
        field,
        value: value.to_string(),
    };
    let bytes = hex::decode(value.trim_start_matches("0x")).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/// Blue work is a big-endian integer of variable width; leading zero bytes are dropped.
fn decode_blue_work(value: &str) -> Result<Vec<u8>, HeaderError> {
    let trimmed = value.trim_start_matches("0x");
    let padded = if trimmed.len() % 2 == 1 {
        format!("0{}", trimmed)
    } else {
        trimmed.to_string()
    };
    let bytes = hex::decode(&padded).map_err(|_| HeaderError::InvalidBlueWork(value.to_string()))?;
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    Ok(bytes[first..].to_vec())
}
