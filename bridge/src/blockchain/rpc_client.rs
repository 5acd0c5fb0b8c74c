/// Spectre RPC Client - JSON-RPC over HTTP to spectred
///
/// Implements [`NodeClient`] with a circuit breaker, plus a tip poller that
/// turns `getBlockDagInfo` tip changes into [`TipChanged`] notifications for
/// nodes that do not push them.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::block::{BlockTemplate, RpcBlock};
use super::node::{NodeClient, NodeError, SubmitOutcome, TipChanged};
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "🔌 Circuit breaker tripped after {} failures, pausing RPC for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("✅ Circuit breaker reset (successful call)");
        }
    }

    fn check(&mut self) -> Result<(), NodeError> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("🔌 Circuit breaker half-open, retrying node");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(NodeError::CircuitOpen);
                }
            }
        }
        Ok(())
    }
}

pub struct SpectreRpcClient {
    base_url: String,
    pay_address: String,
    extra_data: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
    next_id: AtomicU64,
    tips: broadcast::Sender<TipChanged>,
}

impl SpectreRpcClient {
    /// `address` is `host:port` or a full `http://` URL.
    pub fn new(address: &str, pay_address: String, timeout: Duration) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        let (tips, _) = broadcast::channel(16);

        tracing::info!("SpectreRpcClient initialized: {}", base_url);

        Self {
            base_url,
            pay_address,
            extra_data: format!("spectre-bridge/{}", env!("CARGO_PKG_VERSION")),
            timeout,
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
            next_id: AtomicU64::new(1),
            tips,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, payload: &RpcRequest) -> Result<RpcResponse> {
        let body = Full::new(Bytes::from(serde_json::to_vec(payload)?));
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.base_url)
            .header("Content-Type", "application/json")
            .body(body)?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow!("RPC request timeout"))?
            .context("RPC request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("RPC HTTP error: {}", status));
        }

        let body_bytes = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_reader(body_bytes.reader())?)
    }

    /// Make RPC call to the node
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        metrics::inc_rpc_requests(method);

        self.circuit_breaker.write().await.check()?;

        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let response = match self.post(&payload).await {
            Ok(r) => r,
            Err(e) => {
                self.circuit_breaker.write().await.record_failure();
                let unsent = e
                    .downcast_ref::<hyper_util::client::legacy::Error>()
                    .is_some_and(|e| e.is_connect());
                return Err(if unsent {
                    NodeError::Connect(format!("{:#}", e))
                } else {
                    NodeError::Transport(format!("{:#}", e))
                });
            }
        };

        self.circuit_breaker.write().await.record_success();

        // Application errors do not trip the breaker.
        if let Some(error) = response.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(NodeError::Rpc(message));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn get_block_template(&self) -> Result<BlockTemplate, NodeError> {
        let result = self
            .call(
                "getBlockTemplate",
                json!({ "payAddress": self.pay_address, "extraData": self.extra_data }),
            )
            .await?;
        Ok(BlockTemplate::from_rpc_response(&result)?)
    }

    pub async fn get_tip_hashes(&self) -> Result<Vec<String>, NodeError> {
        let result = self.call("getBlockDagInfo", json!({})).await?;
        let tips = result
            .get("tipHashes")
            .and_then(Value::as_array)
            .ok_or_else(|| NodeError::Malformed("getBlockDagInfo without tipHashes".into()))?;
        Ok(tips
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    /// Poll the DAG tips and broadcast a [`TipChanged`] whenever they move.
    pub fn spawn_tip_poller(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Vec<String> = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.get_tip_hashes().await {
                    Ok(mut tips) => {
                        tips.sort();
                        if tips != last {
                            tracing::debug!(tips = tips.len(), "DAG tips changed");
                            last = tips.clone();
                            // No receivers yet is fine.
                            let _ = client.tips.send(TipChanged { tips });
                        }
                    }
                    Err(e) => tracing::debug!("Tip poll failed: {}", e),
                }
            }
        })
    }
}

/// Interpret a `submitBlock` result.
fn parse_submit_result(result: &Value) -> SubmitOutcome {
    if let Some(b) = result.as_bool() {
        return if b {
            SubmitOutcome::Accepted
        } else {
            SubmitOutcome::Rejected("node returned false".into())
        };
    }

    let Some(obj) = result.as_object() else {
        return SubmitOutcome::Rejected(format!("unexpected submitBlock result: {}", result));
    };

    match obj.get("report") {
        Some(Value::String(s)) if s.eq_ignore_ascii_case("success") => {
            return SubmitOutcome::Accepted
        }
        Some(Value::Object(report)) => {
            if let Some(reason) = report
                .get("reject")
                .or_else(|| report.get("rejectReason"))
                .and_then(Value::as_str)
            {
                return SubmitOutcome::Rejected(reason.to_string());
            }
            if report
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.eq_ignore_ascii_case("success"))
                .unwrap_or(false)
            {
                return SubmitOutcome::Accepted;
            }
        }
        _ => {}
    }

    let accepted = obj
        .get("accepted")
        .and_then(Value::as_bool)
        .or_else(|| {
            obj.get("status")
                .and_then(Value::as_str)
                .map(|s| s.eq_ignore_ascii_case("accepted"))
        })
        .unwrap_or(false);

    if accepted {
        SubmitOutcome::Accepted
    } else {
        SubmitOutcome::Rejected(result.to_string())
    }
}

#[async_trait]
impl NodeClient for SpectreRpcClient {
    async fn fetch_template(&self) -> Result<BlockTemplate, NodeError> {
        self.get_block_template().await
    }

    async fn submit_block(&self, block: &RpcBlock) -> Result<SubmitOutcome, NodeError> {
        let params = json!({ "block": block, "allowNonDAABlocks": false });
        match self.call("submitBlock", params).await {
            Ok(result) => Ok(parse_submit_result(&result)),
            // The node refused the block itself; nothing to retry.
            Err(NodeError::Rpc(message)) => Ok(SubmitOutcome::Rejected(message)),
            Err(e) => Err(e),
        }
    }

    fn subscribe_tips(&self) -> broadcast::Receiver<TipChanged> {
        self.tips.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.is_open);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open);
        }

        breaker.record_failure();
        assert!(breaker.is_open);
        assert!(matches!(breaker.check(), Err(NodeError::CircuitOpen)));
    }

    #[test]
    fn client_url_normalization() {
        let client = SpectreRpcClient::new("127.0.0.1:18110", "spectre:qq".into(), Duration::from_secs(5));
        assert_eq!(client.base_url(), "http://127.0.0.1:18110");

        let client = SpectreRpcClient::new("http://node:80/rpc", "spectre:qq".into(), Duration::from_secs(5));
        assert_eq!(client.base_url(), "http://node:80/rpc");
    }

    #[test]
    fn submit_result_variants() {
        assert_eq!(parse_submit_result(&json!(true)), SubmitOutcome::Accepted);
        assert_eq!(parse_submit_result(&json!({"report": "SUCCESS"})), SubmitOutcome::Accepted);
        assert_eq!(
            parse_submit_result(&json!({"report": {"type": "success"}})),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            parse_submit_result(&json!({"report": {"reject": "BlockInvalid"}})),
            SubmitOutcome::Rejected("BlockInvalid".into())
        );
        assert_eq!(parse_submit_result(&json!({"status": "accepted"})), SubmitOutcome::Accepted);
        assert!(matches!(parse_submit_result(&json!(42)), SubmitOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn unreachable_node_is_connect_error() {
        // Port 9 (discard) on localhost is essentially never an HTTP server.
        let client = SpectreRpcClient::new("127.0.0.1:9", "spectre:qq".into(), Duration::from_millis(500));
        let err = client.fetch_template().await.unwrap_err();
        assert!(matches!(err, NodeError::Connect(_)), "unexpected error: {}", err);
        assert!(err.never_sent());
    }
}
