/// Node access - the upstream capability the bridge mines against
///
/// [`NodeClient`] is the transport seam (JSON-RPC over HTTP in production, a
/// fabricated node in tests). [`NodeHandle`] wraps it with:
/// - one call queue, so RPCs reach the node strictly one at a time
/// - per-call timeouts
/// - bounded exponential backoff for transient failures; block submits are only
///   re-sent when the request provably never reached the node

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use super::block::{BlockTemplate, HeaderError, RpcBlock};
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// The request never left the bridge.
    #[error("cannot reach node: {0}")]
    Connect(String),

    #[error("node transport error: {0}")]
    Transport(String),

    #[error("node call timed out after {0:?}")]
    Timeout(Duration),

    #[error("node RPC error: {0}")]
    Rpc(String),

    #[error("malformed node response: {0}")]
    Malformed(String),

    #[error("node is not synced")]
    NotSynced,

    #[error("RPC circuit breaker is open")]
    CircuitOpen,
}

impl NodeError {
    /// Worth retrying an idempotent call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Transport(_) | Self::Timeout(_))
    }

    /// The node cannot have seen the request, so even a block submit may be re-sent.
    pub fn never_sent(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

impl From<HeaderError> for NodeError {
    fn from(e: HeaderError) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// The node's DAG tips changed; a fresh template is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipChanged {
    pub tips: Vec<String>,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn fetch_template(&self) -> Result<BlockTemplate, NodeError>;

    async fn submit_block(&self, block: &RpcBlock) -> Result<SubmitOutcome, NodeError>;

    fn subscribe_tips(&self) -> broadcast::Receiver<TipChanged>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct NodeHandle {
    client: Arc<dyn NodeClient>,
    queue: Mutex<()>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl NodeHandle {
    pub fn new(client: Arc<dyn NodeClient>, call_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            client,
            queue: Mutex::new(()),
            call_timeout,
            retry,
        }
    }

    pub async fn fetch_template(&self) -> Result<BlockTemplate, NodeError> {
        let template = self
            .with_retry("fetch_template", NodeError::is_transient, || {
                self.client.fetch_template()
            })
            .await?;
        if !template.is_synced {
            return Err(NodeError::NotSynced);
        }
        Ok(template)
    }

    /// Submit a solved block. A rejection is final, and a timed-out or broken
    /// request is not re-sent since the node may already hold the block.
    pub async fn submit_block(&self, block: &RpcBlock) -> Result<SubmitOutcome, NodeError> {
        self.with_retry("submit_block", NodeError::never_sent, || {
            self.client.submit_block(block)
        })
        .await
    }

    pub fn subscribe_tips(&self) -> broadcast::Receiver<TipChanged> {
        self.client.subscribe_tips()
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        retryable: fn(&NodeError) -> bool,
        mut call: F,
    ) -> Result<T, NodeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, NodeError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _turn = self.queue.lock().await;
                match tokio::time::timeout(self.call_timeout, call()).await {
                    Ok(r) => r,
                    Err(_) => Err(NodeError::Timeout(self.call_timeout)),
                }
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) => {
                    metrics::inc_rpc_errors(op);
                    if !retryable(&e) || attempt >= self.retry.attempts {
                        return Err(e);
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Node call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::tests::sample_header;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyNode {
        failures_left: AtomicU32,
        calls: AtomicU32,
        synced: bool,
        tips: broadcast::Sender<TipChanged>,
    }

    impl FlakyNode {
        fn new(failures: u32, synced: bool) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                synced,
                tips: broadcast::channel(4).0,
            }
        }
    }

    #[async_trait]
    impl NodeClient for FlakyNode {
        async fn fetch_template(&self) -> Result<BlockTemplate, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NodeError::Transport("connection refused".into()));
            }
            Ok(BlockTemplate {
                block: RpcBlock {
                    header: sample_header(0x207fffff),
                    transactions: vec![],
                },
                is_synced: self.synced,
            })
        }

        async fn submit_block(&self, _block: &RpcBlock) -> Result<SubmitOutcome, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubmitOutcome::Rejected("bad merkle root".into()))
        }

        fn subscribe_tips(&self) -> broadcast::Receiver<TipChanged> {
            self.tips.subscribe()
        }
    }

    /// Submits that hang past the call timeout, or fail before connecting.
    struct SubmitNode {
        delay: Duration,
        unreachable_for: AtomicU32,
        submits: AtomicU32,
        tips: broadcast::Sender<TipChanged>,
    }

    impl SubmitNode {
        fn new(delay: Duration, unreachable_for: u32) -> Self {
            Self {
                delay,
                unreachable_for: AtomicU32::new(unreachable_for),
                submits: AtomicU32::new(0),
                tips: broadcast::channel(4).0,
            }
        }
    }

    #[async_trait]
    impl NodeClient for SubmitNode {
        async fn fetch_template(&self) -> Result<BlockTemplate, NodeError> {
            Err(NodeError::Rpc("unused".into()))
        }

        async fn submit_block(&self, _block: &RpcBlock) -> Result<SubmitOutcome, NodeError> {
            if self
                .unreachable_for
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NodeError::Connect("connection refused".into()));
            }
            self.submits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(SubmitOutcome::Accepted)
        }

        fn subscribe_tips(&self) -> broadcast::Receiver<TipChanged> {
            self.tips.subscribe()
        }
    }

    fn solved_block() -> RpcBlock {
        RpcBlock {
            header: sample_header(0x207fffff),
            transactions: vec![],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(250));
        assert_eq!(p.backoff(2), Duration::from_millis(500));
        assert_eq!(p.backoff(3), Duration::from_secs(1));
        assert_eq!(p.backoff(30), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let node = Arc::new(FlakyNode::new(2, true));
        let handle = NodeHandle::new(node.clone(), Duration::from_secs(1), fast_retry());
        assert!(handle.fetch_template().await.is_ok());
        assert_eq!(node.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let node = Arc::new(FlakyNode::new(10, true));
        let handle = NodeHandle::new(node.clone(), Duration::from_secs(1), fast_retry());
        assert!(matches!(handle.fetch_template().await, Err(NodeError::Transport(_))));
        assert_eq!(node.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsynced_node_is_an_error() {
        let handle = NodeHandle::new(
            Arc::new(FlakyNode::new(0, false)),
            Duration::from_secs(1),
            fast_retry(),
        );
        assert!(matches!(handle.fetch_template().await, Err(NodeError::NotSynced)));
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let node = Arc::new(FlakyNode::new(0, true));
        let handle = NodeHandle::new(node.clone(), Duration::from_secs(1), fast_retry());
        let block = RpcBlock {
            header: sample_header(0x207fffff),
            transactions: vec![],
        };
        assert_eq!(
            handle.submit_block(&block).await.unwrap(),
            SubmitOutcome::Rejected("bad merkle root".into())
        );
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_submit_is_not_resent() {
        let node = Arc::new(SubmitNode::new(Duration::from_millis(200), 0));
        let handle = NodeHandle::new(node.clone(), Duration::from_millis(10), fast_retry());
        assert!(matches!(
            handle.submit_block(&solved_block()).await,
            Err(NodeError::Timeout(_))
        ));
        assert_eq!(node.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsent_submit_is_retried() {
        let node = Arc::new(SubmitNode::new(Duration::ZERO, 2));
        let handle = NodeHandle::new(node.clone(), Duration::from_secs(1), fast_retry());
        assert_eq!(
            handle.submit_block(&solved_block()).await.unwrap(),
            SubmitOutcome::Accepted
        );
        assert_eq!(node.submits.load(Ordering::SeqCst), 1);
    }
}
