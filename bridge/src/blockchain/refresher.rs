/// Template refresher - keeps the cache current
///
/// A new template is fetched when the node reports a tip change or when the
/// block-wait timeout elapses without one. Failed fetches keep the previous
/// template in place and back off before the next attempt.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::node::NodeHandle;
use super::template_cache::TemplateCache;
use crate::metrics::prometheus as metrics;

pub struct TemplateRefresher {
    cache: Arc<TemplateCache>,
    node: Arc<NodeHandle>,
    block_wait: Duration,
    max_backoff: Duration,
}

impl TemplateRefresher {
    pub fn new(cache: Arc<TemplateCache>, node: Arc<NodeHandle>, block_wait: Duration) -> Self {
        Self {
            cache,
            node,
            block_wait,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Fetch once and publish. Returns whether a new job went out.
    pub async fn refresh_once(&self) -> bool {
        let template = match self.node.fetch_template().await {
            Ok(t) => t,
            Err(e) => {
                metrics::inc_template_failures();
                tracing::warn!("⚠️  Template fetch failed, keeping cached job: {}", e);
                return false;
            }
        };

        match self.cache.refresh(template) {
            Ok(work) => {
                metrics::inc_jobs_published();
                metrics::set_network_difficulty(work.network_difficulty().value());
                tracing::debug!(
                    job_id = work.job_id,
                    daa_score = work.daa_score(),
                    network_difficulty = %work.network_difficulty(),
                    "New job published"
                );
                true
            }
            Err(e) => {
                metrics::inc_template_failures();
                tracing::warn!("⚠️  Node sent a template we cannot hash: {}", e);
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tips = self.node.subscribe_tips();
        let mut tips_open = true;
        let mut failures: u32 = 0;

        tracing::info!(
            "🔄 Template refresher started (block wait {}ms)",
            self.block_wait.as_millis()
        );

        loop {
            let ok = self.refresh_once().await;
            failures = if ok { 0 } else { failures.saturating_add(1) };

            // After a failure, wait the backoff instead of the block-wait period.
            let wait = if failures == 0 {
                self.block_wait
            } else {
                let exp = failures.saturating_sub(1).min(8);
                (Duration::from_millis(500) * (1u32 << exp)).min(self.max_backoff)
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    tracing::trace!("Block wait elapsed, forcing template refresh");
                }
                tip = tips.recv(), if tips_open && failures == 0 => match tip {
                    Ok(change) => tracing::trace!(tips = change.tips.len(), "Tip change"),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::trace!(skipped, "Tip notifications coalesced");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Tip notifications closed, refreshing on block wait only");
                        tips_open = false;
                    }
                },
            }
        }

        tracing::info!("Template refresher stopped");
    }
}
