/// Template Cache - latest work template and the job-id history
///
/// Single writer (the refresher), many readers (session tasks). Every refresh
/// publishes a new immutable snapshot through a watch channel, so readers never
/// hold a lock across their own work and slow sessions only ever see the
/// newest job.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::block::{BlockTemplate, HeaderError, RpcBlock};
use crate::difficulty::{Difficulty, Target};
use crate::pow::{header_hex, pre_pow_words, PowHasher};

/// One issued job. Immutable once published.
#[derive(Debug)]
pub struct WorkTemplate {
    pub job_id: u64,
    pub block: RpcBlock,
    pub pre_pow_hash: [u8; 32],
    pub timestamp: u64,
    pub bits: u32,
    pub network_target: Target,
    pub extranonce_size: u8,
    pub issued_at: Instant,
}

impl WorkTemplate {
    pub fn network_difficulty(&self) -> Difficulty {
        Difficulty::from_target(&self.network_target)
    }

    pub fn daa_score(&self) -> u64 {
        self.block.header.daa_score
    }

    pub fn notify_words(&self) -> [u64; 4] {
        pre_pow_words(&self.pre_pow_hash)
    }

    pub fn header_hex(&self) -> String {
        header_hex(&self.pre_pow_hash, self.timestamp)
    }

    /// The template block with the solved nonce, ready for `submitBlock`.
    pub fn solved_block(&self, nonce: u64) -> RpcBlock {
        self.block.with_nonce(nonce)
    }
}

#[derive(Debug, Default)]
pub struct TemplateSnapshot {
    /// Current job last; at most `stale_window + 1` entries.
    history: VecDeque<Arc<WorkTemplate>>,
    refreshed_at: Option<Instant>,
}

impl TemplateSnapshot {
    pub fn current(&self) -> Option<&Arc<WorkTemplate>> {
        self.history.back()
    }

    /// Look up a job still inside the staleness window.
    pub fn job(&self, job_id: u64) -> Option<&Arc<WorkTemplate>> {
        self.history.iter().rev().find(|t| t.job_id == job_id)
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    pub fn tracked_jobs(&self) -> impl Iterator<Item = u64> + '_ {
        self.history.iter().map(|t| t.job_id)
    }
}

pub struct TemplateCache {
    tx: watch::Sender<Arc<TemplateSnapshot>>,
    writer: Mutex<()>,
    hasher: Arc<dyn PowHasher>,
    stale_window: usize,
    extranonce_size: u8,
}

impl TemplateCache {
    pub fn new(hasher: Arc<dyn PowHasher>, stale_window: usize, extranonce_size: u8) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TemplateSnapshot::default()));
        Self {
            tx,
            writer: Mutex::new(()),
            hasher,
            stale_window,
            extranonce_size,
        }
    }

    pub fn stale_window(&self) -> usize {
        self.stale_window
    }

    /// Publish a freshly fetched template as the next job.
    pub fn refresh(&self, template: BlockTemplate) -> Result<Arc<WorkTemplate>, HeaderError> {
        let header = &template.block.header;
        let pre_pow_hash = self.hasher.pre_pow_hash(header)?;
        let timestamp = header.timestamp;
        let bits = header.bits;
        let now = Instant::now();

        let _writer = self.writer.lock();
        let previous = self.current();
        let job_id = previous.current().map(|t| t.job_id + 1).unwrap_or(1);
        let work = Arc::new(WorkTemplate {
            job_id,
            block: template.block,
            pre_pow_hash,
            timestamp,
            bits,
            network_target: Target::from_compact(bits),
            extranonce_size: self.extranonce_size,
            issued_at: now,
        });

        let mut history = previous.history.clone();
        history.push_back(Arc::clone(&work));
        while history.len() > self.stale_window + 1 {
            history.pop_front();
        }

        self.tx.send_replace(Arc::new(TemplateSnapshot {
            history,
            refreshed_at: Some(now),
        }));
        Ok(work)
    }

    /// Current snapshot without waiting on the writer.
    pub fn current(&self) -> Arc<TemplateSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TemplateSnapshot>> {
        self.tx.subscribe()
    }

    /// Whether the last successful fetch is older than `bound` (or never happened).
    pub fn is_stale(&self, bound: Duration) -> bool {
        match self.tx.borrow().refreshed_at {
            Some(at) => at.elapsed() > bound,
            None => true,
        }
    }
}
