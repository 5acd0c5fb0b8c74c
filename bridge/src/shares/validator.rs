/// Share Validator - recompute the PoW of a submitted nonce and classify it
///
/// Order of checks:
/// 1. job still inside the staleness window, else `Stale`
/// 2. (job id, nonce) not seen on this session, else `Duplicate`
/// 3. PoW value misses the session difficulty for that job: `LowDifficulty`
/// 4. PoW value meets the network target: `ValidBlock`
/// 5. otherwise `ValidShare`
///
/// A share below the session difficulty is never forwarded, even when it would
/// satisfy a network target easier than the session's.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::blockchain::{RpcBlock, TemplateSnapshot};
use crate::difficulty::Difficulty;
use crate::error::BridgeError;
use crate::extranonce::Extranonce;
use crate::pow::PowHasher;
use crate::vardiff::DifficultySchedule;

/// Submitted share from miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub job_id: u64,
    /// Full 64-bit nonce, extranonce prefix included.
    pub nonce: u64,
    pub extranonce: Extranonce,
    pub worker: String,
    pub received_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShareVerdict {
    Stale,
    Duplicate,
    LowDifficulty {
        achieved: Difficulty,
        required: Difficulty,
    },
    ValidShare {
        achieved: Difficulty,
    },
    ValidBlock {
        achieved: Difficulty,
        block: Box<RpcBlock>,
    },
}

impl ShareVerdict {
    /// Every value [`label`](Self::label) can return.
    pub const LABELS: [&'static str; 5] = ["stale", "duplicate", "low_difficulty", "valid", "block"];

    /// Metric / log label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Duplicate => "duplicate",
            Self::LowDifficulty { .. } => "low_difficulty",
            Self::ValidShare { .. } => "valid",
            Self::ValidBlock { .. } => "block",
        }
    }

    /// Counts toward the vardiff window.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::ValidShare { .. } | Self::ValidBlock { .. })
    }

    /// Rejection error reported to the miner, if any.
    pub fn rejection(&self, job_id: u64) -> Option<BridgeError> {
        match self {
            Self::Stale => Some(BridgeError::StaleShare(job_id)),
            Self::Duplicate => Some(BridgeError::DuplicateShare),
            Self::LowDifficulty { achieved, required } => Some(BridgeError::LowDifficultyShare {
                achieved: achieved.value(),
                required: required.value(),
            }),
            Self::ValidShare { .. } | Self::ValidBlock { .. } => None,
        }
    }
}

/// Bounded set of recently submitted (job id, nonce) pairs.
#[derive(Debug, Clone)]
pub struct RecentShares {
    capacity: usize,
    seen: HashSet<(u64, u64)>,
    order: VecDeque<(u64, u64)>,
}

impl RecentShares {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a submission. Returns `false` if it was already present.
    pub fn insert(&mut self, job_id: u64, nonce: u64) -> bool {
        let key = (job_id, nonce);
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct ShareValidator {
    hasher: Arc<dyn PowHasher>,
}

impl ShareValidator {
    pub fn new(hasher: Arc<dyn PowHasher>) -> Self {
        Self { hasher }
    }

    pub fn validate(
        &self,
        snapshot: &TemplateSnapshot,
        schedule: &DifficultySchedule,
        recent: &mut RecentShares,
        share: &Share,
    ) -> ShareVerdict {
        let Some(work) = snapshot.job(share.job_id) else {
            return ShareVerdict::Stale;
        };

        if !recent.insert(share.job_id, share.nonce) {
            return ShareVerdict::Duplicate;
        }

        let pow = self
            .hasher
            .pow_value(&work.pre_pow_hash, work.timestamp, share.nonce);
        let achieved = Difficulty::from_target(&pow);

        let required = schedule.required_for(share.job_id);
        if !required.to_target().is_met_by(&pow) {
            return ShareVerdict::LowDifficulty { achieved, required };
        }

        if work.network_target.is_met_by(&pow) {
            return ShareVerdict::ValidBlock {
                achieved,
                block: Box::new(work.solved_block(share.nonce)),
            };
        }

        ShareVerdict::ValidShare { achieved }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::tests::sample_header;
    use crate::blockchain::{BlockTemplate, TemplateCache};
    use crate::difficulty::Target;
    use crate::pow::HeavyHasher;

    fn template_with_network_difficulty(diff: u64, daa: u64) -> BlockTemplate {
        let bits = Difficulty::new(diff).to_target().to_compact();
        let mut header = sample_header(bits);
        header.daa_score = daa;
        BlockTemplate {
            block: RpcBlock {
                header,
                transactions: vec![],
            },
            is_synced: true,
        }
    }

    /// First nonce whose PoW difficulty falls in `[lo, hi)`.
    fn find_nonce(pre: &[u8; 32], timestamp: u64, lo: u64, hi: u64) -> u64 {
        let hasher = HeavyHasher::new();
        (0u64..)
            .find(|n| {
                let d = Difficulty::from_target(&hasher.pow_value(pre, timestamp, *n)).value();
                d >= lo && d < hi
            })
            .unwrap()
    }

    fn share(job_id: u64, nonce: u64) -> Share {
        Share {
            job_id,
            nonce,
            extranonce: Extranonce::EMPTY,
            worker: "rig".into(),
            received_at: Instant::now(),
        }
    }

    fn setup(window: usize) -> (TemplateCache, ShareValidator) {
        let hasher: Arc<dyn PowHasher> = Arc::new(HeavyHasher::new());
        (
            TemplateCache::new(hasher.clone(), window, 0),
            ShareValidator::new(hasher),
        )
    }

    #[test]
    fn classifies_share_block_and_low() {
        let (cache, validator) = setup(1);
        let work = cache.refresh(template_with_network_difficulty(1000, 1)).unwrap();
        let snap = cache.current();
        let schedule = DifficultySchedule::new(Difficulty::new(64));
        let mut recent = RecentShares::new(64);

        let share_nonce = find_nonce(&work.pre_pow_hash, work.timestamp, 500, 1000);
        let verdict = validator.validate(&snap, &schedule, &mut recent, &share(1, share_nonce));
        assert!(matches!(verdict, ShareVerdict::ValidShare { achieved } if achieved.value() >= 500));

        let block_nonce = find_nonce(&work.pre_pow_hash, work.timestamp, 1500, u64::MAX);
        match validator.validate(&snap, &schedule, &mut recent, &share(1, block_nonce)) {
            ShareVerdict::ValidBlock { block, .. } => {
                assert_eq!(block.header.nonce, block_nonce);
                assert_eq!(block.header.daa_score, 1);
            }
            other => panic!("expected block, got {:?}", other),
        }

        let low_nonce = find_nonce(&work.pre_pow_hash, work.timestamp, 1, 64);
        let verdict = validator.validate(&snap, &schedule, &mut recent, &share(1, low_nonce));
        assert!(matches!(verdict, ShareVerdict::LowDifficulty { required, .. } if required.value() == 64));
        assert!(verdict.rejection(1).is_some());
    }

    #[test]
    fn session_difficulty_is_checked_before_network_target() {
        let (cache, validator) = setup(1);
        let work = cache.refresh(template_with_network_difficulty(100, 1)).unwrap();
        let schedule = DifficultySchedule::new(Difficulty::new(100_000));
        let mut recent = RecentShares::new(64);
        let nonce = find_nonce(&work.pre_pow_hash, work.timestamp, 200, 1000);
        let verdict = validator.validate(&cache.current(), &schedule, &mut recent, &share(1, nonce));
        assert_eq!(verdict.label(), "low_difficulty");
        assert!(!verdict.is_accepted());
    }

    #[test]
    fn downward_retarget_accepts_old_job_at_new_difficulty() {
        let (cache, validator) = setup(4);
        let work = cache.refresh(template_with_network_difficulty(1_000_000, 1)).unwrap();
        let mut schedule = DifficultySchedule::new(Difficulty::new(4096));
        schedule.job_issued(1);
        schedule.retarget(Difficulty::new(64));

        let mut recent = RecentShares::new(64);
        let nonce = find_nonce(&work.pre_pow_hash, work.timestamp, 500, 4096);
        let v = validator.validate(&cache.current(), &schedule, &mut recent, &share(1, nonce));
        assert_eq!(v.label(), "valid");
    }

    #[test]
    fn duplicates_and_stale() {
        let (cache, validator) = setup(1);
        let work = cache.refresh(template_with_network_difficulty(1000, 1)).unwrap();
        let schedule = DifficultySchedule::new(Difficulty::new(1));
        let mut recent = RecentShares::new(64);
        let nonce = find_nonce(&work.pre_pow_hash, work.timestamp, 1, 1000);

        let first = validator.validate(&cache.current(), &schedule, &mut recent, &share(1, nonce));
        assert!(first.is_accepted());
        let again = validator.validate(&cache.current(), &schedule, &mut recent, &share(1, nonce));
        assert_eq!(again, ShareVerdict::Duplicate);

        // Window 1: job 1 survives one refresh, not two.
        cache.refresh(template_with_network_difficulty(1000, 2)).unwrap();
        let other = find_nonce(&work.pre_pow_hash, work.timestamp, 1, 1000) + 1;
        let v = validator.validate(&cache.current(), &schedule, &mut recent, &share(1, other));
        assert_ne!(v, ShareVerdict::Stale);

        cache.refresh(template_with_network_difficulty(1000, 3)).unwrap();
        let v = validator.validate(&cache.current(), &schedule, &mut recent, &share(1, other + 1));
        assert_eq!(v, ShareVerdict::Stale);
        assert!(matches!(v.rejection(1), Some(BridgeError::StaleShare(1))));

        // Unknown future job is stale too.
        let v = validator.validate(&cache.current(), &schedule, &mut recent, &share(99, 0));
        assert_eq!(v, ShareVerdict::Stale);
    }

    #[test]
    fn old_job_checked_at_previous_difficulty() {
        let (cache, validator) = setup(4);
        let job1 = cache.refresh(template_with_network_difficulty(1_000_000, 1)).unwrap();
        let mut schedule = DifficultySchedule::new(Difficulty::new(64));
        schedule.job_issued(1);
        schedule.retarget(Difficulty::new(4096));
        let job2 = cache.refresh(template_with_network_difficulty(1_000_000, 2)).unwrap();
        schedule.job_issued(job2.job_id);

        let mut recent = RecentShares::new(64);
        let snap = cache.current();
        let n1 = find_nonce(&job1.pre_pow_hash, job1.timestamp, 64, 4096);
        assert!(validator.validate(&snap, &schedule, &mut recent, &share(1, n1)).is_accepted());

        let n2 = find_nonce(&job2.pre_pow_hash, job2.timestamp, 64, 4096);
        let v = validator.validate(&snap, &schedule, &mut recent, &share(2, n2));
        assert_eq!(v.label(), "low_difficulty");
    }

    #[test]
    fn labels_cover_every_verdict() {
        let achieved = Difficulty::new(1);
        let verdicts = [
            ShareVerdict::Stale,
            ShareVerdict::Duplicate,
            ShareVerdict::LowDifficulty {
                achieved,
                required: achieved,
            },
            ShareVerdict::ValidShare { achieved },
            ShareVerdict::ValidBlock {
                achieved,
                block: Box::new(RpcBlock {
                    header: sample_header(0x207fffff),
                    transactions: vec![],
                }),
            },
        ];
        let labels: Vec<_> = verdicts.iter().map(ShareVerdict::label).collect();
        assert_eq!(labels, ShareVerdict::LABELS);
    }

    #[test]
    fn recent_shares_are_bounded() {
        let mut recent = RecentShares::new(2);
        assert!(recent.insert(1, 1));
        assert!(recent.insert(1, 2));
        assert!(!recent.insert(1, 2));
        assert!(recent.insert(1, 3));
        assert_eq!(recent.len(), 2);
        // (1,1) fell out of the window.
        assert!(recent.insert(1, 1));
    }

    #[test]
    fn pow_comparison_is_integer_exact() {
        let t = Difficulty::new(3).to_target();
        let just_over = Target::from_le_bytes(&{
            let mut b = t.to_le_bytes();
            b[0] = b[0].wrapping_add(1);
            b
        });
        assert!(t.is_met_by(&t));
        assert!(!t.is_met_by(&just_over));
    }
}
