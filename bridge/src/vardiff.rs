use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::difficulty::Difficulty;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarDiffConfig {
    pub enabled: bool,
    /// Desired accepted shares per minute per session.
    pub shares_per_minute: f64,
    /// How often the session task evaluates the controller.
    pub tick: Duration,
    /// Trailing window of accepted-share timestamps.
    pub window: Duration,
    /// Ignore deviations inside `[1/(1+tolerance), 1+tolerance]` of the target rate.
    pub tolerance: f64,
    /// Largest single-step change factor.
    pub max_step: f64,
    /// Shares needed before retargeting ahead of a full window.
    pub min_samples: usize,
    pub min_difficulty: Difficulty,
    pub max_difficulty: Difficulty,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shares_per_minute: 20.0,
            tick: Duration::from_secs(10),
            window: Duration::from_secs(120),
            tolerance: 0.25,
            max_step: 4.0,
            min_samples: 6,
            min_difficulty: Difficulty::new(64),
            max_difficulty: Difficulty::new(1 << 40),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VarDiffState {
    cfg: VarDiffConfig,
    /// Start of the current observation period (session start or last retarget).
    observed_since: Instant,
    shares: VecDeque<Instant>,
}

impl VarDiffState {
    pub fn new(cfg: VarDiffConfig, now: Instant) -> Self {
        Self {
            cfg,
            observed_since: now,
            shares: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.cfg
    }

    /// Record an accepted share (valid share or block).
    pub fn record_share(&mut self, now: Instant) {
        self.shares.push_back(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.shares.front() {
            if now.saturating_duration_since(*front) > self.cfg.window {
                self.shares.pop_front();
            } else {
                break;
            }
        }
    }

    /// Observed accepted shares per minute over the current observation period.
    pub fn observed_rate(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let observed = now
            .saturating_duration_since(self.observed_since)
            .min(self.cfg.window);
        if observed.is_zero() {
            return 0.0;
        }
        self.shares.len() as f64 / (observed.as_secs_f64() / 60.0)
    }

    /// Evaluate the controller.
    ///
    /// Returns `Some(new_difficulty)` if a retarget occurred and difficulty changed.
    pub fn tick(&mut self, now: Instant, current: Difficulty) -> Option<Difficulty> {
        if !self.cfg.enabled {
            return None;
        }

        self.prune(now);
        let observed = now
            .saturating_duration_since(self.observed_since)
            .min(self.cfg.window);
        let samples = self.shares.len();
        if observed.is_zero() || (samples < self.cfg.min_samples && observed < self.cfg.window) {
            return None;
        }

        let target = self.cfg.shares_per_minute.max(f64::MIN_POSITIVE);
        let rate = samples as f64 / (observed.as_secs_f64() / 60.0);
        let ratio = rate / target;

        let upper = 1.0 + self.cfg.tolerance;
        if ratio >= 1.0 / upper && ratio <= upper {
            return None;
        }

        let step = self.cfg.max_step.max(1.0);
        let factor = if samples == 0 {
            1.0 / step
        } else {
            ratio.clamp(1.0 / step, step)
        };

        let next = current
            .scaled(factor)
            .clamp_to(self.cfg.min_difficulty, self.cfg.max_difficulty);

        self.observed_since = now;
        self.shares.clear();

        if next == current {
            None
        } else {
            Some(next)
        }
    }
}

/// Jobs remembered per session; older in-window jobs fall back to the current difficulty.
const TRACKED_JOBS: usize = 64;

/// Difficulty bound to a session, with the transition window after a retarget.
///
/// Each issued job remembers the difficulty in force when it went out. A share
/// must meet the lower of that and the current difficulty: an upward retarget
/// binds from the next job, a downward one applies at once because miners
/// adopt `mining.set_difficulty` immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DifficultySchedule {
    current: Difficulty,
    /// `(job id, difficulty at issue)`, oldest first.
    issued: VecDeque<(u64, Difficulty)>,
}

impl DifficultySchedule {
    pub fn new(initial: Difficulty) -> Self {
        Self {
            current: initial,
            issued: VecDeque::with_capacity(TRACKED_JOBS),
        }
    }

    pub fn current(&self) -> Difficulty {
        self.current
    }

    /// A retarget has not reached the miner through a job yet.
    pub fn is_pending(&self) -> bool {
        self.issued
            .back()
            .is_some_and(|(_, bound)| *bound != self.current)
    }

    pub fn retarget(&mut self, next: Difficulty) {
        self.current = next;
    }

    /// Record that `job_id` was sent to the miner at the current difficulty.
    pub fn job_issued(&mut self, job_id: u64) {
        if self.issued.back().is_some_and(|(id, _)| *id == job_id) {
            return;
        }
        self.issued.push_back((job_id, self.current));
        while self.issued.len() > TRACKED_JOBS {
            self.issued.pop_front();
        }
    }

    /// Difficulty a share for `job_id` must meet.
    pub fn required_for(&self, job_id: u64) -> Difficulty {
        self.issued
            .iter()
            .rev()
            .find(|(id, _)| *id == job_id)
            .map(|(_, at_issue)| (*at_issue).min(self.current))
            .unwrap_or(self.current)
    }
}
