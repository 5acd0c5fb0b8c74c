/// Worker stats board
///
/// Sessions push a copy of their counters after every share and retarget; the
/// printer task renders the board into the log. Nothing reads it back into the
/// share path.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stratum::session::SessionStats;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub worker: String,
    pub wallet: String,
    pub difficulty: u64,
    pub shares: SessionStats,
    /// Accepted shares per minute over the vardiff window.
    pub share_rate: f64,
    pub connected_for: Duration,
}

#[derive(Debug)]
pub struct StatsBoard {
    workers: Mutex<BTreeMap<u64, WorkerStats>>,
    started: Instant,
}

impl Default for StatsBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsBoard {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    pub fn update(&self, session_id: u64, stats: WorkerStats) {
        self.workers.lock().insert(session_id, stats);
    }

    pub fn remove(&self, session_id: u64) {
        self.workers.lock().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<WorkerStats> {
        self.workers.lock().values().cloned().collect()
    }

    /// Share table with a totals row.
    pub fn render(&self) -> String {
        let rows = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:>10} {:>8} {:>6} {:>6} {:>6} {:>6} {:>10}",
            "worker", "diff", "accepted", "stale", "dup", "low", "blocks", "uptime"
        );

        let mut total = SessionStats::default();
        for row in &rows {
            let s = &row.shares;
            total.accepted += s.accepted;
            total.stale += s.stale;
            total.duplicate += s.duplicate;
            total.low_difficulty += s.low_difficulty;
            total.blocks_found += s.blocks_found;
            let _ = writeln!(
                out,
                "{:<24} {:>10} {:>8} {:>6} {:>6} {:>6} {:>6} {:>10}",
                truncate(&row.worker, 24),
                row.difficulty,
                s.accepted,
                s.stale,
                s.duplicate,
                s.low_difficulty,
                s.blocks_found,
                format_duration(row.connected_for),
            );
        }

        let _ = write!(
            out,
            "{:<24} {:>10} {:>8} {:>6} {:>6} {:>6} {:>6} {:>10}",
            format!("total ({} workers)", rows.len()),
            "",
            total.accepted,
            total.stale,
            total.duplicate,
            total.low_difficulty,
            total.blocks_found,
            format_duration(self.started.elapsed()),
        );
        out
    }

    /// Per-worker difficulty against the observed share rate.
    pub fn render_vardiff(&self, target_spm: f64) -> String {
        let mut out = String::new();
        let _ = write!(out, "{:<24} {:>10} {:>8} {:>8}", "worker", "diff", "spm", "target");
        for row in self.snapshot() {
            let _ = write!(
                out,
                "\n{:<24} {:>10} {:>8.2} {:>8.2}",
                truncate(&row.worker, 24),
                row.difficulty,
                row.share_rate,
                target_spm
            );
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Periodically log the board until cancelled.
pub fn spawn_printer(
    board: Arc<StatsBoard>,
    interval: Duration,
    print_stats: bool,
    vardiff_target_spm: Option<f64>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if print_stats {
                        tracing::info!("📊 Worker stats\n{}", board.render());
                    }
                    if let Some(spm) = vardiff_target_spm {
                        tracing::info!("🎚️  VarDiff\n{}", board.render_vardiff(spm));
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(worker: &str, accepted: u64, stale: u64) -> WorkerStats {
        WorkerStats {
            worker: worker.to_string(),
            wallet: "spectre:qq".to_string(),
            difficulty: 256,
            shares: SessionStats {
                accepted,
                stale,
                ..SessionStats::default()
            },
            share_rate: 18.5,
            connected_for: Duration::from_secs(3_725),
        }
    }

    #[test]
    fn render_totals_rows() {
        let board = StatsBoard::new();
        board.update(1, row("rig-a", 10, 1));
        board.update(2, row("rig-b", 5, 2));
        let table = board.render();
        assert!(table.contains("rig-a"));
        assert!(table.contains("1h02m05s"));
        let total = table.lines().last().unwrap();
        assert!(total.starts_with("total (2 workers)"));
        assert!(total.contains(" 15 "));

        board.remove(1);
        assert_eq!(board.len(), 1);
        assert!(!board.render().contains("rig-a"));
    }

    #[test]
    fn vardiff_readout_shows_rate() {
        let board = StatsBoard::new();
        board.update(7, row("rig-c", 1, 0));
        let out = board.render_vardiff(20.0);
        assert!(out.contains("rig-c"));
        assert!(out.contains("18.50"));
        assert!(out.contains("20.00"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        assert_eq!(truncate("žžžž", 2), "žž");
    }
}
