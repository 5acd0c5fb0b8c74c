use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder};
use std::sync::OnceLock;

use crate::shares::ShareVerdict;

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_SUBMITTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_REFUSED: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOBS_PUBLISHED: OnceLock<IntCounter> = OnceLock::new();
static JOB_NOTIFICATIONS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounterVec> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static CAPACITY_REJECTIONS: OnceLock<IntCounter> = OnceLock::new();
static PROTOCOL_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static NETWORK_DIFFICULTY: OnceLock<IntGauge> = OnceLock::new();

// ── Per-worker labeled metrics ─────────────────────────────────────
static WORKER_SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static WORKER_DIFFICULTY: OnceLock<IntGaugeVec> = OnceLock::new();

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("bridge_shares_total", "Submitted shares by classification"),
            &["class"],
        )
        .unwrap()
    })
}

fn blocks_submitted() -> &'static IntCounter {
    BLOCKS_SUBMITTED.get_or_init(|| {
        IntCounter::new("bridge_blocks_submitted_total", "Blocks forwarded to the node").unwrap()
    })
}

fn blocks_accepted() -> &'static IntCounter {
    BLOCKS_ACCEPTED.get_or_init(|| {
        IntCounter::new("bridge_blocks_accepted_total", "Blocks accepted by the node").unwrap()
    })
}

fn blocks_rejected() -> &'static IntCounter {
    BLOCKS_REJECTED.get_or_init(|| {
        IntCounter::new("bridge_blocks_rejected_total", "Blocks rejected by the node").unwrap()
    })
}

fn blocks_refused() -> &'static IntCounter {
    BLOCKS_REFUSED.get_or_init(|| {
        IntCounter::new(
            "bridge_blocks_refused_total",
            "Block candidates not forwarded because the template was stale",
        )
        .unwrap()
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new("bridge_vardiff_retargets_total", "Total VarDiff retarget events").unwrap()
    })
}

fn jobs_published() -> &'static IntCounter {
    JOBS_PUBLISHED.get_or_init(|| {
        IntCounter::new("bridge_jobs_published_total", "Templates published as new jobs").unwrap()
    })
}

fn job_notifications() -> &'static IntCounter {
    JOB_NOTIFICATIONS.get_or_init(|| {
        IntCounter::new("bridge_job_notifications_total", "Total mining.notify messages sent").unwrap()
    })
}

fn rpc_requests() -> &'static IntCounterVec {
    RPC_REQUESTS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("bridge_rpc_requests_total", "RPC requests to the node"),
            &["method"],
        )
        .unwrap()
    })
}

fn rpc_errors() -> &'static IntCounterVec {
    RPC_ERRORS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("bridge_rpc_errors_total", "Failed node calls"),
            &["op"],
        )
        .unwrap()
    })
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounter::new(
            "bridge_template_fetch_errors_total",
            "Template refreshes that failed",
        )
        .unwrap()
    })
}

fn capacity_rejections() -> &'static IntCounter {
    CAPACITY_REJECTIONS.get_or_init(|| {
        IntCounter::new(
            "bridge_capacity_rejections_total",
            "Connections refused because the extranonce space was exhausted",
        )
        .unwrap()
    })
}

fn protocol_errors() -> &'static IntCounter {
    PROTOCOL_ERRORS.get_or_init(|| {
        IntCounter::new("bridge_protocol_errors_total", "Sessions closed for protocol errors").unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| {
        IntGauge::new("bridge_active_sessions", "Active Stratum sessions").unwrap()
    })
}

fn network_difficulty() -> &'static IntGauge {
    NETWORK_DIFFICULTY.get_or_init(|| {
        IntGauge::new("bridge_network_difficulty", "Difficulty of the current template").unwrap()
    })
}

fn worker_shares() -> &'static IntCounterVec {
    WORKER_SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("bridge_worker_shares_total", "Shares per worker"),
            &["worker", "wallet", "class"],
        )
        .unwrap()
    })
}

fn worker_difficulty() -> &'static IntGaugeVec {
    WORKER_DIFFICULTY.get_or_init(|| {
        IntGaugeVec::new(
            Opts::new("bridge_worker_difficulty", "Current share difficulty per worker"),
            &["worker"],
        )
        .unwrap()
    })
}

pub fn inc_share(class: &str, worker: &str, wallet: &str) {
    shares().with_label_values(&[class]).inc();
    worker_shares().with_label_values(&[worker, wallet, class]).inc();
}

pub fn inc_block_submitted() {
    blocks_submitted().inc();
}

pub fn inc_block_accepted() {
    blocks_accepted().inc();
}

pub fn inc_block_rejected() {
    blocks_rejected().inc();
}

pub fn inc_block_refused() {
    blocks_refused().inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_jobs_published() {
    jobs_published().inc();
}

pub fn inc_job_notifications() {
    job_notifications().inc();
}

pub fn inc_rpc_requests(method: &str) {
    rpc_requests().with_label_values(&[method]).inc();
}

pub fn inc_rpc_errors(op: &str) {
    rpc_errors().with_label_values(&[op]).inc();
}

pub fn inc_template_failures() {
    template_fetch_errors().inc();
}

pub fn inc_capacity_rejections() {
    capacity_rejections().inc();
}

pub fn inc_protocol_errors() {
    protocol_errors().inc();
}

pub fn inc_sessions() {
    active_sessions().inc();
}

pub fn dec_sessions() {
    active_sessions().dec();
}

pub fn set_network_difficulty(difficulty: u64) {
    network_difficulty().set(difficulty.min(i64::MAX as u64) as i64);
}

pub fn set_worker_difficulty(worker: &str, difficulty: u64) {
    worker_difficulty()
        .with_label_values(&[worker])
        .set(difficulty.min(i64::MAX as u64) as i64);
}

/// Remove every label set of a departed worker (cardinality control)
pub fn remove_worker(worker: &str, wallet: &str) {
    let _ = worker_difficulty().remove_label_values(&[worker]);
    for class in ShareVerdict::LABELS {
        let _ = worker_shares().remove_label_values(&[worker, wallet, class]);
    }
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(shares().collect());
    mfs.extend(blocks_submitted().collect());
    mfs.extend(blocks_accepted().collect());
    mfs.extend(blocks_rejected().collect());
    mfs.extend(blocks_refused().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(jobs_published().collect());
    mfs.extend(job_notifications().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(capacity_rejections().collect());
    mfs.extend(protocol_errors().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(network_difficulty().collect());

    // Per-worker labeled metrics
    mfs.extend(worker_shares().collect());
    mfs.extend(worker_difficulty().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_touched_metrics() {
        inc_share("valid", "metrics-test-rig", "spectre:qq");
        inc_block_submitted();
        set_worker_difficulty("metrics-test-rig", 4096);
        let out = render();
        assert!(out.contains("bridge_shares_total{class=\"valid\"}"));
        assert!(out.contains("bridge_blocks_submitted_total"));
        assert!(out.contains("bridge_worker_difficulty{worker=\"metrics-test-rig\"} 4096"));

        remove_worker("metrics-test-rig", "spectre:qq");
        assert!(!render().contains("bridge_worker_difficulty{worker=\"metrics-test-rig\"}"));
    }

    #[test]
    fn departed_worker_leaves_no_share_series() {
        inc_share("valid", "gone-rig", "spectre:qqgone");
        inc_share("low_difficulty", "gone-rig", "spectre:qqgone");
        inc_share("stale", "gone-rig", "spectre:qqgone");
        inc_share("valid", "staying-rig", "spectre:qqgone");
        assert!(render().contains("worker=\"gone-rig\""));

        remove_worker("gone-rig", "spectre:qqgone");
        let out = render();
        assert!(!out.contains("worker=\"gone-rig\""));
        assert!(out.contains("worker=\"staying-rig\""));
    }
}
