/// Per-connection Stratum task
///
/// Each miner connection runs one task that owns its [`Session`]. Lines from
/// the miner, job pushes from the template cache, vardiff ticks and shutdown
/// are handled in one `select!` loop, so a session never validates two shares
/// at once. Writes go through a bounded queue to a separate writer task; a
/// miner that stops reading fills it and is dropped.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    JobFormat, StratumError, StratumNotification, StratumRequest, StratumResponse, SubmitParams,
    PROTOCOL_VERSION,
};
use super::session::{transition, Session, SessionEvent, SessionState};
use crate::banned::BannedWallets;
use crate::blockchain::{NodeHandle, RpcBlock, SubmitOutcome, TemplateCache, TemplateSnapshot};
use crate::error::{BridgeError, Result};
use crate::extranonce::{Extranonce, ExtranonceAllocator, ExtranonceLease};
use crate::metrics::prometheus as metrics;
use crate::shares::{Share, ShareValidator, ShareVerdict};
use crate::stats::{StatsBoard, WorkerStats};
use crate::vardiff::VarDiffConfig;

/// Settings every session is created with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub vardiff: VarDiffConfig,
    pub recent_shares: usize,
    /// Wallet mined to when the requested one is banned.
    pub default_wallet: String,
    pub idle_timeout: Duration,
    /// Block candidates are refused once the newest template is this old.
    pub template_max_age: Duration,
}

/// State shared by all session tasks.
pub struct BridgeContext {
    pub cache: Arc<TemplateCache>,
    pub node: Arc<NodeHandle>,
    pub allocator: Arc<ExtranonceAllocator>,
    pub validator: ShareValidator,
    pub banned: Arc<BannedWallets>,
    pub stats: Arc<StatsBoard>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Disconnected,
    IdleTimeout,
    Shutdown,
    /// Template publisher went away.
    Upstream,
    /// Outbound queue filled up; the miner is not reading.
    Lagging,
    Io(String),
    Protocol(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "closed by miner"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Shutdown => write!(f, "bridge shutting down"),
            Self::Upstream => write!(f, "template feed closed"),
            Self::Lagging => write!(f, "miner stopped reading"),
            Self::Io(e) => write!(f, "read error: {}", e),
            Self::Protocol(e) => write!(f, "{}", e),
        }
    }
}

/// Messages queued for the writer task before a miner counts as not reading.
const OUTBOUND_QUEUE: usize = 256;

/// Bounded line queue to the writer task. Never blocks the session: a full
/// queue marks the connection as lagging instead.
struct Outbound {
    tx: mpsc::Sender<String>,
    lagging: AtomicBool,
}

impl Outbound {
    fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            lagging: AtomicBool::new(false),
        }
    }

    fn send(&self, line: String) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(line) {
            self.lagging.store(true, Ordering::Relaxed);
        }
    }

    fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Relaxed)
    }
}

/// Serve one miner until it disconnects, misbehaves or `cancel` fires.
pub async fn serve(
    ctx: Arc<BridgeContext>,
    id: u64,
    socket: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> CloseReason {
    let (reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if writer.write_all(msg.as_bytes()).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
        let _ = writer.shutdown().await;
    });

    metrics::inc_sessions();
    tracing::info!(session = id, %peer, "🔌 Miner connected");

    let mut conn = Connection::new(ctx, id, peer, Outbound::new(tx));
    let reason = conn.run(BufReader::new(reader), cancel).await;
    conn.close(&reason);
    drop(conn);

    // Flush whatever was queued (e.g. the error that closed the session).
    if time::timeout(Duration::from_secs(5), &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    metrics::dec_sessions();
    reason
}

struct Connection {
    ctx: Arc<BridgeContext>,
    session: Session,
    lease: Option<ExtranonceLease>,
    out: Outbound,
    /// `(worker, wallet)` labels this session reports metrics under.
    metric_series: Option<(String, String)>,
}

impl Connection {
    fn new(
        ctx: Arc<BridgeContext>,
        id: u64,
        peer: SocketAddr,
        out: Outbound,
    ) -> Self {
        let session = Session::new(
            id,
            peer,
            ctx.settings.vardiff,
            ctx.settings.recent_shares,
            Instant::now(),
        );
        Self {
            ctx,
            session,
            lease: None,
            out,
            metric_series: None,
        }
    }

    fn is_mining(&self) -> bool {
        matches!(
            self.session.state(),
            SessionState::Authorized | SessionState::Mining
        )
    }

    async fn run<R>(&mut self, reader: BufReader<R>, cancel: CancellationToken) -> CloseReason
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut jobs = self.ctx.cache.subscribe();

        let tick = self.ctx.settings.vardiff.tick;
        let mut vardiff = time::interval_at(time::Instant::now() + tick, tick);
        vardiff.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let idle = self.ctx.settings.idle_timeout;
        let mut idle_deadline = time::Instant::now() + idle;

        loop {
            if self.out.is_lagging() {
                return CloseReason::Lagging;
            }
            let mining = self.is_mining();
            let retargeting = mining && self.ctx.settings.vardiff.enabled;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return CloseReason::Shutdown,

                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        idle_deadline = time::Instant::now() + idle;
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::debug!(session = self.session.id, "📨 {}", line);
                        if let Err(e) = self.handle_line(line).await {
                            return CloseReason::Protocol(e.to_string());
                        }
                    }
                    Ok(None) => return CloseReason::Disconnected,
                    Err(e) => return CloseReason::Io(e.to_string()),
                },

                changed = jobs.changed(), if mining => {
                    if changed.is_err() {
                        return CloseReason::Upstream;
                    }
                    let snapshot = Arc::clone(&jobs.borrow_and_update());
                    if let Err(e) = self.push_job(&snapshot) {
                        return CloseReason::Protocol(e.to_string());
                    }
                }

                _ = vardiff.tick(), if retargeting => self.on_vardiff_tick(),

                _ = time::sleep_until(idle_deadline) => return CloseReason::IdleTimeout,
            }
        }
    }

    /// Handle one request. An error closes the session.
    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let request: StratumRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                self.reply_error(Value::Null, StratumError::other("Malformed request"));
                return Err(BridgeError::protocol(format!("malformed request: {}", e)));
            }
        };

        match request.method.as_str() {
            "mining.subscribe" => self.on_subscribe(&request),
            "mining.extranonce.subscribe" => {
                self.reply(request.id.clone(), json!(true));
                Ok(())
            }
            "mining.authorize" => self.on_authorize(&request),
            "mining.submit" => self.on_submit(&request).await,
            other => {
                self.reply_error(request.id.clone(), StratumError::invalid_method(other));
                Err(BridgeError::protocol(format!("unknown method '{}'", other)))
            }
        }
    }

    fn on_subscribe(&mut self, req: &StratumRequest) -> Result<()> {
        let state = self.session.state();
        if let Err(e) = transition(state, SessionEvent::Subscribe) {
            self.reply_error(req.id.clone(), state.rejection_for(SessionEvent::Subscribe));
            return Err(e);
        }

        let lease = match self.ctx.allocator.lease() {
            Ok(lease) => lease,
            Err(e) => {
                metrics::inc_capacity_rejections();
                tracing::warn!(session = self.session.id, "🚫 Extranonce space exhausted");
                self.reply_error(req.id.clone(), e.to_stratum());
                return Err(e);
            }
        };
        let extranonce = lease.extranonce();
        self.session.subscribe(req.str_param(0), extranonce)?;
        self.lease = Some(lease);

        self.reply(req.id.clone(), json!([true, PROTOCOL_VERSION]));
        self.push(&StratumNotification::set_extranonce(
            &extranonce.to_hex(),
            extranonce.bytes_left(),
        ));

        tracing::info!(
            session = self.session.id,
            agent = self.session.user_agent.as_deref().unwrap_or("unknown"),
            extranonce = %extranonce.to_hex(),
            hex_jobs = self.session.job_format == JobFormat::Hex,
            "✅ Miner subscribed"
        );
        Ok(())
    }

    fn on_authorize(&mut self, req: &StratumRequest) -> Result<()> {
        let state = self.session.state();
        if let Err(e) = transition(state, SessionEvent::Authorize) {
            self.reply_error(req.id.clone(), state.rejection_for(SessionEvent::Authorize));
            return Err(e);
        }

        let Some(identity) = req.str_param(0) else {
            self.reply_error(
                req.id.clone(),
                StratumError::invalid_params("missing wallet address"),
            );
            return Ok(());
        };

        let auth = match self.session.authorize(
            identity,
            &self.ctx.banned,
            &self.ctx.settings.default_wallet,
        ) {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(session = self.session.id, "❌ Authorize refused: {}", e);
                self.reply_error(
                    req.id.clone(),
                    StratumError::new(StratumError::UNAUTHORIZED, e.to_string()),
                );
                return Ok(());
            }
        };

        if auth.substituted {
            tracing::warn!(
                session = self.session.id,
                requested = identity,
                wallet = %auth.wallet,
                "🚫 Banned wallet, mining to default wallet"
            );
        }
        tracing::info!(
            session = self.session.id,
            wallet = %auth.wallet,
            worker = auth.worker.as_deref().unwrap_or("-"),
            "🔐 Miner authorized"
        );

        let label = self.session.worker_label();
        let series = (label.clone(), auth.wallet.clone());
        if let Some(old) = self.metric_series.replace(series.clone()) {
            if old != series {
                metrics::remove_worker(&old.0, &old.1);
            }
        }

        self.reply(req.id.clone(), json!(true));
        if state == SessionState::Subscribed {
            let difficulty = self.session.difficulty();
            self.push(&StratumNotification::set_difficulty(difficulty));
            metrics::set_worker_difficulty(&label, difficulty.value());
            let snapshot = self.ctx.cache.current();
            self.push_job(&snapshot)?;
        }
        self.publish_stats();
        Ok(())
    }

    async fn on_submit(&mut self, req: &StratumRequest) -> Result<()> {
        let id = req.id.clone();
        let state = self.session.state();
        if let Err(e) = transition(state, SessionEvent::Submit) {
            self.reply_error(id, state.rejection_for(SessionEvent::Submit));
            return Err(e);
        }

        let params = match SubmitParams::parse(req) {
            Ok(p) => p,
            Err(msg) => {
                self.reply_error(id, StratumError::invalid_params(msg.clone()));
                return Err(BridgeError::protocol(msg));
            }
        };

        let extranonce = self.session.extranonce().unwrap_or(Extranonce::EMPTY);
        let nonce = match extranonce.complete_nonce(&params.nonce_hex) {
            Ok(n) => n,
            Err(e) => {
                self.reply_error(id, e.to_stratum());
                return Err(e);
            }
        };

        let worker = self.session.worker_label();
        let share = Share {
            job_id: params.job_id,
            nonce,
            extranonce,
            worker: worker.clone(),
            received_at: Instant::now(),
        };
        let snapshot = self.ctx.cache.current();
        let verdict = self
            .session
            .submit(&self.ctx.validator, &snapshot, &share)?;

        let wallet = self.session.wallet().unwrap_or_default().to_string();
        metrics::inc_share(verdict.label(), &worker, &wallet);

        match verdict {
            ShareVerdict::ValidShare { achieved } => {
                tracing::debug!(
                    session = self.session.id,
                    job_id = share.job_id,
                    %achieved,
                    "✅ Share accepted"
                );
                self.reply(id, json!(true));
            }
            ShareVerdict::ValidBlock { achieved, block } => {
                tracing::info!(
                    session = self.session.id,
                    worker = %worker,
                    job_id = share.job_id,
                    nonce = format_args!("{:016x}", nonce),
                    %achieved,
                    "💎 Block candidate found"
                );
                match self.forward_block(*block).await {
                    Ok(()) => self.reply(id, json!(true)),
                    Err(e) => self.reply_error(id, e.to_stratum()),
                }
            }
            rejected => {
                if let Some(err) = rejected.rejection(share.job_id) {
                    tracing::warn!(
                        session = self.session.id,
                        worker = %worker,
                        job_id = share.job_id,
                        "⚠️  Share rejected: {}",
                        err
                    );
                    self.reply_error(id, err.to_stratum());
                }
            }
        }

        self.publish_stats();
        Ok(())
    }

    /// Hand a solved block to the node unless the template feed has gone stale.
    async fn forward_block(&self, block: RpcBlock) -> Result<()> {
        let max_age = self.ctx.settings.template_max_age;
        if self.ctx.cache.is_stale(max_age) {
            metrics::inc_block_refused();
            tracing::warn!(
                session = self.session.id,
                "⚠️  Block not submitted, no fresh template within {}s",
                max_age.as_secs()
            );
            return Err(BridgeError::UpstreamUnavailable(
                "template older than staleness bound".into(),
            ));
        }

        metrics::inc_block_submitted();
        let daa_score = block.header.daa_score;
        match self.ctx.node.submit_block(&block).await {
            Ok(SubmitOutcome::Accepted) => {
                metrics::inc_block_accepted();
                tracing::info!(session = self.session.id, daa_score, "🎉 Block accepted by node");
                Ok(())
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                metrics::inc_block_rejected();
                tracing::warn!(session = self.session.id, daa_score, "❌ Block rejected: {}", reason);
                Ok(())
            }
            Err(e) => {
                metrics::inc_block_rejected();
                tracing::error!(session = self.session.id, daa_score, "Block submit failed: {}", e);
                Err(BridgeError::UpstreamUnavailable(e.to_string()))
            }
        }
    }

    fn push_job(&mut self, snapshot: &TemplateSnapshot) -> Result<()> {
        let Some(work) = snapshot.current() else {
            return Ok(());
        };
        if !self.session.issue_job(work.job_id)? {
            return Ok(());
        }

        let notify = match self.session.job_format {
            JobFormat::Words => {
                StratumNotification::notify_words(work.job_id, work.notify_words(), work.timestamp)
            }
            JobFormat::Hex => StratumNotification::notify_hex(work.job_id, &work.header_hex()),
        };
        self.push(&notify);
        metrics::inc_job_notifications();
        tracing::debug!(session = self.session.id, job_id = work.job_id, "📤 Job sent");
        Ok(())
    }

    fn on_vardiff_tick(&mut self) {
        let Some(next) = self.session.vardiff_tick(Instant::now()) else {
            return;
        };
        let label = self.session.worker_label();
        metrics::inc_vardiff_retarget();
        metrics::set_worker_difficulty(&label, next.value());
        tracing::info!(
            session = self.session.id,
            worker = %label,
            difficulty = %next,
            "🎚️  VarDiff retarget"
        );
        self.push(&StratumNotification::set_difficulty(next));
        self.publish_stats();
    }

    fn publish_stats(&mut self) {
        let share_rate = self.session.observed_share_rate(Instant::now());
        let stats = WorkerStats {
            worker: self.session.worker_label(),
            wallet: self.session.wallet().unwrap_or_default().to_string(),
            difficulty: self.session.difficulty().value(),
            shares: self.session.stats,
            share_rate,
            connected_for: self.session.uptime(),
        };
        self.ctx.stats.update(self.session.id, stats);
    }

    fn close(&mut self, reason: &CloseReason) {
        self.session.close();
        // Dropping the lease returns the extranonce.
        self.lease = None;
        self.ctx.stats.remove(self.session.id);
        if let Some((worker, wallet)) = self.metric_series.take() {
            metrics::remove_worker(&worker, &wallet);
        }

        let stats = self.session.stats;
        match reason {
            CloseReason::Protocol(_) => {
                metrics::inc_protocol_errors();
                tracing::warn!(
                    session = self.session.id,
                    peer = %self.session.peer,
                    "🔌 Session closed: {}",
                    reason
                );
            }
            _ => tracing::info!(
                session = self.session.id,
                peer = %self.session.peer,
                accepted = stats.accepted,
                rejected = stats.rejected(),
                blocks = stats.blocks_found,
                "🔌 Session closed: {}",
                reason
            ),
        }
    }

    fn reply(&self, id: Value, result: Value) {
        self.send(&StratumResponse::success(id, result));
    }

    fn reply_error(&self, id: Value, error: StratumError) {
        self.send(&StratumResponse::error(id, error));
    }

    fn push(&self, notification: &StratumNotification) {
        self.send(notification);
    }

    fn send<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            Ok(payload) => self.out.send(payload + "\n"),
            Err(e) => tracing::error!("Failed to encode message: {}", e),
        }
    }
}
