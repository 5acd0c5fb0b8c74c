/// Miner session state
///
/// One `Session` per TCP connection, owned exclusively by that connection's
/// task. Protocol progress is an explicit state machine:
///
/// ```text
/// Connected -> Subscribed -> Authorized -> Mining -> Closed
/// ```
///
/// driven by [`transition`], so ordering rules can be tested without sockets.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::protocol::{JobFormat, StratumError};
use crate::banned::{split_identity, BannedWallets};
use crate::blockchain::TemplateSnapshot;
use crate::difficulty::Difficulty;
use crate::error::{BridgeError, Result};
use crate::extranonce::Extranonce;
use crate::shares::{RecentShares, Share, ShareValidator, ShareVerdict};
use crate::vardiff::{DifficultySchedule, VarDiffConfig, VarDiffState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Initial state after connection
    Connected,
    /// Extranonce assigned
    Subscribed,
    /// Wallet accepted, waiting for the first job
    Authorized,
    /// At least one job sent
    Mining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Subscribe,
    Authorize,
    JobIssued,
    Submit,
    Violation,
    Disconnect,
}

/// Next state for `event` in `state`, or a protocol error if the event is out of order.
pub fn transition(state: SessionState, event: SessionEvent) -> Result<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Closed, _) => Err(BridgeError::protocol("session is closed")),
        (_, E::Violation | E::Disconnect) => Ok(S::Closed),

        (S::Connected, E::Subscribe) => Ok(S::Subscribed),
        (_, E::Subscribe) => Err(BridgeError::protocol("already subscribed")),

        (S::Subscribed, E::Authorize) => Ok(S::Authorized),
        // Extra workers on one connection.
        (S::Authorized | S::Mining, E::Authorize) => Ok(state),
        (S::Connected, E::Authorize) => Err(BridgeError::protocol("authorize before subscribe")),

        (S::Authorized | S::Mining, E::JobIssued) => Ok(S::Mining),
        (_, E::JobIssued) => Err(BridgeError::protocol("job issued before authorize")),

        (S::Authorized | S::Mining, E::Submit) => Ok(state),
        (_, E::Submit) => Err(BridgeError::protocol("submit before authorize")),
    }
}

impl SessionState {
    /// Error object for an event rejected in this state.
    pub fn rejection_for(self, event: SessionEvent) -> StratumError {
        match (self, event) {
            (SessionState::Connected, _) => StratumError::not_subscribed(),
            (_, SessionEvent::Submit) => StratumError::unauthorized(),
            _ => StratumError::other("Unexpected message"),
        }
    }
}

/// Per-session share counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub accepted: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub low_difficulty: u64,
    pub blocks_found: u64,
}

impl SessionStats {
    pub fn rejected(&self) -> u64 {
        self.stale + self.duplicate + self.low_difficulty
    }

    fn record(&mut self, verdict: &ShareVerdict) {
        match verdict {
            ShareVerdict::Stale => self.stale += 1,
            ShareVerdict::Duplicate => self.duplicate += 1,
            ShareVerdict::LowDifficulty { .. } => self.low_difficulty += 1,
            ShareVerdict::ValidShare { .. } => self.accepted += 1,
            ShareVerdict::ValidBlock { .. } => {
                self.accepted += 1;
                self.blocks_found += 1;
            }
        }
    }
}

/// Result of a successful authorize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub wallet: String,
    pub worker: Option<String>,
    /// The requested wallet was banned and replaced by the default wallet.
    pub substituted: bool,
}

/// Address prefixes accepted on authorize.
const ADDRESS_PREFIXES: [&str; 4] = ["spectre:", "spectretest:", "spectresim:", "spectredev:"];

pub fn is_valid_wallet(address: &str) -> bool {
    ADDRESS_PREFIXES.iter().any(|prefix| {
        address
            .strip_prefix(prefix)
            .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or(false)
    })
}

pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    state: SessionState,
    pub user_agent: Option<String>,
    pub job_format: JobFormat,
    wallet: Option<String>,
    worker: Option<String>,
    extranonce: Option<Extranonce>,
    schedule: DifficultySchedule,
    vardiff: VarDiffState,
    recent: RecentShares,
    last_job_id: Option<u64>,
    pub stats: SessionStats,
    connected_at: Instant,
}

impl Session {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        vardiff: VarDiffConfig,
        recent_capacity: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Connected,
            user_agent: None,
            job_format: JobFormat::default(),
            wallet: None,
            worker: None,
            extranonce: None,
            schedule: DifficultySchedule::new(vardiff.min_difficulty),
            vardiff: VarDiffState::new(vardiff, now),
            recent: RecentShares::new(recent_capacity),
            last_job_id: None,
            stats: SessionStats::default(),
            connected_at: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply an event; on error the state is left unchanged.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState> {
        self.state = transition(self.state, event)?;
        Ok(self.state)
    }

    pub fn subscribe(&mut self, agent: Option<&str>, extranonce: Extranonce) -> Result<()> {
        self.apply(SessionEvent::Subscribe)?;
        if let Some(agent) = agent {
            self.job_format = JobFormat::from_agent(agent);
            self.user_agent = Some(agent.to_string());
        }
        self.extranonce = Some(extranonce);
        Ok(())
    }

    /// Authorize `wallet[.worker]`, substituting `default_wallet` for a banned wallet.
    pub fn authorize(
        &mut self,
        identity: &str,
        banned: &BannedWallets,
        default_wallet: &str,
    ) -> Result<Authorization> {
        transition(self.state, SessionEvent::Authorize)?;

        let (wallet, worker) = split_identity(identity);
        let wallet = wallet.to_lowercase();
        let substituted = banned.is_banned(&wallet);
        let wallet = if substituted {
            if default_wallet.is_empty() {
                return Err(BridgeError::protocol(format!(
                    "wallet {} is banned and no default wallet is configured",
                    wallet
                )));
            }
            default_wallet.to_string()
        } else {
            if !is_valid_wallet(&wallet) {
                return Err(BridgeError::protocol(format!("invalid wallet address '{}'", wallet)));
            }
            wallet
        };

        self.apply(SessionEvent::Authorize)?;
        self.wallet = Some(wallet.clone());
        self.worker = worker.map(str::to_string);
        Ok(Authorization {
            wallet,
            worker: self.worker.clone(),
            substituted,
        })
    }

    /// Record that `job_id` is being sent. Returns `false` if it was already sent.
    pub fn issue_job(&mut self, job_id: u64) -> Result<bool> {
        if self.last_job_id == Some(job_id) {
            return Ok(false);
        }
        self.apply(SessionEvent::JobIssued)?;
        self.schedule.job_issued(job_id);
        self.last_job_id = Some(job_id);
        Ok(true)
    }

    /// Classify a share and feed the outcome into counters and vardiff.
    pub fn submit(
        &mut self,
        validator: &ShareValidator,
        snapshot: &TemplateSnapshot,
        share: &Share,
    ) -> Result<ShareVerdict> {
        self.apply(SessionEvent::Submit)?;
        let verdict = validator.validate(snapshot, &self.schedule, &mut self.recent, share);
        self.stats.record(&verdict);
        if verdict.is_accepted() {
            self.vardiff.record_share(share.received_at);
        }
        Ok(verdict)
    }

    /// Run the vardiff controller. Raising binds from the next job issued; lowering applies at once.
    pub fn vardiff_tick(&mut self, now: Instant) -> Option<Difficulty> {
        let next = self.vardiff.tick(now, self.schedule.current())?;
        self.schedule.retarget(next);
        Some(next)
    }

    /// Mark closed and hand back the extranonce for release.
    pub fn close(&mut self) -> Option<Extranonce> {
        self.state = SessionState::Closed;
        self.extranonce.take()
    }

    pub fn difficulty(&self) -> Difficulty {
        self.schedule.current()
    }

    pub fn required_difficulty(&self, job_id: u64) -> Difficulty {
        self.schedule.required_for(job_id)
    }

    pub fn extranonce(&self) -> Option<Extranonce> {
        self.extranonce
    }

    pub fn wallet(&self) -> Option<&str> {
        self.wallet.as_deref()
    }

    pub fn last_job_id(&self) -> Option<u64> {
        self.last_job_id
    }

    pub fn observed_share_rate(&mut self, now: Instant) -> f64 {
        self.vardiff.observed_rate(now)
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// `worker` if named, otherwise the peer address.
    pub fn worker_label(&self) -> String {
        match &self.worker {
            Some(w) => w.clone(),
            None => self.peer.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            1,
            "127.0.0.1:5555".parse().unwrap(),
            VarDiffConfig::default(),
            128,
            Instant::now(),
        )
    }

    #[test]
    fn happy_path_transitions() {
        use SessionEvent as E;
        use SessionState as S;
        let mut s = S::Connected;
        for (event, expected) in [
            (E::Subscribe, S::Subscribed),
            (E::Authorize, S::Authorized),
            (E::JobIssued, S::Mining),
            (E::Submit, S::Mining),
            (E::JobIssued, S::Mining),
            (E::Disconnect, S::Closed),
        ] {
            s = transition(s, event).unwrap();
            assert_eq!(s, expected);
        }
    }

    #[test]
    fn out_of_order_events_are_protocol_errors() {
        use SessionEvent as E;
        use SessionState as S;
        assert!(transition(S::Connected, E::Authorize).is_err());
        assert!(transition(S::Connected, E::Submit).is_err());
        assert!(transition(S::Subscribed, E::Submit).is_err());
        assert!(transition(S::Mining, E::Subscribe).is_err());
        assert!(transition(S::Closed, E::Subscribe).is_err());
        assert!(transition(S::Subscribed, E::JobIssued).is_err());
        assert_eq!(transition(S::Subscribed, E::Violation).unwrap(), S::Closed);

        assert_eq!(
            S::Connected.rejection_for(E::Authorize).code,
            StratumError::NOT_SUBSCRIBED
        );
        assert_eq!(
            S::Subscribed.rejection_for(E::Submit).code,
            StratumError::UNAUTHORIZED
        );
    }

    #[test]
    fn subscribe_assigns_extranonce_and_min_difficulty() {
        let mut s = session();
        s.subscribe(Some("GodMiner/1.0"), Extranonce::EMPTY).unwrap();
        assert_eq!(s.state(), SessionState::Subscribed);
        assert_eq!(s.extranonce(), Some(Extranonce::EMPTY));
        assert_eq!(s.job_format, JobFormat::Hex);
        assert_eq!(s.difficulty(), VarDiffConfig::default().min_difficulty);
        assert!(s.subscribe(None, Extranonce::EMPTY).is_err());
    }

    #[test]
    fn banned_wallet_is_substituted() {
        let banned = BannedWallets::from_wallets(["spectre:qqbanned"]);
        let mut s = session();
        s.subscribe(None, Extranonce::EMPTY).unwrap();
        let auth = s
            .authorize("spectre:qqbanned.rig7", &banned, "spectre:qqdefault")
            .unwrap();
        assert!(auth.substituted);
        assert_eq!(auth.wallet, "spectre:qqdefault");
        assert_eq!(auth.worker.as_deref(), Some("rig7"));
        assert_eq!(s.wallet(), Some("spectre:qqdefault"));
        assert_eq!(s.state(), SessionState::Authorized);
    }

    #[test]
    fn banned_wallet_without_default_is_refused() {
        let banned = BannedWallets::from_wallets(["spectre:qqbanned"]);
        let mut s = session();
        s.subscribe(None, Extranonce::EMPTY).unwrap();
        assert!(s.authorize("spectre:qqbanned", &banned, "").is_err());
        assert_eq!(s.state(), SessionState::Subscribed);
    }

    #[test]
    fn invalid_wallet_is_refused() {
        let mut s = session();
        s.subscribe(None, Extranonce::EMPTY).unwrap();
        assert!(s.authorize("kaspa:qqq", &BannedWallets::default(), "").is_err());
        assert!(s.authorize("spectre:", &BannedWallets::default(), "").is_err());
        assert!(s.authorize("spectre:qq-bad", &BannedWallets::default(), "").is_err());
        assert!(is_valid_wallet("spectretest:qz0abc"));
    }

    #[test]
    fn vardiff_tick_retargets_and_binds_from_next_job() {
        let start = Instant::now();
        let mut s = Session::new(
            1,
            "127.0.0.1:5555".parse().unwrap(),
            VarDiffConfig::default(),
            128,
            start,
        );
        s.subscribe(None, Extranonce::EMPTY).unwrap();
        s.authorize("spectre:qqminer", &BannedWallets::default(), "").unwrap();
        s.issue_job(1).unwrap();
        assert_eq!(s.vardiff_tick(start + Duration::from_secs(5)), None);

        for i in 0..60 {
            s.vardiff.record_share(start + Duration::from_millis(100 * i));
        }
        let raised = s.vardiff_tick(start + Duration::from_secs(10)).unwrap();
        assert_eq!(raised, Difficulty::new(256));
        assert_eq!(s.difficulty(), raised);
        assert_eq!(s.required_difficulty(1), Difficulty::new(64));

        s.issue_job(2).unwrap();
        assert_eq!(s.required_difficulty(1), Difficulty::new(64));
        assert_eq!(s.required_difficulty(2), raised);
    }

    #[test]
    fn issue_job_is_idempotent_per_id() {
        let mut s = session();
        s.subscribe(None, Extranonce::EMPTY).unwrap();
        s.authorize("spectre:qqminer", &BannedWallets::default(), "").unwrap();
        assert!(s.issue_job(1).unwrap());
        assert!(!s.issue_job(1).unwrap());
        assert!(s.issue_job(2).unwrap());
        assert_eq!(s.state(), SessionState::Mining);
        assert_eq!(s.last_job_id(), Some(2));
    }

    #[test]
    fn close_returns_extranonce_once() {
        let mut s = session();
        s.subscribe(None, Extranonce::EMPTY).unwrap();
        assert_eq!(s.close(), Some(Extranonce::EMPTY));
        assert_eq!(s.close(), None);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn stats_count_blocks_as_accepted() {
        let mut stats = SessionStats::default();
        stats.record(&ShareVerdict::Stale);
        stats.record(&ShareVerdict::ValidShare {
            achieved: Difficulty::new(10),
        });
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected(), 1);
    }
}
