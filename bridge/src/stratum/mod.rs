/// Stratum side of the bridge: wire protocol, per-miner sessions and the
/// coordinator that accepts them

pub mod connection;
pub mod protocol;
pub mod server;
pub mod session;

pub use connection::{BridgeContext, CloseReason, SessionSettings};
pub use protocol::{JobFormat, StratumError, StratumNotification, StratumRequest, StratumResponse};
pub use server::StratumBridge;
pub use session::{Session, SessionEvent, SessionState, SessionStats};
