/// Mining shares module
///
/// Share classification and per-session duplicate detection

pub mod validator;

pub use validator::{RecentShares, Share, ShareValidator, ShareVerdict};
