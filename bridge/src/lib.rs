pub mod banned;
pub mod blockchain;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod extranonce;
pub mod metrics;
pub mod pow;
pub mod shares;
pub mod stats;
pub mod stratum;
pub mod vardiff;
