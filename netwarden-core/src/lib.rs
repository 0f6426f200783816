//! Netwarden Core Library
//!
//! Shared types, storage, and the traffic decision engine for the Netwarden
//! per-application firewall.

pub mod apps;
pub mod classifier;
pub mod config;
pub mod database;
pub mod error;
pub mod log_batcher;
pub mod registry;
pub mod rule_cache;
pub mod store;
pub mod traffic;
pub mod transport;
pub mod tunnel;
pub mod types;

pub use error::{NetwardenError, Result};
pub use types::*;
