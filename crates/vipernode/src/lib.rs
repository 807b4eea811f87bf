//! vipernode - vipernet relay-service node
//!
//! This crate provides:
//! - Deterministic session derivation with per-identity caches
//! - Relay validation, evidence recording and upstream forwarding
//! - Claim/proof commit-reveal for relay and challenge evidence
//! - Fisherman QoS sampling and report submission
//! - An in-process devnet chain implementing every chain capability

pub mod cache;
pub mod challenge;
pub mod claims;
pub mod config;
pub mod devnet;
pub mod error;
pub mod fisherman;
pub mod interfaces;
pub mod metrics;
pub mod node;
pub mod relay;
pub mod reports;
pub mod runtime;
pub mod server;
pub mod session;
pub mod storage;

pub use config::Config;
pub use devnet::{DevnetChain, Genesis};
pub use error::{ErrorCode, ViperError};
pub use interfaces::ChainHandles;
pub use node::ViperNode;
pub use runtime::{Runtime, RuntimeSettings};
pub use server::Server;
pub use storage::Storage;
