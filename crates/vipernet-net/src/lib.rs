//! Networking primitives for vipernet nodes
//!
//! This crate provides:
//! - Node signing keypair management
//! - Hosted-chain configuration
//! - HTTP forwarding to hosted chains and peer servicers
//! - WebSocket streaming to hosted chains

pub mod chains;
pub mod crypto;
pub mod upstream;
pub mod websocket;

pub use chains::{BasicAuth, ChainsError, HostedChain, HostedChains};
pub use crypto::{CryptoError, KeyPair};
pub use upstream::{UpstreamClient, UpstreamError};
