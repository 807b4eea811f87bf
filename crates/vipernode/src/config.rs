//! Configuration for vipernode

use crate::fisherman::SamplerTiming;
use crate::runtime::RuntimeSettings;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// vipernode - vipernet relay-service node
#[derive(Parser, Debug, Clone)]
#[command(name = "vipernode")]
#[command(about = "vipernet relay-service node: relays, evidence, claims and QoS reports")]
pub struct Config {
    /// Listen address of the client RPC
    #[arg(short, long, env = "VIPERNODE_LISTEN", default_value = "0.0.0.0:8081")]
    pub listen: SocketAddr,

    /// Data directory for evidence and test results
    #[arg(short, long, env = "VIPERNODE_DATA_DIR", default_value = "./data/vipernode")]
    pub data_dir: PathBuf,

    /// JSON array of hex ed25519 seeds; more than one runs lean mode
    #[arg(long, env = "VIPERNODE_KEYS_FILE")]
    pub keys_file: PathBuf,

    /// Hosted chains JSON file
    #[arg(long, env = "VIPERNODE_CHAINS_FILE")]
    pub chains_file: PathBuf,

    /// Fisherman sample payloads JSON file
    #[arg(long, env = "VIPERNODE_SAMPLE_POOL_FILE")]
    pub sample_pool_file: Option<PathBuf>,

    /// Devnet genesis JSON file
    #[arg(long, env = "VIPERNODE_GENESIS_FILE")]
    pub genesis_file: Option<PathBuf>,

    /// Upstream request timeout in milliseconds
    #[arg(long, default_value = "3000")]
    pub rpc_timeout_ms: u64,

    /// Blocks a client's height may differ from ours
    #[arg(long, default_value = "10")]
    pub client_block_sync_allowance: u64,

    /// Sessions a relay may lag behind the current session
    #[arg(long, default_value = "1")]
    pub client_session_sync_allowance: u64,

    /// Chain height poll interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub block_poll_ms: u64,

    /// Devnet block time in milliseconds (0 disables block production)
    #[arg(long, default_value = "5000")]
    pub block_time_ms: u64,

    /// Time box of one claim/report scan in milliseconds
    #[arg(long, default_value = "500")]
    pub claim_scan_budget_ms: u64,

    /// Blocks after session end a derived session stays cached
    #[arg(long, default_value = "8")]
    pub session_cache_max_age_blocks: u64,

    /// Fisherman start delay range "min,max" in milliseconds
    #[arg(long, value_delimiter = ',', default_value = "5000,8000")]
    pub fisherman_start_delay_ms: Vec<u64>,

    /// Fisherman sampling interval range "min,max" in milliseconds
    #[arg(long, value_delimiter = ',', default_value = "15000,35000")]
    pub fisherman_interval_ms: Vec<u64>,

    /// Stats log interval in seconds
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

fn range(name: &str, values: &[u64]) -> anyhow::Result<(Duration, Duration)> {
    match values {
        [lo, hi] if lo <= hi => Ok((Duration::from_millis(*lo), Duration::from_millis(*hi))),
        [_, _] => anyhow::bail!("{name}: minimum exceeds maximum"),
        _ => anyhow::bail!("{name} takes exactly two values \"min,max\""),
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=1_000_000).contains(&self.rpc_timeout_ms) {
            anyhow::bail!("rpc timeout must be between 1 ms and 1000 s");
        }
        if self.block_poll_ms == 0 {
            anyhow::bail!("block poll interval must be positive");
        }
        if self.stats_interval_secs == 0 {
            anyhow::bail!("stats interval must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("log format must be json or pretty");
        }
        range("fisherman start delay", &self.fisherman_start_delay_ms)?;
        range("fisherman interval", &self.fisherman_interval_ms)?;
        Ok(())
    }

    pub fn sampler_timing(&self) -> anyhow::Result<SamplerTiming> {
        Ok(SamplerTiming {
            start_delay: range("fisherman start delay", &self.fisherman_start_delay_ms)?,
            interval: range("fisherman interval", &self.fisherman_interval_ms)?,
        })
    }

    pub fn runtime_settings(&self) -> anyhow::Result<RuntimeSettings> {
        Ok(RuntimeSettings {
            client_block_sync_allowance: self.client_block_sync_allowance,
            client_session_sync_allowance: self.client_session_sync_allowance,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            claim_scan_budget: Duration::from_millis(self.claim_scan_budget_ms),
            session_cache_max_age_blocks: self.session_cache_max_age_blocks,
            sampler_timing: self.sampler_timing()?,
            ..RuntimeSettings::default()
        })
    }
}
