//! vipernode - vipernet relay-service node
//!
//! Serves client relays for staked servicers, records relay evidence,
//! claims and proves it on chain, and runs fisherman QoS sampling.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vipernode::config::Config;
use vipernode::server::Server;

fn init_logging(config: &Config) {
    let default = if config.verbose {
        "vipernode=debug,vipernet_net=debug"
    } else {
        "vipernode=info,vipernet_net=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    info!(
        "vipernode v{} - vipernet relay-service node",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown.send(());
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
