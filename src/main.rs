//! # vncmuxd
//!
//! Multiplexing VNC (RFB 3.8) front-end proxy with session management. It
//! terminates client VNC connections on a public TCP port, negotiates
//! security including TLS/X.509 via the VeNCrypt extension, and tunnels the
//! RFB stream to one of several back-end Xvnc processes it spawns. Clients
//! may be shown a greeter to create or reconnect to sessions, and the live
//! back-end can be switched underneath a connected client.
//!
//! ## Usage
//! ```bash
//! vncmuxd --config /etc/vncmuxd/config.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use vncmuxd::cli::Args;
use vncmuxd::config::Config;
use vncmuxd::logging;
use vncmuxd::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logging(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vncmuxd");

    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    config.check()?;

    info!(
        port = config.port,
        manager = !config.disable_manager,
        "Configured"
    );

    let server = Server::bind(config)?;
    server.run().await
}
