//! Command-line argument parsing.

use clap::Parser;

/// vncmuxd - Multiplexing VNC session proxy
#[derive(Parser, Debug)]
#[command(name = "vncmuxd")]
#[command(about = "Multiplexing VNC session proxy with back-end switching")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Addresses to bind to (all interfaces if not given)
    #[arg(long)]
    pub listen: Vec<String>,

    /// TCP port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// VNC security types separated by commas, ordered by priority (TLS, X509, None)
    #[arg(long)]
    pub security: Option<String>,

    /// Give every connection a unique session; no sharing or reconnection
    #[arg(long)]
    pub disable_manager: bool,

    /// Show the greeter even when there is no session available for reconnection
    #[arg(long)]
    pub always_show_greeter: bool,

    /// Address of the XDMCP server that the VNC back-end should query
    #[arg(long)]
    pub query: Option<String>,

    /// <width>x<height> initial resolution passed to the VNC back-end
    #[arg(long)]
    pub geometry: Option<String>,

    /// Path to the Xvnc executable
    #[arg(long)]
    pub xvnc: Option<String>,

    /// Path to the greeter executable
    #[arg(long)]
    pub greeter: Option<String>,

    /// Path to the xauth executable
    #[arg(long)]
    pub xauth: Option<String>,

    /// Path to the run directory
    #[arg(long)]
    pub rundir: Option<String>,

    /// Additional arguments passed to the VNC back-end (shell-style tokens)
    #[arg(long)]
    pub xvnc_args: Option<String>,

    /// Path to the TLS certificate file
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// Path to the TLS key file
    #[arg(long)]
    pub tls_key: Option<String>,
}
