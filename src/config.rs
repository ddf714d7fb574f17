//! Configuration management.
//!
//! Options come from an optional YAML file merged under command-line
//! overrides. The merged value is immutable afterwards and passed by
//! reference to the components that need it.

use anyhow::{bail, Context, Result};
use nix::unistd::{access, AccessFlags};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::cli::Args;
use crate::rfb::vencrypt;

/// A configured security mode, in client-visible priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Anonymous TLS followed by no inner authentication.
    Tls,
    /// X.509 certificate TLS followed by no inner authentication.
    X509,
    /// No security at all.
    None,
}

impl SecurityMode {
    /// The VeNCrypt subtype offered to clients for this mode.
    pub fn vencrypt_subtype(self) -> u32 {
        match self {
            SecurityMode::Tls => vencrypt::TLS_NONE,
            SecurityMode::X509 => vencrypt::X509_NONE,
            SecurityMode::None => vencrypt::NONE,
        }
    }
}

impl FromStr for SecurityMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TLS" => Ok(SecurityMode::Tls),
            "X509" => Ok(SecurityMode::X509),
            "None" => Ok(SecurityMode::None),
            other => bail!("Unknown security type: {}", other),
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::Tls => write!(f, "TLS"),
            SecurityMode::X509 => write!(f, "X509"),
            SecurityMode::None => write!(f, "None"),
        }
    }
}

/// Parse a comma-separated security list such as `TLS,X509,None`.
pub fn parse_security_list(text: &str) -> Result<Vec<SecurityMode>> {
    let mut modes = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        modes.push(token.parse()?);
    }
    if modes.is_empty() {
        bail!("No security type configured.");
    }
    Ok(modes)
}

/// Split a shell-style argument string: whitespace-separated tokens with
/// double-quote grouping and backslash escapes.
pub fn split_shell_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                in_token = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_token = true;
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        args.push(current);
    }

    args
}

/// TLS-related configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (used by the X509 security mode)
    pub cert: PathBuf,
    /// Path to key file (used by the X509 security mode)
    pub key: PathBuf,
    /// Legacy cipher priority string for anonymous TLS; accepted but unused
    pub priority_anonymous: Option<String>,
    /// Legacy cipher priority string for certificate TLS; accepted but unused
    pub priority_certificate: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("/etc/vnc/tls.cert"),
            key: PathBuf::from("/etc/vnc/tls.key"),
            priority_anonymous: None,
            priority_certificate: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Addresses to bind to; empty means all interfaces
    pub listen: Vec<String>,
    /// TCP port to listen on
    pub port: u16,
    /// Security modes in priority order, parsed from a comma-separated list
    #[serde(deserialize_with = "deserialize_security")]
    pub security: Vec<SecurityMode>,
    /// Give every connection a unique session; no greeter, no reconnection
    pub disable_manager: bool,
    /// Show the greeter even when no session is available for reconnection
    pub always_show_greeter: bool,
    /// XDMCP host the back-end queries for display-manager sessions
    pub query: String,
    /// Initial back-end resolution, passed verbatim
    pub geometry: String,
    /// Path to the Xvnc executable
    pub xvnc: PathBuf,
    /// Path to the greeter executable
    pub greeter: PathBuf,
    /// Path to the xauth executable
    pub xauth: PathBuf,
    /// Run directory holding session sockets, xauth files and the control socket
    pub rundir: PathBuf,
    /// Additional back-end arguments (shell-style token list)
    pub xvnc_args: Vec<String>,
    /// TLS settings
    pub tls: TlsConfig,
}

fn deserialize_security<'de, D>(deserializer: D) -> std::result::Result<Vec<SecurityMode>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_security_list(&text).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            port: 5900,
            security: vec![SecurityMode::Tls, SecurityMode::X509, SecurityMode::None],
            disable_manager: false,
            always_show_greeter: false,
            query: "localhost".to_string(),
            geometry: "1024x768".to_string(),
            xvnc: PathBuf::from("/usr/bin/Xvnc"),
            greeter: PathBuf::from("/usr/bin/vncmuxd-greeter"),
            xauth: PathBuf::from("/usr/bin/xauth"),
            rundir: PathBuf::from("/run/vncmuxd"),
            xvnc_args: Vec::new(),
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Load the configuration named by the CLI, falling back to the default
    /// location. A missing default file is fine; a missing explicitly-given
    /// file is an error.
    pub fn load_with_args(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Config::load(path)?,
            None => {
                let default_path = "/etc/vncmuxd/config.yaml";
                Config::load(default_path).unwrap_or_default()
            }
        };

        config.with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if !args.listen.is_empty() {
            self.listen = args.listen.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(ref security) = args.security {
            self.security = parse_security_list(security)?;
        }
        if args.disable_manager {
            self.disable_manager = true;
        }
        if args.always_show_greeter {
            self.always_show_greeter = true;
        }
        if let Some(ref query) = args.query {
            self.query = query.clone();
        }
        if let Some(ref geometry) = args.geometry {
            self.geometry = geometry.clone();
        }
        if let Some(ref xvnc) = args.xvnc {
            self.xvnc = PathBuf::from(xvnc);
        }
        if let Some(ref greeter) = args.greeter {
            self.greeter = PathBuf::from(greeter);
        }
        if let Some(ref xauth) = args.xauth {
            self.xauth = PathBuf::from(xauth);
        }
        if let Some(ref rundir) = args.rundir {
            self.rundir = PathBuf::from(rundir);
        }
        if let Some(ref xvnc_args) = args.xvnc_args {
            self.xvnc_args = split_shell_args(xvnc_args);
        }
        if let Some(ref cert) = args.tls_cert {
            self.tls.cert = PathBuf::from(cert);
        }
        if let Some(ref key) = args.tls_key {
            self.tls.key = PathBuf::from(key);
        }

        Ok(self)
    }

    /// Verify that the configuration is usable before starting.
    pub fn check(&self) -> Result<()> {
        access(&self.xvnc, AccessFlags::X_OK)
            .with_context(|| format!("{} is not executable", self.xvnc.display()))?;

        // The greeter and xauth are not needed when the manager is disabled.
        if !self.disable_manager {
            access(&self.greeter, AccessFlags::X_OK)
                .with_context(|| format!("{} is not executable", self.greeter.display()))?;
            access(&self.xauth, AccessFlags::X_OK)
                .with_context(|| format!("{} is not executable", self.xauth.display()))?;
        }

        // If X509 is offered, the key and certificate must be in place.
        if self.security.contains(&SecurityMode::X509) {
            access(&self.tls.cert, AccessFlags::R_OK)
                .with_context(|| format!("{} is not readable", self.tls.cert.display()))?;
            access(&self.tls.key, AccessFlags::R_OK)
                .with_context(|| format!("{} is not readable", self.tls.key.display()))?;
        }

        Ok(())
    }

    /// True when any TLS-based security mode is configured.
    pub fn offers_tls(&self) -> bool {
        self.security
            .iter()
            .any(|m| matches!(m, SecurityMode::Tls | SecurityMode::X509))
    }
}
