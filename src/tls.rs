//! Server-side TLS for the VeNCrypt TLS and X509 subtypes.
//!
//! The X509 mode serves the certificate and key configured on disk. The
//! anonymous mode has no rustls counterpart for anonymous key exchange, so
//! it serves an ephemeral self-signed certificate generated at startup,
//! which keeps the encrypted-but-unauthenticated contract of the TLS
//! subtype.

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::config::Config;

/// TLS acceptors for both VeNCrypt TLS modes, built once at startup.
pub struct TlsProvider {
    anonymous: Option<TlsAcceptor>,
    certificate: Option<TlsAcceptor>,
}

impl TlsProvider {
    /// Build the acceptors the configured security modes need.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::config::SecurityMode;

        if config.tls.priority_anonymous.is_some() || config.tls.priority_certificate.is_some() {
            warn!("tls-priority options are accepted for compatibility but cipher selection is managed by rustls");
        }

        let anonymous = if config.security.contains(&SecurityMode::Tls) {
            Some(ephemeral_acceptor()?)
        } else {
            None
        };

        let certificate = if config.security.contains(&SecurityMode::X509) {
            Some(certificate_acceptor(config)?)
        } else {
            None
        };

        Ok(Self {
            anonymous,
            certificate,
        })
    }

    pub fn anonymous(&self) -> Option<&TlsAcceptor> {
        self.anonymous.as_ref()
    }

    pub fn certificate(&self) -> Option<&TlsAcceptor> {
        self.certificate.as_ref()
    }
}

/// Acceptor backed by an ephemeral self-signed certificate.
fn ephemeral_acceptor() -> Result<TlsAcceptor> {
    let certified = rcgen::generate_simple_self_signed(vec!["vncmuxd".to_string()])
        .context("Failed to generate ephemeral TLS certificate")?;

    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    make_acceptor(vec![cert], key)
}

/// Acceptor backed by the certificate and key configured on disk.
fn certificate_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let certs = load_certificates(&config.tls.cert)?;
    let key = load_private_key(&config.tls.key)?;
    make_acceptor(certs, key)
}

fn make_acceptor(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<TlsAcceptor> {
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate or key")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certificates(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open certificate file: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Failed to parse certificates from {}", path.display()))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open key file: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse key from {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_security_list, Config};

    #[test]
    fn ephemeral_acceptor_builds() {
        assert!(ephemeral_acceptor().is_ok());
    }

    #[test]
    fn provider_builds_only_requested_modes() {
        let mut config = Config::default();
        config.security = parse_security_list("TLS").unwrap();

        let provider = TlsProvider::from_config(&config).unwrap();
        assert!(provider.anonymous().is_some());
        assert!(provider.certificate().is_none());
    }

    #[test]
    fn provider_without_tls_modes_is_empty() {
        let mut config = Config::default();
        config.security = parse_security_list("None").unwrap();

        let provider = TlsProvider::from_config(&config).unwrap();
        assert!(provider.anonymous().is_none());
        assert!(provider.certificate().is_none());
    }
}
