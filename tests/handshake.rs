//! Client-side handshake tests: the exact byte sequences a VNC client sees
//! during version and security negotiation.

use tokio::io::DuplexStream;

use vncmuxd::config::{parse_security_list, Config};
use vncmuxd::rfb::{security, security_result, vencrypt, VERSION_STRING};
use vncmuxd::stream::Formatter;
use vncmuxd::tunnel::{negotiate_security, SecurityOutcome};

fn config_with_security(list: &str) -> Config {
    let mut config = Config::default();
    config.security = parse_security_list(list).unwrap();
    config
}

fn pair() -> (Formatter<DuplexStream>, Formatter<DuplexStream>) {
    let (server_side, client_side) = tokio::io::duplex(1 << 12);
    (Formatter::new(server_side), Formatter::new(client_side))
}

#[tokio::test]
async fn none_security_handshake_byte_for_byte() {
    let config = config_with_security("None");
    let (mut fmt, mut peer) = pair();

    let negotiation =
        tokio::spawn(async move { negotiate_security(&mut fmt, &config).await.map(|_| ()) });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    assert_eq!(&version, VERSION_STRING);
    peer.send_raw(VERSION_STRING).await.unwrap();

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u8().await.unwrap(), security::NONE);
    peer.send_u8(security::NONE).await.unwrap();

    assert_eq!(peer.recv_u32().await.unwrap(), security_result::OK);

    negotiation.await.unwrap().unwrap();
}

#[tokio::test]
async fn vencrypt_none_subtype_handshake() {
    let config = config_with_security("TLS,None");
    let (mut fmt, mut peer) = pair();

    let negotiation = tokio::spawn(async move { negotiate_security(&mut fmt, &config).await });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    peer.send_raw(VERSION_STRING).await.unwrap();

    // TLS before None in the config puts VeNCrypt first in the offer.
    assert_eq!(peer.recv_u8().await.unwrap(), 2);
    assert_eq!(peer.recv_u8().await.unwrap(), security::VENCRYPT);
    assert_eq!(peer.recv_u8().await.unwrap(), security::NONE);
    peer.send_u8(security::VENCRYPT).await.unwrap();

    let mut vencrypt_version = [0u8; 2];
    peer.recv_exact(&mut vencrypt_version).await.unwrap();
    assert_eq!(vencrypt_version, [0, 2]);
    peer.send_raw(&[0, 2]).await.unwrap();
    assert_eq!(peer.recv_u8().await.unwrap(), 0);

    assert_eq!(peer.recv_u8().await.unwrap(), 2);
    assert_eq!(peer.recv_u32().await.unwrap(), vencrypt::TLS_NONE);
    assert_eq!(peer.recv_u32().await.unwrap(), vencrypt::NONE);
    peer.send_u32(vencrypt::NONE).await.unwrap();

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u32().await.unwrap(), security_result::OK);

    let outcome = negotiation.await.unwrap().unwrap();
    assert!(matches!(outcome, SecurityOutcome::Ready));
}

#[tokio::test]
async fn vencrypt_tls_subtype_requests_a_tls_upgrade() {
    let config = config_with_security("TLS");
    let (mut fmt, mut peer) = pair();

    let negotiation = tokio::spawn(async move { negotiate_security(&mut fmt, &config).await });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    peer.send_raw(VERSION_STRING).await.unwrap();

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u8().await.unwrap(), security::VENCRYPT);
    peer.send_u8(security::VENCRYPT).await.unwrap();

    let mut vencrypt_version = [0u8; 2];
    peer.recv_exact(&mut vencrypt_version).await.unwrap();
    peer.send_raw(&[0, 2]).await.unwrap();
    assert_eq!(peer.recv_u8().await.unwrap(), 0);

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u32().await.unwrap(), vencrypt::TLS_NONE);
    peer.send_u32(vencrypt::TLS_NONE).await.unwrap();

    // Acceptance byte; the TLS handshake follows on the upgraded stream.
    assert_eq!(peer.recv_u8().await.unwrap(), 1);

    let outcome = negotiation.await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        SecurityOutcome::StartTls { anonymous: true }
    ));
}

#[tokio::test]
async fn wrong_client_version_is_refused_with_a_reason() {
    let config = config_with_security("None");
    let (mut fmt, mut peer) = pair();

    let negotiation =
        tokio::spawn(async move { negotiate_security(&mut fmt, &config).await.map(|_| ()) });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    peer.send_raw(b"RFB 003.003\n").await.unwrap();

    // Zero security types plus a length-prefixed reason.
    assert_eq!(peer.recv_u8().await.unwrap(), 0);
    let length = peer.recv_u32().await.unwrap();
    let reason = peer.recv_string(length as usize).await.unwrap();
    assert!(reason.contains("version"));

    assert!(negotiation.await.unwrap().is_err());
}

#[tokio::test]
async fn wrong_vencrypt_version_is_refused() {
    let config = config_with_security("TLS");
    let (mut fmt, mut peer) = pair();

    let negotiation =
        tokio::spawn(async move { negotiate_security(&mut fmt, &config).await.map(|_| ()) });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    peer.send_raw(VERSION_STRING).await.unwrap();

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u8().await.unwrap(), security::VENCRYPT);
    peer.send_u8(security::VENCRYPT).await.unwrap();

    let mut vencrypt_version = [0u8; 2];
    peer.recv_exact(&mut vencrypt_version).await.unwrap();
    peer.send_raw(&[0, 1]).await.unwrap();

    // A non-zero status byte ends the conversation.
    assert_eq!(peer.recv_u8().await.unwrap(), 1);

    assert!(negotiation.await.unwrap().is_err());
}

#[tokio::test]
async fn unoffered_security_type_is_refused() {
    let config = config_with_security("None");
    let (mut fmt, mut peer) = pair();

    let negotiation =
        tokio::spawn(async move { negotiate_security(&mut fmt, &config).await.map(|_| ()) });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    peer.send_raw(VERSION_STRING).await.unwrap();

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u8().await.unwrap(), security::NONE);
    peer.send_u8(security::VNC_AUTH).await.unwrap();

    assert_eq!(peer.recv_u32().await.unwrap(), security_result::FAILED);
    let length = peer.recv_u32().await.unwrap();
    let reason = peer.recv_string(length as usize).await.unwrap();
    assert!(reason.contains("security type"));

    assert!(negotiation.await.unwrap().is_err());
}

#[tokio::test]
async fn unoffered_vencrypt_subtype_is_refused() {
    let config = config_with_security("X509");
    let (mut fmt, mut peer) = pair();

    let negotiation =
        tokio::spawn(async move { negotiate_security(&mut fmt, &config).await.map(|_| ()) });

    let mut version = [0u8; 12];
    peer.recv_exact(&mut version).await.unwrap();
    peer.send_raw(VERSION_STRING).await.unwrap();

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u8().await.unwrap(), security::VENCRYPT);
    peer.send_u8(security::VENCRYPT).await.unwrap();

    let mut vencrypt_version = [0u8; 2];
    peer.recv_exact(&mut vencrypt_version).await.unwrap();
    peer.send_raw(&[0, 2]).await.unwrap();
    assert_eq!(peer.recv_u8().await.unwrap(), 0);

    assert_eq!(peer.recv_u8().await.unwrap(), 1);
    assert_eq!(peer.recv_u32().await.unwrap(), vencrypt::X509_NONE);
    // Ask for plain VncAuth, which is never offered toward clients.
    peer.send_u32(vencrypt::VNC_AUTH).await.unwrap();

    // Rejection byte, SecurityResult and a reason.
    assert_eq!(peer.recv_u8().await.unwrap(), 0);
    assert_eq!(peer.recv_u32().await.unwrap(), security_result::FAILED);
    let length = peer.recv_u32().await.unwrap();
    let reason = peer.recv_string(length as usize).await.unwrap();
    assert!(reason.contains("subtype"));

    assert!(negotiation.await.unwrap().is_err());
}
