//! RFB client role toward a back-end session.
//!
//! The first connection of a tunnel negotiates None security synchronously.
//! Connections opened for a switch also accept VncAuth and VeNCrypt
//! (Plain/None/VncAuth) and may suspend while the greeter collects a
//! password or credentials from the user.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::rfb::{security, vencrypt, PixelFormat, ServerInit, VERSION_STRING};
use crate::session::Session;
use crate::stream::Formatter;

/// Authentication material requested from the user while a switch target is
/// negotiating. The tunnel relays these to the greeter and answers through
/// the embedded channel.
pub enum AuthRequest {
    Password(oneshot::Sender<String>),
    Credentials(oneshot::Sender<(String, String)>),
}

/// An RFB connection to one back-end session.
pub struct BackendConnection {
    session: Arc<Session>,
    fmt: Formatter<UnixStream>,
    pixel_format: PixelFormat,
    framebuffer_width: u16,
    framebuffer_height: u16,
}

impl BackendConnection {
    /// Open the RFB stream to the session's back-end.
    pub async fn open(session: Arc<Session>) -> Result<Self> {
        debug!(id = session.id(), "Opening connection to back-end");
        let stream = session.connect().await?;
        Ok(Self {
            session,
            fmt: Formatter::new(stream),
            pixel_format: PixelFormat::default(),
            framebuffer_width: 0,
            framebuffer_height: 0,
        })
    }

    /// Synchronous initialization used for a tunnel's first connection; the
    /// back-end is expected to offer None security.
    pub async fn initialize(&mut self) -> Result<()> {
        let selected = self.start_initialization(&[security::NONE]).await?;
        if selected != security::NONE {
            return Err(Error::protocol(format!(
                "back-end was expected to offer security None, but got {}",
                selected
            )));
        }

        self.handle_none_security().await
    }

    /// Interactive initialization used while switching. Passwords and
    /// credentials are requested through `auth_requests`.
    pub async fn initialize_interactive(
        &mut self,
        auth_requests: mpsc::Sender<AuthRequest>,
    ) -> Result<()> {
        let selected = self
            .start_initialization(&[security::NONE, security::VNC_AUTH, security::VENCRYPT])
            .await?;

        match selected {
            security::NONE => self.handle_none_security().await,
            security::VNC_AUTH => self.handle_vnc_auth_security(&auth_requests).await,
            security::VENCRYPT => self.handle_vencrypt_security(&auth_requests).await,
            _ => unreachable!("selected type comes from the supported set"),
        }
    }

    /// Version exchange and security-type selection, shared by both
    /// initialization variants. Returns the selected security type.
    async fn start_initialization(&mut self, supported: &[u8]) -> Result<u8> {
        let mut version = [0u8; 12];
        self.fmt.recv_exact(&mut version).await?;
        if &version != VERSION_STRING {
            return Err(Error::protocol("unsupported RFB protocol version"));
        }

        // Respond with the same version.
        self.fmt.send_raw(&version).await?;

        let count = self.fmt.recv_u8().await?;

        // Zero means the back-end wants to report failure.
        if count == 0 {
            let reason = self.receive_failure_reason().await?;
            return Err(Error::protocol(format!("connection failed, reason: {}", reason)));
        }

        let offered = self.fmt.recv_bytes(count as usize).await?;
        let selected = offered
            .iter()
            .copied()
            .find(|t| supported.contains(t))
            .ok_or_else(|| Error::protocol("no supported security type offered"))?;

        self.fmt.send_u8(selected).await?;
        Ok(selected)
    }

    async fn handle_none_security(&mut self) -> Result<()> {
        self.receive_security_result().await?;
        self.complete_initialization().await
    }

    async fn handle_vnc_auth_security(
        &mut self,
        auth_requests: &mpsc::Sender<AuthRequest>,
    ) -> Result<()> {
        let password = request_password(auth_requests).await?;
        self.finish_vnc_auth(&password).await
    }

    async fn finish_vnc_auth(&mut self, password: &str) -> Result<()> {
        let mut challenge = [0u8; 16];
        self.fmt.recv_exact(&mut challenge).await?;

        let response = encrypt_challenge(password, &challenge);
        self.fmt.send_raw(&response).await?;

        self.receive_security_result().await?;
        self.complete_initialization().await
    }

    async fn handle_vencrypt_security(
        &mut self,
        auth_requests: &mpsc::Sender<AuthRequest>,
    ) -> Result<()> {
        // Version exchange; only 0.2 is spoken.
        let major = self.fmt.recv_u8().await?;
        let minor = self.fmt.recv_u8().await?;
        if (major, minor) != (0, 2) {
            return Err(Error::protocol("unsupported VeNCrypt version"));
        }
        self.fmt.send_raw(&[major, minor]).await?;

        let status = self.fmt.recv_u8().await?;
        if status != 0 {
            return Err(Error::protocol("VeNCrypt version selection failed"));
        }

        let count = self.fmt.recv_u8().await?;
        let mut subtypes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            subtypes.push(self.fmt.recv_u32().await?);
        }

        let selected = subtypes
            .iter()
            .copied()
            .find(|s| matches!(*s, vencrypt::PLAIN | vencrypt::NONE | vencrypt::VNC_AUTH))
            .ok_or_else(|| Error::protocol("no supported VeNCrypt subtype available"))?;

        self.fmt.send_u32(selected).await?;

        match selected {
            vencrypt::NONE => self.handle_none_security().await,
            vencrypt::VNC_AUTH => self.handle_vnc_auth_security(auth_requests).await,
            vencrypt::PLAIN => {
                let (username, password) = request_credentials(auth_requests).await?;
                self.finish_vencrypt_plain(&username, &password).await
            }
            _ => unreachable!("selected subtype comes from the supported set"),
        }
    }

    async fn finish_vencrypt_plain(&mut self, username: &str, password: &str) -> Result<()> {
        self.fmt.send_u32(username.len() as u32).await?;
        self.fmt.send_u32(password.len() as u32).await?;
        self.fmt.send_raw(username.as_bytes()).await?;
        self.fmt.send_raw(password.as_bytes()).await?;

        self.receive_security_result().await?;
        self.complete_initialization().await
    }

    async fn receive_security_result(&mut self) -> Result<()> {
        let status = self.fmt.recv_u32().await?;
        if status != 0 {
            let reason = self.receive_failure_reason().await?;
            return Err(Error::protocol(format!("connection failed, reason: {}", reason)));
        }
        Ok(())
    }

    async fn receive_failure_reason(&mut self) -> Result<String> {
        let length = self.fmt.recv_u32().await?;
        self.fmt.recv_string(length as usize).await
    }

    /// ClientInit/ServerInit exchange; adopts the back-end's pixel format
    /// and framebuffer size and propagates its desktop name.
    async fn complete_initialization(&mut self) -> Result<()> {
        // Shared flag: other clients of the back-end stay connected.
        self.fmt.send_u8(1).await?;

        let mut init = [0u8; ServerInit::WIRE_SIZE];
        self.fmt.recv_exact(&mut init).await?;
        let init = ServerInit::from_bytes(&init);

        self.framebuffer_width = init.width;
        self.framebuffer_height = init.height;
        self.pixel_format = init.pixel_format;

        let name = self.fmt.recv_string(init.name_length as usize).await?;
        self.session.set_desktop_name(&name);

        Ok(())
    }

    pub async fn send_set_pixel_format(&mut self, pixel_format: &PixelFormat) -> Result<()> {
        self.pixel_format = *pixel_format;

        let mut message = [0u8; 20];
        // message[0] is SetPixelFormat, followed by 3 bytes of padding.
        message[4..20].copy_from_slice(&pixel_format.to_bytes());
        self.fmt.send_raw(&message).await
    }

    pub async fn send_set_encodings(&mut self, encodings: &[i32]) -> Result<()> {
        let mut message = vec![0u8; 4 + encodings.len() * 4];
        message[0] = 2; // SetEncodings
        message[2..4].copy_from_slice(&(encodings.len() as u16).to_be_bytes());
        for (i, &encoding) in encodings.iter().enumerate() {
            message[4 + i * 4..8 + i * 4].copy_from_slice(&encoding.to_be_bytes());
        }
        self.fmt.send_raw(&message).await
    }

    /// Request a full, non-incremental framebuffer update.
    pub async fn send_full_update_request(&mut self) -> Result<()> {
        let mut message = [0u8; 10];
        message[0] = 3; // FramebufferUpdateRequest
        message[1] = 0; // non-incremental
        message[6..8].copy_from_slice(&self.framebuffer_width.to_be_bytes());
        message[8..10].copy_from_slice(&self.framebuffer_height.to_be_bytes());
        self.fmt.send_raw(&message).await
    }

    pub fn set_framebuffer_size(&mut self, width: u16, height: u16) {
        self.framebuffer_width = width;
        self.framebuffer_height = height;
    }

    pub fn set_desktop_name(&self, name: &str) {
        self.session.set_desktop_name(name);
    }

    pub fn desktop_name(&self) -> String {
        self.session.desktop_name()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn framebuffer_width(&self) -> u16 {
        self.framebuffer_width
    }

    pub fn framebuffer_height(&self) -> u16 {
        self.framebuffer_height
    }

    /// Cancel-safe single-byte peek for the tunnel's readiness wait.
    pub async fn peek(&mut self) -> Result<u8> {
        self.fmt.peek().await
    }

    pub fn formatter(&mut self) -> &mut Formatter<UnixStream> {
        &mut self.fmt
    }

    /// Wrap an already-open stream; bypasses `Session::connect`.
    #[cfg(test)]
    pub(crate) fn from_stream(session: Arc<Session>, stream: UnixStream) -> Self {
        session.note_connect();
        Self {
            session,
            fmt: Formatter::new(stream),
            pixel_format: PixelFormat::default(),
            framebuffer_width: 0,
            framebuffer_height: 0,
        }
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        debug!(id = self.session.id(), "Closing connection to back-end");
        self.session.disconnect();
    }
}

async fn request_password(auth_requests: &mpsc::Sender<AuthRequest>) -> Result<String> {
    let (tx, rx) = oneshot::channel();
    auth_requests
        .send(AuthRequest::Password(tx))
        .await
        .map_err(|_| Error::protocol("tunnel dropped the switch in progress"))?;
    rx.await
        .map_err(|_| Error::protocol("no password arrived for the switch target"))
}

async fn request_credentials(
    auth_requests: &mpsc::Sender<AuthRequest>,
) -> Result<(String, String)> {
    let (tx, rx) = oneshot::channel();
    auth_requests
        .send(AuthRequest::Credentials(tx))
        .await
        .map_err(|_| Error::protocol("tunnel dropped the switch in progress"))?;
    rx.await
        .map_err(|_| Error::protocol("no credentials arrived for the switch target"))
}

/// VncAuth challenge-response: DES-ECB over the 16-byte challenge with a key
/// built from the password's first 8 bytes, each with its bit order
/// reversed and the parity bit cleared.
pub fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits() & 0xfe;
    }

    let cipher = Des::new_from_slice(&key).expect("8-byte key is always valid");

    let mut response = *challenge;
    for half in response.chunks_exact_mut(8) {
        let block: &mut [u8; 8] = half.try_into().unwrap();
        cipher.encrypt_block(block.into());
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_blocks_are_encrypted_independently() {
        // ECB: identical plaintext halves give identical ciphertext halves.
        let challenge = [7u8; 16];
        let response = encrypt_challenge("secret", &challenge);
        assert_eq!(response[0..8], response[8..16]);
        assert_ne!(response[0..8], challenge[0..8]);
    }

    #[test]
    fn password_is_truncated_to_eight_bytes() {
        let challenge = [42u8; 16];
        let a = encrypt_challenge("12345678", &challenge);
        let b = encrypt_challenge("12345678ignored", &challenge);
        assert_eq!(a, b);

        let c = encrypt_challenge("1234567", &challenge);
        assert_ne!(a, c);
    }

    #[test]
    fn short_passwords_are_zero_padded() {
        let challenge = [1u8; 16];
        // Both derive the all-zero key tail; responses differ from each
        // other because the leading byte differs.
        let a = encrypt_challenge("a", &challenge);
        let b = encrypt_challenge("b", &challenge);
        assert_ne!(a, b);

        // An empty password is legal and uses the all-zero key.
        let _ = encrypt_challenge("", &challenge);
    }

    #[tokio::test]
    async fn auth_request_channel_roundtrip() {
        let (tx, mut rx) = mpsc::channel(1);

        let ask = tokio::spawn(async move { request_password(&tx).await });

        match rx.recv().await.expect("request arrives") {
            AuthRequest::Password(reply) => reply.send("hunter2".to_string()).unwrap(),
            AuthRequest::Credentials(_) => panic!("expected a password request"),
        }

        assert_eq!(ask.await.unwrap().unwrap(), "hunter2");
    }

    use crate::session::SessionRegistry;

    fn test_connection() -> (BackendConnection, Formatter<UnixStream>) {
        let registry = SessionRegistry::new();
        let session = registry.insert_fake(1);
        let (ours, theirs) = UnixStream::pair().unwrap();
        (
            BackendConnection::from_stream(session, ours),
            Formatter::new(theirs),
        )
    }

    async fn play_server_init(peer: &mut Formatter<UnixStream>, name: &str) {
        // ClientInit with the shared flag set.
        assert_eq!(peer.recv_u8().await.unwrap(), 1);

        let init = ServerInit {
            width: 800,
            height: 600,
            pixel_format: PixelFormat::default(),
            name_length: name.len() as u32,
        };
        peer.send_raw(&init.to_bytes()).await.unwrap();
        peer.send_raw(name.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn initialize_with_none_security() {
        let (mut conn, mut peer) = test_connection();
        let session = conn.session().clone();

        let server = tokio::spawn(async move {
            peer.send_raw(VERSION_STRING).await.unwrap();

            let mut echoed = [0u8; 12];
            peer.recv_exact(&mut echoed).await.unwrap();
            assert_eq!(&echoed, VERSION_STRING);

            // One security type: None.
            peer.send_raw(&[1, security::NONE]).await.unwrap();
            assert_eq!(peer.recv_u8().await.unwrap(), security::NONE);

            // SecurityResult OK.
            peer.send_u32(0).await.unwrap();

            play_server_init(&mut peer, "xvnc").await;
        });

        conn.initialize().await.unwrap();
        server.await.unwrap();

        assert_eq!(conn.framebuffer_width(), 800);
        assert_eq!(conn.framebuffer_height(), 600);
        assert_eq!(conn.pixel_format(), PixelFormat::default());
        assert_eq!(session.desktop_name(), "xvnc");
    }

    #[tokio::test]
    async fn initialize_rejects_non_none_offer() {
        let (mut conn, mut peer) = test_connection();

        let server = tokio::spawn(async move {
            peer.send_raw(VERSION_STRING).await.unwrap();
            let mut echoed = [0u8; 12];
            peer.recv_exact(&mut echoed).await.unwrap();
            // Only VncAuth on offer.
            peer.send_raw(&[1, security::VNC_AUTH]).await.unwrap();
            peer
        });

        assert!(conn.initialize().await.is_err());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn initialize_reports_rejection_reason() {
        let (mut conn, mut peer) = test_connection();

        let server = tokio::spawn(async move {
            peer.send_raw(VERSION_STRING).await.unwrap();
            let mut echoed = [0u8; 12];
            peer.recv_exact(&mut echoed).await.unwrap();

            // Zero security types followed by a reason.
            peer.send_u8(0).await.unwrap();
            let reason = b"too many clients";
            peer.send_u32(reason.len() as u32).await.unwrap();
            peer.send_raw(reason).await.unwrap();
            peer
        });

        let err = conn.initialize().await.unwrap_err();
        assert!(err.to_string().contains("too many clients"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn interactive_vnc_auth_uses_greeter_password() {
        let (mut conn, mut peer) = test_connection();
        let (tx, mut rx) = mpsc::channel(1);

        // Answer the password request like the tunnel would.
        let answer = tokio::spawn(async move {
            match rx.recv().await.expect("auth request") {
                AuthRequest::Password(reply) => reply.send("sesame".to_string()).unwrap(),
                AuthRequest::Credentials(_) => panic!("expected a password request"),
            }
        });

        let challenge = [0x5au8; 16];
        let server = tokio::spawn(async move {
            peer.send_raw(VERSION_STRING).await.unwrap();
            let mut echoed = [0u8; 12];
            peer.recv_exact(&mut echoed).await.unwrap();

            peer.send_raw(&[1, security::VNC_AUTH]).await.unwrap();
            assert_eq!(peer.recv_u8().await.unwrap(), security::VNC_AUTH);

            peer.send_raw(&challenge).await.unwrap();
            let mut response = [0u8; 16];
            peer.recv_exact(&mut response).await.unwrap();
            assert_eq!(response, encrypt_challenge("sesame", &challenge));

            peer.send_u32(0).await.unwrap();
            play_server_init(&mut peer, "desk").await;
        });

        conn.initialize_interactive(tx).await.unwrap();
        answer.await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn interactive_vencrypt_plain_sends_credentials() {
        let (mut conn, mut peer) = test_connection();
        let (tx, mut rx) = mpsc::channel(1);

        let answer = tokio::spawn(async move {
            match rx.recv().await.expect("auth request") {
                AuthRequest::Credentials(reply) => {
                    reply.send(("joe".to_string(), "pw".to_string())).unwrap()
                }
                AuthRequest::Password(_) => panic!("expected a credentials request"),
            }
        });

        let server = tokio::spawn(async move {
            peer.send_raw(VERSION_STRING).await.unwrap();
            let mut echoed = [0u8; 12];
            peer.recv_exact(&mut echoed).await.unwrap();

            peer.send_raw(&[1, security::VENCRYPT]).await.unwrap();
            assert_eq!(peer.recv_u8().await.unwrap(), security::VENCRYPT);

            // VeNCrypt 0.2 version dance.
            peer.send_raw(&[0, 2]).await.unwrap();
            let mut version = [0u8; 2];
            peer.recv_exact(&mut version).await.unwrap();
            assert_eq!(version, [0, 2]);
            peer.send_u8(0).await.unwrap();

            // Offer Plain only.
            peer.send_u8(1).await.unwrap();
            peer.send_u32(vencrypt::PLAIN).await.unwrap();
            assert_eq!(peer.recv_u32().await.unwrap(), vencrypt::PLAIN);

            // Plain credentials.
            assert_eq!(peer.recv_u32().await.unwrap(), 3);
            assert_eq!(peer.recv_u32().await.unwrap(), 2);
            assert_eq!(peer.recv_string(3).await.unwrap(), "joe");
            assert_eq!(peer.recv_string(2).await.unwrap(), "pw");

            peer.send_u32(0).await.unwrap();
            play_server_init(&mut peer, "desk").await;
        });

        conn.initialize_interactive(tx).await.unwrap();
        answer.await.unwrap();
        server.await.unwrap();
    }
}
