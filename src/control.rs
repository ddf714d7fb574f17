//! Control socket for in-session helper processes.
//!
//! Helpers running inside a session connect to `<rundir>/control/control`,
//! prove they belong to the session by presenting the one-time key the
//! back-end published through its desktop-name channel, and may then
//! annotate the session (today: visibility).

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{Uid, User};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{Session, SessionRegistry};

/// How many times a not-yet-approved key is re-checked, at 100 ms intervals.
const APPROVAL_TRIES: u32 = 100;
const APPROVAL_INTERVAL: Duration = Duration::from_millis(100);

/// Listening side of the control socket.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Create the control socket under the run directory, world-connectable.
    pub fn bind(config: &Config) -> Result<Self> {
        let control_dir = config.rundir.join("control");
        match std::fs::DirBuilder::new().create(&config.rundir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        match std::fs::DirBuilder::new().create(&control_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let path = control_dir.join("control");
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;

        Ok(Self { listener, path })
    }

    /// Accept helper connections forever, one task per connection.
    pub async fn run(self, registry: Arc<SessionRegistry>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        serve_controller(stream, registry).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept control connection");
                }
            }
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_controller(stream: UnixStream, registry: Arc<SessionRegistry>) {
    info!("Accepted controller");

    let uid = stream.peer_cred().ok().map(|cred| cred.uid());

    match handle_controller(stream, uid, &registry).await {
        Ok(()) => {}
        Err(e) if e.is_end_of_stream() => {}
        Err(e) => error!(error = %e, "Controller connection failed"),
    }

    info!("Disconnected controller");
}

/// Run the control protocol over an established stream. `uid` is the peer's
/// credential, used to label the session with a username after approval.
pub async fn handle_controller<S>(
    stream: S,
    uid: Option<u32>,
    registry: &SessionRegistry,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut read = BufReader::new(read);

    // The helper starts by naming its display.
    let display_number: u32 = match read_token(&mut read).await? {
        Some(token) => token
            .parse()
            .map_err(|_| Error::protocol("controller sent a malformed display number"))?,
        None => return Ok(()),
    };

    let session = match registry.get_session_by_display_number(display_number) {
        Some(session) => session,
        None => {
            warn!(
                display_number,
                "Controller asked for a display that is not managed here"
            );
            return Ok(());
        }
    };

    write.write_all(b"OK\n").await?;

    // The helper then presents its key; wait a bounded time for the
    // back-end to publish it.
    let key = match read_token(&mut read).await? {
        Some(key) => key,
        None => return Ok(()),
    };

    if !wait_for_approval(&session, &key).await {
        warn!(id = session.id(), "Failed to approve controller key in time");
        return Ok(());
    }

    write.write_all(b"OK\n").await?;

    if let Some(uid) = uid {
        if let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) {
            session.set_session_username(&user.name);
        }
    }

    info!(id = session.id(), "Controller approved for session");

    // Command loop.
    loop {
        let command = match read_token(&mut read).await? {
            Some(command) => command,
            None => return Ok(()),
        };

        match command.as_str() {
            "VISIBLE" => {
                let value = match read_token(&mut read).await? {
                    Some(value) => value,
                    None => return Ok(()),
                };
                match parse_bool(&value) {
                    Some(visible) => session.mark_visible(visible),
                    None => debug!(value, "Ignoring malformed VISIBLE argument"),
                }
            }
            other => {
                debug!(command = other, "Ignoring unknown controller command");
            }
        }
    }
}

async fn wait_for_approval(session: &Session, key: &str) -> bool {
    for _ in 0..=APPROVAL_TRIES {
        if session.is_key_approved(key) {
            return true;
        }
        tokio::time::sleep(APPROVAL_INTERVAL).await;
    }
    false
}

fn parse_bool(token: &str) -> Option<bool> {
    match token {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Read one whitespace-delimited token. Returns `None` on EOF before any
/// token byte.
async fn read_token<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut token = Vec::new();

    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte).await {
            Ok(0) => {
                if token.is_empty() {
                    return Ok(None);
                }
                break;
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        if byte[0].is_ascii_whitespace() {
            if token.is_empty() {
                continue;
            }
            break;
        }

        token.push(byte[0]);
    }

    Ok(Some(String::from_utf8_lossy(&token).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn tokens_are_whitespace_delimited() {
        let mut reader = BufReader::new(Cursor::new(b"  12\nabc def\t VISIBLE 1".to_vec()));
        assert_eq!(read_token(&mut reader).await.unwrap().unwrap(), "12");
        assert_eq!(read_token(&mut reader).await.unwrap().unwrap(), "abc");
        assert_eq!(read_token(&mut reader).await.unwrap().unwrap(), "def");
        assert_eq!(read_token(&mut reader).await.unwrap().unwrap(), "VISIBLE");
        assert_eq!(read_token(&mut reader).await.unwrap().unwrap(), "1");
        assert_eq!(read_token(&mut reader).await.unwrap(), None);
    }

    #[test]
    fn bools_accept_numeric_and_named_forms() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }

    #[tokio::test]
    async fn controller_handshake_marks_session_visible() {
        let registry = SessionRegistry::new();
        let session = registry.insert_fake(7);
        session.set_desktop_name("CONTROLLER_KEY:abc123");

        let (helper, server) = UnixStream::pair().unwrap();

        let handler = {
            let registry = registry.clone();
            tokio::spawn(async move { handle_controller(server, None, &registry).await })
        };

        let (read, mut write) = helper.into_split();
        let mut read = BufReader::new(read);

        write.write_all(b"7\n").await.unwrap();
        let mut line = String::new();
        read.read_line(&mut line).await.unwrap();
        assert_eq!(line, "OK\n");

        write.write_all(b"abc123\n").await.unwrap();
        line.clear();
        read.read_line(&mut line).await.unwrap();
        assert_eq!(line, "OK\n");

        let version_before = registry.list_version();
        write.write_all(b"VISIBLE 1\n").await.unwrap();
        drop(write);

        handler.await.unwrap().unwrap();
        assert!(session.visible());
        assert!(registry.list_version() > version_before);
    }

    #[tokio::test]
    async fn unknown_display_closes_without_ok() {
        let registry = SessionRegistry::new();

        let (helper, server) = UnixStream::pair().unwrap();
        let handler = {
            let registry = registry.clone();
            tokio::spawn(async move { handle_controller(server, None, &registry).await })
        };

        let (read, mut write) = helper.into_split();
        let mut read = BufReader::new(read);

        write.write_all(b"42\n").await.unwrap();

        let mut buffer = Vec::new();
        read.read_to_end(&mut buffer).await.unwrap();
        assert!(buffer.is_empty());

        handler.await.unwrap().unwrap();
    }
}
