//! Back-end VNC sessions and their registry.
//!
//! Each session is one managed Xvnc child serving RFB over a unix-domain
//! socket that the child receives as stdin/stdout. Sessions are created on
//! demand by client tunnels and removed when their child exits.

use std::collections::{BTreeMap, HashSet};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Longest unix socket path accepted by sockaddr_un.
const MAX_SOCKET_PATH: usize = 107;

/// Fixed fd number the child finds its display-number pipe on.
const DISPLAYFD_SLOT: i32 = 3;

/// Desktop-name prefix the back-end uses to publish controller keys.
const CONTROLLER_KEY_PREFIX: &str = "CONTROLLER_KEY:";

const ALLOW_OVERRIDE: &str = "-AllowOverride=\
Desktop,AcceptPointerEvents,SendCutText,AcceptCutText,\
MaxDisconnectionTime,MaxConnectionTime,MaxIdleTime,QueryConnect,QueryConnectTimeOut,\
AlwaysShared,NeverShared,DisconnectClients,\
SecurityTypes,Password,PlainUsers";

#[derive(Default)]
struct SessionState {
    visible: bool,
    desktop_name: String,
    session_username: String,
    approved_controller_keys: HashSet<String>,
    connection_count: u32,
}

/// One managed back-end Xvnc instance.
pub struct Session {
    id: u32,
    pid: u32,
    display_number: u32,
    display: String,
    socket_path: PathBuf,
    xauth_path: Option<PathBuf>,
    #[allow(dead_code)]
    xauth_cookie: Option<String>,
    registry: Weak<SessionRegistry>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Spawn a back-end for this session. With `query_display_manager` the
    /// back-end queries the configured XDMCP host; otherwise it is a local
    /// session protected by a fresh xauth cookie.
    async fn spawn(
        registry: Weak<SessionRegistry>,
        id: u32,
        query_display_manager: bool,
        config: &Config,
    ) -> Result<(Session, Child)> {
        let socket_dir = config.rundir.join("socket");
        make_private_dir(&config.rundir, 0o755)?;
        make_private_dir(&socket_dir, 0o700)?;

        let socket_path = socket_dir.join(id.to_string());
        if socket_path.as_os_str().len() > MAX_SOCKET_PATH {
            return Err(Error::protocol(format!(
                "path to socket {:?} is too long",
                socket_path
            )));
        }

        let xauth_path = if query_display_manager {
            None
        } else {
            let auth_dir = config.rundir.join("auth");
            make_private_dir(&auth_dir, 0o700)?;
            Some(auth_dir.join(id.to_string()))
        };

        match std::fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = StdUnixListener::bind(&socket_path)?;

        // The child reports its display number as ASCII digits on this pipe.
        let (pipe_reader, pipe_writer) = std::io::pipe()?;

        let mut command = Command::new(&config.xvnc);
        command
            .arg("-log")
            // TcpSocket is confused by the unix socket it gets, so silence it.
            .arg("*:syslog:30,TcpSocket:syslog:-1")
            .arg("-inetd")
            .arg("-MaxDisconnectionTime=5")
            .arg("-securitytypes=none")
            .arg("-displayfd")
            .arg(DISPLAYFD_SLOT.to_string())
            .arg("-geometry")
            .arg(&config.geometry)
            .arg(ALLOW_OVERRIDE);

        if query_display_manager {
            command
                .arg("-query")
                .arg(&config.query)
                .arg("-once")
                .arg("-desktop")
                .arg("New session");
        } else {
            command
                .arg("-auth")
                .arg(xauth_path.as_ref().unwrap())
                .arg("-desktop")
                .arg("VNC manager");
        }

        command.args(&config.xvnc_args);

        // The back-end speaks RFB over fd 0/1, which both point at the
        // listening socket.
        let stdin_listener = listener.try_clone()?;
        command.stdin(Stdio::from(OwnedFd::from(stdin_listener)));
        command.stdout(Stdio::from(OwnedFd::from(listener)));

        let pipe_raw = pipe_writer.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // Pin the displayfd pipe to a known fd and strip CLOEXEC.
                if pipe_raw == DISPLAYFD_SLOT {
                    let flags = libc::fcntl(DISPLAYFD_SLOT, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(DISPLAYFD_SLOT, libc::F_SETFD, flags & !libc::FD_CLOEXEC)
                            < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(pipe_raw, DISPLAYFD_SLOT) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        drop(pipe_writer);

        let display_number = read_display_number(pipe_reader).await?;
        let display = format!(":{}", display_number);

        let mut session = Session {
            id,
            pid,
            display_number,
            display,
            socket_path,
            xauth_path,
            xauth_cookie: None,
            registry,
            state: Mutex::new(SessionState::default()),
        };

        if !query_display_manager {
            session.generate_xauthority_file(config).await?;
        }

        info!(
            id = session.id,
            pid = session.pid,
            display = %session.display,
            "Spawned back-end session"
        );

        Ok((session, child))
    }

    /// Install a fresh MIT-MAGIC-COOKIE via the external xauth tool.
    async fn generate_xauthority_file(&mut self, config: &Config) -> Result<()> {
        const DIGITS: &[u8] = b"0123456789abcdef";
        let cookie: String = {
            let mut rng = rand::thread_rng();
            (0..32)
                .map(|_| DIGITS[rng.gen_range(0..16)] as char)
                .collect()
        };

        let path = self.xauth_path.as_ref().unwrap();

        // Pre-create the file with the right permissions so xauth doesn't
        // complain.
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o770)
            .open(path)?;

        let mut child = Command::new(&config.xauth)
            .arg("-f")
            .arg(path)
            .arg("-q")
            .stdin(Stdio::piped())
            .spawn()?;

        let script = format!(
            "remove {display}\nadd {display} . {cookie}\nexit\n",
            display = self.display,
            cookie = cookie
        );
        let mut stdin = child.stdin.take().expect("xauth stdin is piped");
        stdin.write_all(script.as_bytes()).await?;
        drop(stdin);

        let status = child.wait().await?;
        if !status.success() {
            warn!(id = self.id, "xauth exited with {}", status);
        }

        self.xauth_cookie = Some(cookie);
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn display_number(&self) -> u32 {
        self.display_number
    }

    /// The X display string, e.g. ":3".
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn xauth_path(&self) -> Option<&Path> {
        self.xauth_path.as_deref()
    }

    pub fn visible(&self) -> bool {
        self.state.lock().unwrap().visible
    }

    pub fn desktop_name(&self) -> String {
        self.state.lock().unwrap().desktop_name.clone()
    }

    pub fn session_username(&self) -> String {
        self.state.lock().unwrap().session_username.clone()
    }

    pub fn mark_visible(&self, visible: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.visible == visible {
                return;
            }
            state.visible = visible;
        }
        self.notify_changed();
    }

    /// Adopt the desktop name the back-end reported. A name carrying the
    /// controller-key prefix approves the key instead of renaming.
    pub fn set_desktop_name(&self, name: &str) {
        {
            let mut state = self.state.lock().unwrap();

            if let Some(key) = name.strip_prefix(CONTROLLER_KEY_PREFIX) {
                state.approved_controller_keys.insert(key.to_string());
                return;
            }

            if state.desktop_name == name {
                return;
            }
            state.desktop_name = name.to_string();
        }
        self.notify_changed();
    }

    pub fn set_session_username(&self, username: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.session_username == username {
                return;
            }
            state.session_username = username.to_string();
        }
        self.notify_changed();
    }

    pub fn is_key_approved(&self, key: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .approved_controller_keys
            .contains(key)
    }

    /// Open a fresh RFB stream to this session's back-end.
    pub async fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        self.state.lock().unwrap().connection_count += 1;
        Ok(stream)
    }

    pub fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.connection_count > 0);
        state.connection_count = state.connection_count.saturating_sub(1);
    }

    pub fn connection_count(&self) -> u32 {
        self.state.lock().unwrap().connection_count
    }

    fn notify_changed(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.notify_session_changed();
        }
    }

    /// Count a connection that was opened outside `connect`.
    #[cfg(test)]
    pub(crate) fn note_connect(&self) {
        self.state.lock().unwrap().connection_count += 1;
    }

    /// Construct a session with no child behind it.
    #[cfg(test)]
    pub(crate) fn fake(registry: Weak<SessionRegistry>, id: u32, display_number: u32) -> Session {
        Session {
            id,
            pid: 0,
            display_number,
            display: format!(":{}", display_number),
            socket_path: PathBuf::from(format!("/nonexistent/socket/{}", id)),
            xauth_path: None,
            xauth_cookie: None,
            registry,
            state: Mutex::new(SessionState::default()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(xauth) = &self.xauth_path {
            let _ = std::fs::remove_file(xauth);
        }
    }
}

fn make_private_dir(path: &Path, mode: u32) -> Result<()> {
    match std::fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read ASCII digits terminated by a newline from the displayfd pipe.
async fn read_display_number(pipe: std::io::PipeReader) -> Result<u32> {
    let file = std::fs::File::from(OwnedFd::from(pipe));
    let mut file = tokio::fs::File::from_std(file);

    let mut number: u32 = 0;
    loop {
        let mut byte = [0u8; 1];
        match file.read(&mut byte).await {
            Ok(0) => {
                return Err(Error::protocol(
                    "back-end did not report a display number",
                ))
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        match byte[0] {
            b'0'..=b'9' => number = number * 10 + u32::from(byte[0] - b'0'),
            b'\n' => return Ok(number),
            _ => {}
        }
    }
}

struct RegistryInner {
    sessions: BTreeMap<u32, Arc<Session>>,
    next_id: u32,
    list_version: u64,
}

/// Thread-safe mapping of session ids to sessions, with a version counter
/// bumped on every externally observable change.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                sessions: BTreeMap::new(),
                next_id: 0,
                list_version: 0,
            }),
        })
    }

    /// Spawn a new back-end and register it. The child is watched; when it
    /// exits the session is removed.
    pub async fn create_session(
        self: &Arc<Self>,
        query_display_manager: bool,
        config: &Config,
    ) -> Result<Arc<Session>> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };

        let (session, mut child) =
            Session::spawn(Arc::downgrade(self), id, query_display_manager, config).await?;
        let session = Arc::new(session);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.sessions.insert(id, session.clone());
            inner.list_version += 1;
        }

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = child.wait().await;
            if let Some(registry) = registry.upgrade() {
                registry.session_exited(id);
            }
        });

        Ok(session)
    }

    pub fn get_session(&self, id: u32) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn get_session_by_display_number(&self, display_number: u32) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .find(|s| s.display_number() == display_number)
            .cloned()
    }

    /// Snapshot of all sessions, ordered by id.
    pub fn session_list(&self) -> Vec<Arc<Session>> {
        self.inner.lock().unwrap().sessions.values().cloned().collect()
    }

    pub fn has_visible_sessions(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .any(|s| s.visible())
    }

    pub fn list_version(&self) -> u64 {
        self.inner.lock().unwrap().list_version
    }

    pub fn notify_session_changed(&self) {
        self.inner.lock().unwrap().list_version += 1;
    }

    fn session_exited(&self, id: u32) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.sessions.remove(&id);
            if removed.is_some() {
                inner.list_version += 1;
            }
            removed
        };
        if removed.is_some() {
            debug!(id, "Back-end session exited");
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_fake(self: &Arc<Self>, display_number: u32) -> Arc<Session> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let session = Arc::new(Session::fake(Arc::downgrade(self), id, display_number));
        inner.sessions.insert(id, session.clone());
        inner.list_version += 1;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_version_is_monotonic_and_bumps_on_changes() {
        let registry = SessionRegistry::new();
        let v0 = registry.list_version();

        let session = registry.insert_fake(4);
        let v1 = registry.list_version();
        assert!(v1 > v0);

        session.mark_visible(true);
        let v2 = registry.list_version();
        assert!(v2 > v1);

        // Unchanged values do not bump the version.
        session.mark_visible(true);
        assert_eq!(registry.list_version(), v2);

        session.set_desktop_name("desk");
        let v3 = registry.list_version();
        assert!(v3 > v2);
        session.set_desktop_name("desk");
        assert_eq!(registry.list_version(), v3);

        session.set_session_username("joe");
        assert!(registry.list_version() > v3);
    }

    #[test]
    fn controller_key_is_captured_not_propagated() {
        let registry = SessionRegistry::new();
        let session = registry.insert_fake(1);
        session.set_desktop_name("desk");
        let version = registry.list_version();

        session.set_desktop_name("CONTROLLER_KEY:abc123");

        assert!(session.is_key_approved("abc123"));
        assert!(!session.is_key_approved("other"));
        // The rename is swallowed: name and version are untouched.
        assert_eq!(session.desktop_name(), "desk");
        assert_eq!(registry.list_version(), version);
    }

    #[test]
    fn session_ids_are_unique_and_lookup_works() {
        let registry = SessionRegistry::new();
        let a = registry.insert_fake(10);
        let b = registry.insert_fake(11);
        assert_ne!(a.id(), b.id());

        assert_eq!(registry.get_session(a.id()).unwrap().id(), a.id());
        assert!(registry.get_session(999).is_none());
        assert_eq!(
            registry.get_session_by_display_number(11).unwrap().id(),
            b.id()
        );
        assert!(registry.get_session_by_display_number(12).is_none());
    }

    #[test]
    fn visible_sessions_are_detected() {
        let registry = SessionRegistry::new();
        assert!(!registry.has_visible_sessions());

        let session = registry.insert_fake(2);
        assert!(!registry.has_visible_sessions());

        session.mark_visible(true);
        assert!(registry.has_visible_sessions());

        session.mark_visible(false);
        assert!(!registry.has_visible_sessions());
    }
}
