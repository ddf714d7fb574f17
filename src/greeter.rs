//! The greeter subprocess and its line protocol.
//!
//! The greeter is a user-facing chooser drawn on a freshly created session's
//! display. Its stdin/stdout form a text channel: the proxy pushes the
//! visible session list and password/credentials requests down, the greeter
//! answers with session choices and collected secrets.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::SessionRegistry;

/// One parsed line from the greeter. Unknown lines are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreeterEvent {
    /// Create a new session and switch to it.
    NewSession,
    /// Switch to the given existing session.
    OpenSession(u32),
    /// Response to `GET PASSWORD`.
    Password(String),
    /// Response to `GET CREDENTIALS`.
    Credentials(String, String),
    Ignored,
}

/// Parse one greeter output line. Tokens are whitespace-delimited, so
/// passwords containing whitespace are not representable in this grammar.
pub fn parse_greeter_line(line: &str) -> GreeterEvent {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("NEW") => GreeterEvent::NewSession,
        Some("OPEN") => match tokens.next().and_then(|t| t.parse().ok()) {
            Some(id) => GreeterEvent::OpenSession(id),
            None => GreeterEvent::Ignored,
        },
        Some("PASSWORD") => match tokens.next() {
            Some(password) => GreeterEvent::Password(password.to_string()),
            None => GreeterEvent::Ignored,
        },
        Some("CREDENTIALS") => match (tokens.next(), tokens.next()) {
            (Some(username), Some(password)) => {
                GreeterEvent::Credentials(username.to_string(), password.to_string())
            }
            _ => GreeterEvent::Ignored,
        },
        _ => GreeterEvent::Ignored,
    }
}

/// A running greeter child and the channel to it.
pub struct GreeterConnection {
    pid: u32,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    dead: Arc<AtomicBool>,
    last_sent_list_version: u64,
}

impl GreeterConnection {
    /// Spawn the greeter program on the given display.
    pub fn spawn(config: &Config, display: &str, xauth_path: Option<&Path>) -> Result<Self> {
        let mut command = Command::new(&config.greeter);
        command
            .env_clear()
            .env("DISPLAY", display)
            .env(
                "XAUTHORITY",
                xauth_path.map(|p| p.as_os_str().to_owned()).unwrap_or_default(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().expect("greeter stdin is piped");
        let stdout = child.stdout.take().expect("greeter stdout is piped");

        let display_name = display;
        debug!(pid, display = display_name, "Spawned greeter");

        let dead = Arc::new(AtomicBool::new(false));
        let dead_flag = dead.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            debug!(pid, "Greeter died");
            dead_flag.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            pid,
            stdin,
            lines: BufReader::new(stdout).lines(),
            dead,
            last_sent_list_version: 0,
        })
    }

    /// Keep the greeter up to date: fail out if it died, and retransmit the
    /// session list when the registry has changed since the last send.
    pub async fn update(&mut self, registry: &SessionRegistry) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::GreeterDied);
        }

        let current_version = registry.list_version();
        if self.last_sent_list_version < current_version {
            self.last_sent_list_version = current_version;
            self.send_sessions(registry).await?;
        }

        Ok(())
    }

    async fn send_sessions(&mut self, registry: &SessionRegistry) -> Result<()> {
        let sessions: Vec<_> = registry
            .session_list()
            .into_iter()
            .filter(|s| s.visible())
            .collect();

        let mut text = format!("SESSIONS\n{}\n", sessions.len());
        for session in sessions {
            text.push_str(&format!(
                "{} {} {}\n",
                session.id(),
                session.session_username(),
                session.desktop_name()
            ));
        }

        self.send(&text).await
    }

    pub async fn ask_for_password(&mut self) -> Result<()> {
        self.send("GET PASSWORD\n").await
    }

    pub async fn ask_for_credentials(&mut self) -> Result<()> {
        self.send("GET CREDENTIALS\n").await
    }

    pub async fn show_error(&mut self, error: &str) -> Result<()> {
        self.send(&format!("ERROR\n{}\nEND ERROR\n", error)).await
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        self.stdin.write_all(text.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Wait for the next greeter line. Cancel-safe; EOF means the greeter
    /// went away.
    pub async fn next_event(&mut self) -> Result<GreeterEvent> {
        match self.lines.next_line().await? {
            Some(line) => Ok(parse_greeter_line(&line)),
            None => Err(Error::GreeterDied),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for GreeterConnection {
    fn drop(&mut self) {
        if !self.dead.load(Ordering::SeqCst) && self.pid != 0 {
            debug!(pid = self.pid, "Terminating greeter");
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_lines_are_parsed() {
        assert_eq!(parse_greeter_line("NEW"), GreeterEvent::NewSession);
        assert_eq!(parse_greeter_line("OPEN 3"), GreeterEvent::OpenSession(3));
        assert_eq!(
            parse_greeter_line("PASSWORD hunter2"),
            GreeterEvent::Password("hunter2".to_string())
        );
        assert_eq!(
            parse_greeter_line("CREDENTIALS joe hunter2"),
            GreeterEvent::Credentials("joe".to_string(), "hunter2".to_string())
        );
    }

    #[test]
    fn malformed_and_unknown_lines_are_ignored() {
        assert_eq!(parse_greeter_line(""), GreeterEvent::Ignored);
        assert_eq!(parse_greeter_line("HELLO"), GreeterEvent::Ignored);
        assert_eq!(parse_greeter_line("OPEN"), GreeterEvent::Ignored);
        assert_eq!(parse_greeter_line("OPEN abc"), GreeterEvent::Ignored);
        assert_eq!(parse_greeter_line("PASSWORD"), GreeterEvent::Ignored);
        assert_eq!(parse_greeter_line("CREDENTIALS joe"), GreeterEvent::Ignored);
    }

    #[test]
    fn leading_whitespace_is_tolerated() {
        assert_eq!(parse_greeter_line("  NEW  "), GreeterEvent::NewSession);
        assert_eq!(parse_greeter_line("OPEN  7"), GreeterEvent::OpenSession(7));
    }
}
