//! Listener/supervisor: TCP accept loops, the control socket and terminal
//! signals.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nix::sys::socket::setsockopt;
use nix::sys::socket::sockopt::Ipv6V6Only;
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::ControlListener;
use crate::session::SessionRegistry;
use crate::tls::TlsProvider;
use crate::tunnel;

const LISTEN_QUEUE: u32 = 32;

pub struct Server {
    listeners: Vec<TcpListener>,
    control: ControlListener,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
    tls: Arc<TlsProvider>,
}

impl Server {
    /// Bind all configured listen addresses and the control socket.
    pub fn bind(config: Config) -> Result<Self> {
        let tls = TlsProvider::from_config(&config)?;

        let addresses = if config.listen.is_empty() {
            // All interfaces; v6 sockets are v6-only so the pair coexists.
            vec!["0.0.0.0".to_string(), "::".to_string()]
        } else {
            config.listen.clone()
        };

        let mut listeners = Vec::new();
        for address in &addresses {
            match resolve_and_bind(address, config.port) {
                Ok(mut bound) => listeners.append(&mut bound),
                Err(e) => warn!(address, error = %e, "Failed to listen on address"),
            }
        }

        if listeners.is_empty() {
            bail!("Could not bind to any address.");
        }

        let control = ControlListener::bind(&config)
            .context("Failed to create the control socket")?;

        Ok(Self {
            listeners,
            control,
            registry: SessionRegistry::new(),
            config: Arc::new(config),
            tls: Arc::new(tls),
        })
    }

    /// Serve until SIGINT or SIGTERM. Client tunnels and control helpers
    /// run as independent tasks and are torn down with the process.
    pub async fn run(self) -> Result<()> {
        for listener in self.listeners {
            let registry = self.registry.clone();
            let config = self.config.clone();
            let tls = self.tls.clone();
            tokio::spawn(accept_loop(listener, registry, config, tls));
        }

        tokio::spawn(self.control.run(self.registry.clone()));

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = interrupt.recv() => info!("Interrupted, shutting down"),
            _ = terminate.recv() => info!("Terminated, shutting down"),
        }

        Ok(())
    }
}

fn resolve_and_bind(address: &str, port: u16) -> Result<Vec<TcpListener>> {
    let resolved: Vec<SocketAddr> = (address, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", address))?
        .collect();

    let mut listeners = Vec::new();
    for addr in resolved {
        match bind_one(addr) {
            Ok(listener) => {
                debug!(%addr, "Listening");
                listeners.push(listener);
            }
            Err(e) => warn!(%addr, error = %e, "Failed to bind"),
        }
    }

    if listeners.is_empty() {
        bail!("No usable address for {}", address);
    }

    Ok(listeners)
}

fn bind_one(addr: SocketAddr) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => {
            let socket = TcpSocket::new_v6()?;
            // Keep wildcard v4 and v6 listeners from colliding.
            setsockopt(&socket, Ipv6V6Only, &true)?;
            socket
        }
    };

    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_QUEUE)?)
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
    tls: Arc<TlsProvider>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(tunnel::run_client(
                    stream,
                    peer,
                    registry.clone(),
                    config.clone(),
                    tls.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept client connection");
            }
        }
    }
}
