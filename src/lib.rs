//! Multiplexing VNC (RFB 3.8) front-end proxy with session management.
//!
//! The daemon terminates client VNC connections on a public TCP port,
//! negotiates security (including TLS/X.509 via the VeNCrypt extension) and
//! tunnels the RFB stream to one of several back-end Xvnc processes it
//! spawns and manages. A greeter subprocess lets clients create or
//! reconnect to sessions, and the live back-end can be switched underneath
//! a connected client while preserving the negotiated stream.

pub mod backend;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod greeter;
pub mod logging;
pub mod rfb;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;
pub mod tunnel;
