use std::io;
use thiserror::Error;

use crate::session::SessionState;

/// Failures of one pass through the supervisor loop. Only `Startup` is fatal.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("startup failed: {0}")]
    Startup(String),
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] HandlerError),
    #[error("failed to start update sender: {0}")]
    UpdaterStart(#[source] HandlerError),
    #[error("failed to stop update sender: {0}")]
    UpdaterStop(#[source] HandlerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("address {0} already in use")]
    AddressInUse(std::net::SocketAddr),
    #[error("socket creation failed: {0}")]
    SocketFailed(#[source] io::Error),
    #[error("bind failed: {0}")]
    BindFailed(#[source] io::Error),
    #[error("listen failed: {0}")]
    ListenFailed(#[source] io::Error),
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] io::Error),
    /// `connect` called on a session that was not reset first.
    #[error("connect called in state {0:?}, expected Initialized")]
    InvalidState(SessionState),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// No update sender is running; the producer should wait for readiness.
    #[error("producers are paused")]
    Paused,
    #[error("update region lies outside the framebuffer")]
    EmptyRegion,
    #[error("no free update descriptor")]
    Full,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("display {0} out of range")]
    OutOfRange(usize),
    #[error("display {0} already has a session")]
    AlreadyRegistered(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("display {display} out of range (max {max})")]
    DisplayOutOfRange { display: usize, max: usize },
    #[error("update pool needs at least one descriptor")]
    NoUpdates,
    #[error("invalid geometry {0}x{1}")]
    Geometry(u16, u16),
    #[error("no port for display {display} above base {base}")]
    Port { base: u16, display: usize },
}

/// Errors raised by the protocol collaborators behind `SessionHandler`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("client rejected security type {0}")]
    SecurityRejected(u8),
    #[error("thread error: {0}")]
    Thread(String),
    #[error("session has no client transport")]
    NotConnected,
}
