//! Error types for the supervisor, the registry, the child entry point and
//! the engine service.
//!
//! RPC failures are not here: they travel as data inside
//! [`ApiPayload`](crate::protocol::ApiPayload).

use thiserror::Error;

use crate::workspace::WorkspaceKey;

/// A required setting is missing or unusable. Raised before anything is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Terminal outcome of a launch attempt that never produced a port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The process terminated and its stdio closed before the handshake.
    #[error("engine process closed before the handshake (code: {code:?})")]
    ProcessClosed { code: Option<i32> },

    /// The IPC channel went away before the handshake.
    #[error("engine process disconnected before the handshake")]
    ProcessDisconnected,

    #[error("engine process exited before the handshake (code: {code:?})")]
    ProcessExited { code: Option<i32> },

    /// The process could not be started at all, or its channel failed.
    #[error("failed to spawn engine process: {detail}")]
    ProcessSpawnError { detail: String },

    /// The handshake payload was not a positive port number.
    #[error("engine reported an invalid port: {payload:?}")]
    InvalidPort { payload: String },
}

impl LaunchError {
    /// Exit code carried by `ProcessClosed` / `ProcessExited`.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ProcessClosed { code } | Self::ProcessExited { code } => *code,
            _ => None,
        }
    }
}

/// Registry lookup miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no engine registered for workspace {0}")]
pub struct NotFoundError(pub WorkspaceKey);

/// Failures of the child-side entry point before it can serve.
#[derive(Error, Debug)]
pub enum ChildError {
    #[error("not running as a child: no IPC channel to a parent process")]
    NotAChild,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open log file {}: {source}", .path.display())]
    LogFile { path: std::path::PathBuf, source: std::io::Error },

    #[error("failed to send handshake: {0}")]
    Handshake(#[source] std::io::Error),

    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Request-level failures of the engine service. Each maps to an HTTP status.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workspace {0} is not initialized")]
    WorkspaceNotInitialized(String),

    #[error("note {0} does not exist")]
    NoteNotFound(String),

    #[error("schema {0} does not exist")]
    SchemaNotFound(String),

    #[error("a note named {0} already exists")]
    FnameTaken(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
