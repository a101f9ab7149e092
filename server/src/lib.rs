//! Launches note engines as child processes, tracks one per workspace, and
//! talks to them over a typed HTTP API.
//!
//! The parent side is [`supervisor::launch`] plus a [`workspace::WorkspaceRegistry`];
//! the child side is [`child::run_as_child`], which hosts [`engine`].

pub mod api;
pub mod child;
pub mod config;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod protocol;
pub mod rpc;
pub mod store;
pub mod supervisor;
pub mod workspace;

pub use error::{ChildError, ConfigError, EngineError, LaunchError, NotFoundError};
pub use rpc::RpcClient;
pub use supervisor::{launch, HandshakeResult, ProcessHandle};
pub use workspace::{normalize, EngineHandle, WorkspaceKey, WorkspaceRegistry};
