//! Child side of the launch protocol: bind, report the port to the parent over
//! stdout, then serve until told to stop or orphaned.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{EngineConfig, ENGINE_IPC_CHANNEL, IPC_CHANNEL_STDIO};
use crate::engine::{self, AppState};
use crate::error::ChildError;
use crate::handshake::HandshakeMessage;

pub fn has_parent_channel() -> bool {
	std::env::var(ENGINE_IPC_CHANNEL).map(|v| v == IPC_CHANNEL_STDIO).unwrap_or(false)
}

/// Run the engine as a launched child. Fails with `NotAChild` when no launcher
/// set up the IPC channel.
pub async fn run_as_child() -> Result<(), ChildError> {
	if !has_parent_channel() {
		return Err(ChildError::NotAChild);
	}
	let config = EngineConfig::load()?;
	init_file_tracing(&config.log_path)?;

	let state = Arc::new(AppState::open(&config)?);
	let listener = engine::bind(config.port).await?;
	let port = listener.local_addr().map_err(anyhow::Error::from)?.port();
	send_handshake(&mut tokio::io::stdout(), port).await.map_err(ChildError::Handshake)?;
	info!(port, pid = std::process::id(), "handshake sent");

	engine::serve(listener, state, shutdown_signal()).await?;
	Ok(())
}

/// Write the port line and flush. This is the only thing ever written to the
/// channel.
pub async fn send_handshake<W: AsyncWrite + Unpin>(channel: &mut W, port: u16) -> std::io::Result<()> {
	let line = format!("{}\n", HandshakeMessage::Port(port));
	channel.write_all(line.as_bytes()).await?;
	channel.flush().await
}

// stdout belongs to the parent, so logs go to LOG_PATH.
fn init_file_tracing(path: &Path) -> Result<(), ChildError> {
	let log_file = |source: std::io::Error| ChildError::LogFile { path: path.to_path_buf(), source };
	if let Some(dir) = path.parent() {
		std::fs::create_dir_all(dir).map_err(log_file)?;
	}
	let file = OpenOptions::new().create(true).append(true).open(path).map_err(log_file)?;
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(Arc::new(file));
	let _ = tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init();
	Ok(())
}

async fn shutdown_signal() {
	let parent_gone = watch_parent_stdin();
	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut sig) => { sig.recv().await; }
			Err(e) => {
				warn!(error = %e, "cannot listen for SIGTERM");
				std::future::pending::<()>().await
			}
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = tokio::signal::ctrl_c() => info!("interrupted"),
		_ = terminate => info!("terminated by parent"),
		res = parent_gone => match res {
			Ok(()) => info!("parent channel closed"),
			Err(_) => std::future::pending::<()>().await,
		},
	}
}

/// Resolves once stdin hits EOF, which happens when the parent goes away.
/// Reads on a plain thread so a blocked read never holds up runtime shutdown.
fn watch_parent_stdin() -> oneshot::Receiver<()> {
	let (tx, rx) = oneshot::channel();
	let spawned = std::thread::Builder::new().name("parent-watch".to_string()).spawn(move || {
		let mut stdin = std::io::stdin().lock();
		let mut buf = [0u8; 256];
		loop {
			match stdin.read(&mut buf) {
				Ok(0) | Err(_) => break,
				Ok(_) => continue,
			}
		}
		let _ = tx.send(());
	});
	if let Err(e) = spawned {
		warn!(error = %e, "cannot watch parent channel");
	}
	rx
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_handshake_is_one_decimal_line() {
		let mut wire: Vec<u8> = Vec::new();
		send_handshake(&mut wire, 41234).await.unwrap();
		assert_eq!(wire, b"41234\n");
		let text = String::from_utf8(wire).unwrap();
		assert_eq!(HandshakeMessage::parse(&text).map(HandshakeMessage::port), Ok(41234));
	}

	#[test]
	fn test_log_file_is_created_in_append_mode() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("logs").join("engine.log");
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		std::fs::write(&path, "earlier\n").unwrap();
		init_file_tracing(&path).unwrap();
		assert!(std::fs::read_to_string(&path).unwrap().starts_with("earlier\n"));
	}

	#[test]
	fn test_unwritable_log_path_is_reported() {
		let dir = tempfile::tempdir().unwrap();
		let err = init_file_tracing(dir.path()).unwrap_err();
		assert!(matches!(err, ChildError::LogFile { .. }));
	}
}
