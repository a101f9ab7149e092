use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use note_engine::config::ServerLaunchArgs;
use note_engine::protocol::WorkspaceInitRequest;
use note_engine::rpc::TracingRpcLogger;
use note_engine::{child, launch, normalize, EngineHandle, WorkspaceRegistry};

#[derive(Parser, Debug)]
#[command(name = "note-engine", version, about = "Per-workspace note engine and its launcher")]
struct Cli {
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run as a launched engine child (default)
	Serve,
	/// Launch an engine for one workspace and keep it running until ctrl-c
	Launch(LaunchCmd),
}

#[derive(Args, Debug)]
struct LaunchCmd {
	/// Workspace root to initialize
	#[arg(long)]
	workspace: String,

	/// Log file for the engine process
	#[arg(long, env = "LOG_PATH")]
	log_path: PathBuf,

	/// Fixed port for the engine (ephemeral when unset)
	#[arg(long, env = "ENGINE_SERVER_PORT")]
	port: Option<u16>,

	/// Data directory root for the engine
	#[arg(long, env = "DATA_DIR")]
	data_dir: Option<PathBuf>,

	#[arg(long, env = "NEXT_SERVER_URL")]
	next_server_url: Option<String>,

	#[arg(long, env = "NEXT_STATIC_ROOT")]
	next_static_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let _ = dotenvy::dotenv();
	let cli = Cli::parse();
	match cli.command.unwrap_or(Command::Serve) {
		Command::Serve => Ok(child::run_as_child().await?),
		Command::Launch(cmd) => {
			init_tracing();
			launch_workspace(cmd).await
		}
	}
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	// stdout carries the JSON summary only
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

async fn launch_workspace(cmd: LaunchCmd) -> Result<()> {
	let mut args = ServerLaunchArgs::new(std::env::current_exe()?).arg("serve").log_path(cmd.log_path);
	if let Some(port) = cmd.port { args = args.port(port); }
	if let Some(dir) = cmd.data_dir { args = args.data_dir(dir); }
	if let Some(url) = cmd.next_server_url { args = args.next_server_url(url); }
	if let Some(root) = cmd.next_static_root { args = args.next_static_root(root); }

	let registry: WorkspaceRegistry = WorkspaceRegistry::new();
	let key = normalize(&cmd.workspace);
	let launched = launch(&args)?.await?;
	registry.put(key.clone(), EngineHandle::new(key.clone(), launched));
	let engine = registry.get(&key)?;
	info!(workspace = %key, port = engine.port(), pid = engine.process().pid(), "engine ready");

	let client = engine.client().with_logger(Arc::new(TracingRpcLogger));
	let init = client.workspace_init(&WorkspaceInitRequest { ws: cmd.workspace.clone(), config: None }).await;
	match init.into_result() {
		Ok(data) => info!(notes = data.map(|d| d.notes.len()).unwrap_or(0), "workspace initialized"),
		Err(e) => {
			engine.process().terminate()?;
			bail!("workspace initialization failed: {}", e);
		}
	}
	println!("{}", serde_json::json!({ "workspace": key, "port": engine.port() }));

	tokio::select! {
		_ = signal::ctrl_c() => info!("shutdown signal received"),
		state = engine.process().wait_for_exit() => error!(?state, "engine process exited"),
	}
	registry.remove(&key);
	engine.process().terminate()?;
	Ok(())
}
