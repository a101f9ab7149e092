use std::path::PathBuf;

use crate::error::ConfigError;

pub const LOG_PATH: &str = "LOG_PATH";
pub const ENGINE_SERVER_PORT: &str = "ENGINE_SERVER_PORT";
pub const NEXT_SERVER_URL: &str = "NEXT_SERVER_URL";
pub const NEXT_STATIC_ROOT: &str = "NEXT_STATIC_ROOT";
pub const DATA_DIR: &str = "DATA_DIR";
/// Set by the launcher so the child knows its stdio is a supervisor channel.
pub const ENGINE_IPC_CHANNEL: &str = "ENGINE_IPC_CHANNEL";
pub const IPC_CHANNEL_STDIO: &str = "stdio";

const DEFAULT_DATA_DIR: &str = "./data";

/// Child-side settings, read from the environment the launcher prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
	pub log_path: PathBuf,
	pub port: Option<u16>,
	pub next_server_url: Option<String>,
	pub next_static_root: Option<PathBuf>,
	pub data_dir: PathBuf,
}

impl EngineConfig {
	pub fn load() -> Result<Self, ConfigError> {
		let _ = dotenvy::dotenv();
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
		let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
		let log_path = non_empty(LOG_PATH).map(PathBuf::from).ok_or(ConfigError::Missing(LOG_PATH))?;
		let port = match non_empty(ENGINE_SERVER_PORT) {
			Some(raw) => Some(parse_port(&raw)?),
			None => None,
		};
		let data_dir = non_empty(DATA_DIR).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
		Ok(Self {
			log_path,
			port,
			next_server_url: non_empty(NEXT_SERVER_URL),
			next_static_root: non_empty(NEXT_STATIC_ROOT).map(PathBuf::from),
			data_dir: PathBuf::from(data_dir),
		})
	}
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
	match raw.trim().parse::<u16>() {
		Ok(p) if p > 0 => Ok(p),
		_ => Err(ConfigError::Invalid { key: ENGINE_SERVER_PORT, value: raw.to_string() }),
	}
}

/// What the launcher needs to start one engine process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerLaunchArgs {
	pub script_path: PathBuf,
	pub args: Vec<String>,
	pub log_path: Option<PathBuf>,
	pub port: Option<u16>,
	pub next_server_url: Option<String>,
	pub next_static_root: Option<PathBuf>,
	pub data_dir: Option<PathBuf>,
}

impl ServerLaunchArgs {
	pub fn new(script_path: impl Into<PathBuf>) -> Self {
		Self { script_path: script_path.into(), ..Self::default() }
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self { self.args.push(arg.into()); self }

	pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self { self.log_path = Some(path.into()); self }

	pub fn port(mut self, port: u16) -> Self { self.port = Some(port); self }

	pub fn next_server_url(mut self, url: impl Into<String>) -> Self { self.next_server_url = Some(url.into()); self }

	pub fn next_static_root(mut self, root: impl Into<PathBuf>) -> Self { self.next_static_root = Some(root.into()); self }

	pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self { self.data_dir = Some(dir.into()); self }
}

/// Environment variables handed to the child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEnvironment {
	vars: Vec<(&'static str, String)>,
}

impl ServerEnvironment {
	pub fn from_args(args: &ServerLaunchArgs) -> Result<Self, ConfigError> {
		let log_path = args
			.log_path
			.as_ref()
			.filter(|p| !p.as_os_str().is_empty())
			.ok_or(ConfigError::Missing(LOG_PATH))?;
		let mut vars = vec![
			(LOG_PATH, log_path.to_string_lossy().into_owned()),
			(ENGINE_IPC_CHANNEL, IPC_CHANNEL_STDIO.to_string()),
		];
		if let Some(port) = args.port {
			if port == 0 { return Err(ConfigError::Invalid { key: ENGINE_SERVER_PORT, value: "0".to_string() }); }
			vars.push((ENGINE_SERVER_PORT, port.to_string()));
		}
		if let Some(url) = &args.next_server_url { vars.push((NEXT_SERVER_URL, url.clone())); }
		if let Some(root) = &args.next_static_root { vars.push((NEXT_STATIC_ROOT, root.to_string_lossy().into_owned())); }
		if let Some(dir) = &args.data_dir { vars.push((DATA_DIR, dir.to_string_lossy().into_owned())); }
		Ok(Self { vars })
	}

	pub fn vars(&self) -> &[(&'static str, String)] { &self.vars }

	pub fn get(&self, key: &str) -> Option<&str> {
		self.vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
	}
}
