//! The engine service a child process hosts: note and schema storage for any
//! number of workspaces, served as JSON under `/api`.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pulldown_cmark::{Event as MdEvent, Parser as MdParser, Tag};
use regex::Regex;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::protocol::*;
use crate::rpc::RpcClient;
use crate::store;
use crate::workspace::{normalize, WorkspaceKey};

pub const ROOT_FNAME: &str = "root";

pub struct AppState {
	start_time: Instant,
	db: sled::Db,
	next_server_url: Option<String>,
	next_static_root: Option<PathBuf>,
	note_writes: StdMutex<()>,
}

impl AppState {
	pub fn new(db: sled::Db, next_server_url: Option<String>, next_static_root: Option<PathBuf>) -> Self {
		Self { start_time: Instant::now(), db, next_server_url, next_static_root, note_writes: StdMutex::new(()) }
	}

	/// Held across every note mutation: fname lookups and the inserts that
	/// depend on them must not interleave.
	fn note_writes(&self) -> MutexGuard<'_, ()> {
		self.note_writes.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Open (or create) the database under the configured data directory.
	pub fn open(config: &EngineConfig) -> Result<Self> {
		std::fs::create_dir_all(&config.data_dir)
			.with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;
		let db = sled::open(config.data_dir.join("engine"))?;
		Ok(Self::new(db, config.next_server_url.clone(), config.next_static_root.clone()))
	}
}

type ApiResult<T> = Result<Json<ApiPayload<T>>, EngineError>;

fn ok<T>(data: T) -> ApiResult<T> { Ok(Json(ApiPayload::success(data))) }

impl EngineError {
	pub fn status(&self) -> StatusCode {
		match self {
			Self::NoteNotFound(_) | Self::SchemaNotFound(_) => StatusCode::NOT_FOUND,
			Self::WorkspaceNotInitialized(_) | Self::FnameTaken(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
			Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for EngineError {
	fn into_response(self) -> Response {
		let status = self.status();
		if status.is_server_error() {
			error!(error = %self, "engine request failed");
		}
		let kind = if status == StatusCode::NOT_FOUND { ErrorKind::DoesNotExist } else { ErrorKind::UnknownError };
		let body = ApiPayload::<()>::failure(ErrorValue::new(kind, self.to_string()).with_code(status.as_u16()));
		(status, Json(body)).into_response()
	}
}

pub fn build_router(state: Arc<AppState>) -> Router {
	let api = Router::new()
		.route("/config/get", get(config_get))
		.route("/config/write", post(config_write))
		.route("/workspace/initialize", post(workspace_initialize))
		.route("/workspace/all", get(workspace_all))
		.route("/workspace/sync", post(workspace_sync))
		.route("/note/bulkAdd", post(note_bulk_add))
		.route("/note/delete", post(note_delete))
		.route("/note/getByPath", post(note_get_by_path))
		.route("/note/info", get(note_info))
		.route("/note/rename", post(note_rename))
		.route("/note/update", post(note_update))
		.route("/note/write", post(note_write))
		.route("/note/query", get(note_query))
		.route("/schema/delete", post(schema_delete))
		.route("/schema/get", get(schema_get))
		.route("/schema/query", get(schema_query))
		.route("/schema/write", post(schema_write))
		.route("/schema/update", post(schema_update));
	let mut router = Router::new()
		.route("/health", get(health))
		.nest("/api", api);
	if let Some(root) = state.next_static_root.clone() {
		router = router.fallback_service(ServeDir::new(root));
	}
	router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind the loopback listener, on an ephemeral port when none is requested.
pub async fn bind(port: Option<u16>) -> Result<TcpListener> {
	let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port.unwrap_or(0)));
	TcpListener::bind(addr).await.with_context(|| format!("failed to bind {}", addr))
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
	let addr = listener.local_addr()?;
	info!(%addr, "engine service listening");
	axum::serve(listener, build_router(state)).with_graceful_shutdown(shutdown).await?;
	info!("engine service stopped");
	Ok(())
}

/// An in-process engine, for embedding and tests.
pub struct RunningEngine {
	pub port: u16,
	shutdown: Option<oneshot::Sender<()>>,
	task: JoinHandle<Result<()>>,
}

impl RunningEngine {
	pub fn client(&self) -> RpcClient { RpcClient::for_port(self.port) }

	pub async fn stop(mut self) -> Result<()> {
		if let Some(tx) = self.shutdown.take() { let _ = tx.send(()); }
		self.task.await?
	}
}

pub async fn start(config: &EngineConfig) -> Result<RunningEngine> {
	let state = Arc::new(AppState::open(config)?);
	let listener = bind(config.port).await?;
	let port = listener.local_addr()?.port();
	let (tx, rx) = oneshot::channel();
	let task = tokio::spawn(serve(listener, state, async move { let _ = rx.await; }));
	Ok(RunningEngine { port, shutdown: Some(tx), task })
}

fn now_ms() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

pub fn content_hash(body: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(body.as_bytes());
	format!("{:x}", hasher.finalize())
}

fn fname_leaf(fname: &str) -> &str { fname.rsplit('.').next().unwrap_or(fname) }

/// Text of the first markdown heading, else the last fname segment.
pub fn derive_title(body: &str, fname: &str) -> String {
	let mut in_heading = false;
	let mut title = String::new();
	for event in MdParser::new(body) {
		match event {
			MdEvent::Start(Tag::Heading(..)) => in_heading = true,
			MdEvent::Text(t) | MdEvent::Code(t) if in_heading => title.push_str(&t),
			MdEvent::End(Tag::Heading(..)) => {
				if !title.trim().is_empty() { return title.trim().to_string(); }
				in_heading = false;
			}
			_ => {}
		}
	}
	fname_leaf(fname).to_string()
}

fn validate_fname(fname: &str) -> Result<String, EngineError> {
	let fname = fname.trim();
	if fname.is_empty() || fname.starts_with('.') || fname.ends_with('.') || fname.contains("..") {
		return Err(EngineError::InvalidRequest(format!("invalid note name {:?}", fname)));
	}
	Ok(fname.to_string())
}

/// Dotted prefixes of an fname: `a.b.c` yields `a` and `a.b`.
fn ancestors(fname: &str) -> impl Iterator<Item = &str> {
	fname.char_indices().filter(|&(_, c)| c == '.').map(move |(i, _)| &fname[..i])
}

fn fill_derived(note: &mut NoteProps, now: i64) {
	if note.title.trim().is_empty() { note.title = derive_title(&note.body, &note.fname); }
	if !note.custom.is_object() { note.custom = JsonValue::Object(Default::default()); }
	note.content_hash = content_hash(&note.body);
	note.updated = now;
	note.stub = false;
}

fn initialized(db: &sled::Db, raw: &str) -> Result<WorkspaceKey, EngineError> {
	let ws = normalize(raw);
	if store::is_registered(db, &ws)? { Ok(ws) } else { Err(EngineError::WorkspaceNotInitialized(raw.to_string())) }
}

fn workspace_data(db: &sled::Db, ws: &WorkspaceKey) -> Result<WorkspaceData, EngineError> {
	Ok(WorkspaceData { notes: store::list_notes(db, ws)?, schemas: store::list_schemas(db, ws)? })
}

fn ensure_ancestors(db: &sled::Db, ws: &WorkspaceKey, fname: &str, now: i64, changes: &mut Vec<NoteChangeEntry>) -> Result<(), EngineError> {
	for parent in ancestors(fname) {
		if store::get_note_by_fname(db, ws, parent)?.is_some() { continue; }
		let stub = NoteProps {
			id: Uuid::new_v4().to_string(),
			title: fname_leaf(parent).to_string(),
			created: now,
			updated: now,
			stub: true,
			content_hash: content_hash(""),
			..NoteProps::new(parent, "")
		};
		store::put_note(db, ws, &stub)?;
		changes.push(NoteChangeEntry { status: ChangeStatus::Create, note: stub });
	}
	Ok(())
}

/// Removes stub ancestors of `fname` that no longer have children, deepest
/// first.
fn prune_stub_ancestors(db: &sled::Db, ws: &WorkspaceKey, fname: &str, changes: &mut Vec<NoteChangeEntry>) -> Result<(), EngineError> {
	let parents: Vec<&str> = ancestors(fname).collect();
	for parent in parents.into_iter().rev() {
		let Some(note) = store::get_note_by_fname(db, ws, parent)? else { continue };
		if !note.stub || note.fname == ROOT_FNAME || store::has_children(db, ws, parent)? {
			break;
		}
		store::delete_note(db, ws, &note.id)?;
		changes.push(NoteChangeEntry { status: ChangeStatus::Delete, note });
	}
	Ok(())
}

/// Upsert by fname. An existing note keeps its id and creation time.
fn write_note(db: &sled::Db, ws: &WorkspaceKey, mut note: NoteProps, now: i64) -> Result<Vec<NoteChangeEntry>, EngineError> {
	note.fname = validate_fname(&note.fname)?;
	let status = match store::get_note_by_fname(db, ws, &note.fname)? {
		Some(prev) => {
			note.id = prev.id;
			note.created = prev.created;
			ChangeStatus::Update
		}
		None => {
			if note.id.trim().is_empty() { note.id = Uuid::new_v4().to_string(); }
			if note.created <= 0 { note.created = now; }
			ChangeStatus::Create
		}
	};
	fill_derived(&mut note, now);
	let mut changes = Vec::new();
	ensure_ancestors(db, ws, &note.fname, now, &mut changes)?;
	store::put_note(db, ws, &note)?;
	changes.push(NoteChangeEntry { status, note });
	Ok(changes)
}

fn update_note(db: &sled::Db, ws: &WorkspaceKey, mut note: NoteProps, now: i64) -> Result<Vec<NoteChangeEntry>, EngineError> {
	let prev = store::get_note(db, ws, &note.id)?.ok_or_else(|| EngineError::NoteNotFound(note.id.clone()))?;
	note.fname = validate_fname(&note.fname)?;
	if let Some(other) = store::get_note_by_fname(db, ws, &note.fname)? {
		if other.id != note.id { return Err(EngineError::FnameTaken(note.fname)); }
	}
	note.created = prev.created;
	fill_derived(&mut note, now);
	let mut changes = Vec::new();
	ensure_ancestors(db, ws, &note.fname, now, &mut changes)?;
	store::put_note(db, ws, &note)?;
	let moved_from = (prev.fname != note.fname).then_some(prev.fname);
	changes.push(NoteChangeEntry { status: ChangeStatus::Update, note });
	if let Some(old_fname) = moved_from {
		prune_stub_ancestors(db, ws, &old_fname, &mut changes)?;
	}
	Ok(changes)
}

fn rename_note(db: &sled::Db, ws: &WorkspaceKey, old_fname: &str, new_fname: &str, now: i64) -> Result<Vec<NoteChangeEntry>, EngineError> {
	let prev = store::get_note_by_fname(db, ws, old_fname)?.ok_or_else(|| EngineError::NoteNotFound(old_fname.to_string()))?;
	let new_fname = validate_fname(new_fname)?;
	if let Some(other) = store::get_note_by_fname(db, ws, &new_fname)? {
		if other.id != prev.id { return Err(EngineError::FnameTaken(new_fname)); }
	}
	let mut renamed = prev.clone();
	if prev.title == derive_title(&prev.body, &prev.fname) { renamed.title.clear(); }
	renamed.fname = new_fname;
	fill_derived(&mut renamed, now);
	renamed.stub = prev.stub;
	let mut changes = vec![NoteChangeEntry { status: ChangeStatus::Delete, note: prev }];
	ensure_ancestors(db, ws, &renamed.fname, now, &mut changes)?;
	store::put_note(db, ws, &renamed)?;
	changes.push(NoteChangeEntry { status: ChangeStatus::Create, note: renamed });
	prune_stub_ancestors(db, ws, old_fname, &mut changes)?;
	Ok(changes)
}

/// A note with children is emptied into a stub rather than removed. Removing
/// a leaf also removes the stubs it leaves childless.
fn delete_note(db: &sled::Db, ws: &WorkspaceKey, id: &str, now: i64) -> Result<Vec<NoteChangeEntry>, EngineError> {
	let prev = store::get_note(db, ws, id)?.ok_or_else(|| EngineError::NoteNotFound(id.to_string()))?;
	if prev.fname == ROOT_FNAME {
		return Err(EngineError::InvalidRequest("the root note cannot be deleted".to_string()));
	}
	if store::has_children(db, ws, &prev.fname)? {
		let stub = NoteProps {
			body: String::new(),
			title: fname_leaf(&prev.fname).to_string(),
			content_hash: content_hash(""),
			updated: now,
			stub: true,
			..prev
		};
		store::put_note(db, ws, &stub)?;
		return Ok(vec![NoteChangeEntry { status: ChangeStatus::Update, note: stub }]);
	}
	store::delete_note(db, ws, id)?;
	let fname = prev.fname.clone();
	let mut changes = vec![NoteChangeEntry { status: ChangeStatus::Delete, note: prev }];
	prune_stub_ancestors(db, ws, &fname, &mut changes)?;
	Ok(changes)
}

/// `""` and `*` match everything; a query with `*` is an anchored glob;
/// anything else is a substring. Always case-insensitive.
pub fn query_matcher(qs: &str) -> Result<Option<Regex>, EngineError> {
	let qs = qs.trim();
	if qs.is_empty() || qs == "*" { return Ok(None); }
	let pattern = if qs.contains('*') {
		let parts: Vec<String> = qs.split('*').map(regex::escape).collect();
		format!("(?i)^{}$", parts.join(".*"))
	} else {
		format!("(?i){}", regex::escape(qs))
	};
	Regex::new(&pattern).map(Some).map_err(|e| EngineError::InvalidRequest(e.to_string()))
}

fn query_hit(matcher: &Option<Regex>, text: &str) -> bool {
	matcher.as_ref().map_or(true, |re| re.is_match(text))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
	Json(serde_json::json!({
		"status": "ok",
		"version": env!("CARGO_PKG_VERSION"),
		"uptimeMs": state.start_time.elapsed().as_millis() as u64,
		"nextServerUrl": state.next_server_url,
		"nextStaticRoot": state.next_static_root,
	}))
}

async fn workspace_initialize(State(state): State<Arc<AppState>>, Json(req): Json<WorkspaceInitRequest>) -> ApiResult<WorkspaceData> {
	let root = req.ws.trim();
	if root.is_empty() {
		return Err(EngineError::InvalidRequest("ws is required".to_string()));
	}
	let ws = normalize(root);
	let now = now_ms();
	let _writes = state.note_writes();
	if store::register_workspace(&state.db, &ws, root, now)? {
		info!(workspace = %ws, "workspace registered");
	}
	if let Some(config) = &req.config {
		store::put_config(&state.db, &ws, config)?;
	}
	if store::get_note_by_fname(&state.db, &ws, ROOT_FNAME)?.is_none() {
		let mut root_note = NoteProps { id: Uuid::new_v4().to_string(), created: now, ..NoteProps::new(ROOT_FNAME, "") };
		fill_derived(&mut root_note, now);
		store::put_note(&state.db, &ws, &root_note)?;
	}
	ok(workspace_data(&state.db, &ws)?)
}

async fn workspace_all(State(state): State<Arc<AppState>>) -> ApiResult<WorkspaceList> {
	ok(WorkspaceList { workspaces: store::list_workspaces(&state.db)? })
}

async fn workspace_sync(State(state): State<Arc<AppState>>, Json(req): Json<WorkspaceRequest>) -> ApiResult<WorkspaceData> {
	let ws = initialized(&state.db, &req.ws)?;
	ok(workspace_data(&state.db, &ws)?)
}

async fn config_get(State(state): State<Arc<AppState>>, Query(req): Query<WorkspaceRequest>) -> ApiResult<JsonValue> {
	let ws = initialized(&state.db, &req.ws)?;
	ok(store::get_config(&state.db, &ws)?.unwrap_or_else(|| serde_json::json!({})))
}

async fn config_write(State(state): State<Arc<AppState>>, Json(req): Json<ConfigWriteRequest>) -> ApiResult<JsonValue> {
	let ws = initialized(&state.db, &req.ws)?;
	store::put_config(&state.db, &ws, &req.config)?;
	ok(req.config)
}

async fn note_bulk_add(State(state): State<Arc<AppState>>, Json(req): Json<BulkAddNotesRequest>) -> ApiResult<Vec<NoteChangeEntry>> {
	let ws = initialized(&state.db, &req.ws)?;
	let now = now_ms();
	let _writes = state.note_writes();
	let mut changes = Vec::new();
	for note in req.notes {
		changes.extend(write_note(&state.db, &ws, note, now)?);
	}
	ok(changes)
}

async fn note_delete(State(state): State<Arc<AppState>>, Json(req): Json<DeleteByIdRequest>) -> ApiResult<Vec<NoteChangeEntry>> {
	let ws = initialized(&state.db, &req.ws)?;
	let _writes = state.note_writes();
	ok(delete_note(&state.db, &ws, &req.id, now_ms())?)
}

async fn note_get_by_path(State(state): State<Arc<AppState>>, Json(req): Json<GetNoteByPathRequest>) -> ApiResult<GetNoteByPathResponse> {
	let ws = initialized(&state.db, &req.ws)?;
	let _writes = state.note_writes();
	if let Some(note) = store::get_note_by_fname(&state.db, &ws, req.npath.trim())? {
		return ok(GetNoteByPathResponse { note: Some(note), changed: Vec::new() });
	}
	if !req.create_if_new {
		return Err(EngineError::NoteNotFound(req.npath));
	}
	let changed = write_note(&state.db, &ws, NoteProps::new(req.npath, ""), now_ms())?;
	let note = changed.last().map(|entry| entry.note.clone());
	ok(GetNoteByPathResponse { note, changed })
}

async fn note_info(State(state): State<Arc<AppState>>, Query(req): Query<WorkspaceRequest>) -> ApiResult<EngineInfo> {
	let ws = initialized(&state.db, &req.ws)?;
	ok(EngineInfo {
		version: env!("CARGO_PKG_VERSION").to_string(),
		uptime_ms: state.start_time.elapsed().as_millis() as u64,
		notes: store::count_notes(&state.db, &ws)?,
		schemas: store::count_schemas(&state.db, &ws)?,
		next_server_url: state.next_server_url.clone(),
		next_static_root: state.next_static_root.as_ref().map(|p| p.to_string_lossy().into_owned()),
	})
}

async fn note_rename(State(state): State<Arc<AppState>>, Json(req): Json<RenameNoteRequest>) -> ApiResult<Vec<NoteChangeEntry>> {
	let ws = initialized(&state.db, &req.ws)?;
	let _writes = state.note_writes();
	ok(rename_note(&state.db, &ws, &req.old_loc.fname, &req.new_loc.fname, now_ms())?)
}

async fn note_update(State(state): State<Arc<AppState>>, Json(req): Json<UpdateNoteRequest>) -> ApiResult<Vec<NoteChangeEntry>> {
	let ws = initialized(&state.db, &req.ws)?;
	let _writes = state.note_writes();
	ok(update_note(&state.db, &ws, req.note, now_ms())?)
}

async fn note_write(State(state): State<Arc<AppState>>, Json(req): Json<WriteNoteRequest>) -> ApiResult<Vec<NoteChangeEntry>> {
	let ws = initialized(&state.db, &req.ws)?;
	let _writes = state.note_writes();
	ok(write_note(&state.db, &ws, req.node, now_ms())?)
}

async fn note_query(State(state): State<Arc<AppState>>, Query(req): Query<QueryRequest>) -> ApiResult<Vec<NoteProps>> {
	let ws = initialized(&state.db, &req.ws)?;
	let matcher = query_matcher(&req.qs)?;
	let notes = store::list_notes(&state.db, &ws)?.into_iter().filter(|n| query_hit(&matcher, &n.fname)).collect();
	ok(notes)
}

async fn schema_delete(State(state): State<Arc<AppState>>, Json(req): Json<GetSchemaRequest>) -> ApiResult<JsonValue> {
	let ws = initialized(&state.db, &req.ws)?;
	match store::delete_schema(&state.db, &ws, &req.id)? {
		Some(_) => ok(serde_json::json!({ "id": req.id })),
		None => Err(EngineError::SchemaNotFound(req.id)),
	}
}

async fn schema_get(State(state): State<Arc<AppState>>, Query(req): Query<GetSchemaRequest>) -> ApiResult<SchemaProps> {
	let ws = initialized(&state.db, &req.ws)?;
	match store::get_schema(&state.db, &ws, &req.id)? {
		Some(schema) => ok(schema),
		None => Err(EngineError::SchemaNotFound(req.id)),
	}
}

async fn schema_query(State(state): State<Arc<AppState>>, Query(req): Query<QueryRequest>) -> ApiResult<Vec<SchemaProps>> {
	let ws = initialized(&state.db, &req.ws)?;
	let matcher = query_matcher(&req.qs)?;
	let schemas = store::list_schemas(&state.db, &ws)?
		.into_iter()
		.filter(|s| query_hit(&matcher, &s.fname) || query_hit(&matcher, &s.id))
		.collect();
	ok(schemas)
}

fn checked_schema(mut schema: SchemaProps) -> Result<SchemaProps, EngineError> {
	schema.id = schema.id.trim().to_string();
	if schema.id.is_empty() {
		return Err(EngineError::InvalidRequest("schema id is required".to_string()));
	}
	Ok(schema)
}

async fn schema_write(State(state): State<Arc<AppState>>, Json(req): Json<WriteSchemaRequest>) -> ApiResult<JsonValue> {
	let ws = initialized(&state.db, &req.ws)?;
	let schema = checked_schema(req.schema)?;
	store::put_schema(&state.db, &ws, &schema)?;
	ok(serde_json::to_value(&schema).map_err(anyhow::Error::from)?)
}

async fn schema_update(State(state): State<Arc<AppState>>, Json(req): Json<WriteSchemaRequest>) -> ApiResult<JsonValue> {
	let ws = initialized(&state.db, &req.ws)?;
	let schema = checked_schema(req.schema)?;
	if store::get_schema(&state.db, &ws, &schema.id)?.is_none() {
		return Err(EngineError::SchemaNotFound(schema.id));
	}
	store::put_schema(&state.db, &ws, &schema)?;
	ok(serde_json::to_value(&schema).map_err(anyhow::Error::from)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn make_state() -> Arc<AppState> {
		let db = sled::Config::new().temporary(true).open().unwrap();
		Arc::new(AppState::new(db, Some("http://localhost:3000".to_string()), None))
	}

	async fn init(state: &Arc<AppState>, ws: &str) -> WorkspaceData {
		let req = WorkspaceInitRequest { ws: ws.to_string(), config: None };
		workspace_initialize(State(state.clone()), Json(req)).await.unwrap().0.data.unwrap()
	}

	async fn write(state: &Arc<AppState>, ws: &str, fname: &str, body: &str) -> Vec<NoteChangeEntry> {
		let req = WriteNoteRequest { ws: ws.to_string(), node: NoteProps::new(fname, body) };
		note_write(State(state.clone()), Json(req)).await.unwrap().0.data.unwrap()
	}

	async fn query(state: &Arc<AppState>, qs: &str) -> Vec<String> {
		let req = QueryRequest { ws: "/kb".to_string(), qs: qs.to_string() };
		let notes = note_query(State(state.clone()), Query(req)).await.unwrap().0.data.unwrap();
		notes.into_iter().map(|n| n.fname).collect()
	}

	#[tokio::test]
	async fn test_uninitialized_workspace_is_rejected() {
		let state = make_state();
		let req = QueryRequest { ws: "/nowhere".to_string(), qs: String::new() };
		let err = note_query(State(state.clone()), Query(req)).await.unwrap_err();
		assert!(matches!(err, EngineError::WorkspaceNotInitialized(_)));
		assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn test_initialize_creates_root_once() {
		let state = make_state();
		let data = init(&state, "/Work/KB/").await;
		assert_eq!(data.notes.len(), 1);
		assert_eq!(data.notes[0].fname, ROOT_FNAME);
		let again = init(&state, "/work/kb").await;
		assert_eq!(again.notes, data.notes);
		let list = workspace_all(State(state.clone())).await.unwrap().0.data.unwrap();
		assert_eq!(list.workspaces, vec!["/Work/KB/".to_string()]);
	}

	#[tokio::test]
	async fn test_write_fills_derived_fields_and_stubs() {
		let state = make_state();
		init(&state, "/kb").await;
		let body = "intro\n\n# Alpha Tasks\n\n- [ ] ship";
		let changes = write(&state, "/kb", "projects.alpha.tasks", body).await;
		assert_eq!(changes.len(), 3);
		assert!(changes.iter().all(|c| c.status == ChangeStatus::Create));
		assert_eq!(changes[0].note.fname, "projects");
		assert!(changes[0].note.stub);
		assert_eq!(changes[1].note.title, "alpha");
		let note = &changes[2].note;
		assert_eq!(note.title, "Alpha Tasks");
		assert_eq!(note.content_hash, content_hash(body));
		assert!(!note.id.is_empty());
		assert!(note.created > 0 && note.updated >= note.created);
		assert!(!note.stub);
	}

	#[tokio::test]
	async fn test_write_existing_fname_updates_in_place() {
		let state = make_state();
		init(&state, "/kb").await;
		let first = write(&state, "/kb", "daily", "v1").await.pop().unwrap().note;
		let second = write(&state, "/kb", "Daily", "v2").await.pop().unwrap();
		assert_eq!(second.status, ChangeStatus::Update);
		assert_eq!(second.note.id, first.id);
		assert_eq!(second.note.created, first.created);
		assert_eq!(second.note.body, "v2");
	}

	#[tokio::test]
	async fn test_writing_over_a_stub_clears_it() {
		let state = make_state();
		init(&state, "/kb").await;
		write(&state, "/kb", "a.b", "child").await;
		let parent = write(&state, "/kb", "a", "# A").await;
		assert_eq!(parent.len(), 1);
		assert_eq!(parent[0].status, ChangeStatus::Update);
		assert!(!parent[0].note.stub);
	}

	#[tokio::test]
	async fn test_get_by_path_missing_is_404_unless_created() {
		let state = make_state();
		init(&state, "/kb").await;
		let req = GetNoteByPathRequest { ws: "/kb".to_string(), npath: "inbox".to_string(), create_if_new: false };
		let err = note_get_by_path(State(state.clone()), Json(req.clone())).await.unwrap_err();
		assert!(matches!(err, EngineError::NoteNotFound(_)));
		assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

		let created = note_get_by_path(State(state.clone()), Json(GetNoteByPathRequest { create_if_new: true, ..req.clone() }))
			.await.unwrap().0.data.unwrap();
		assert_eq!(created.note.as_ref().map(|n| n.fname.as_str()), Some("inbox"));
		assert_eq!(created.changed.len(), 1);

		let found = note_get_by_path(State(state.clone()), Json(req)).await.unwrap().0.data.unwrap();
		assert_eq!(found.note, created.note);
		assert!(found.changed.is_empty());
	}

	#[tokio::test]
	async fn test_rename_checks_both_ends() {
		let state = make_state();
		init(&state, "/kb").await;
		write(&state, "/kb", "draft", "plain body").await;
		write(&state, "/kb", "taken", "").await;
		let rename = |old: &str, new: &str| RenameNoteRequest {
			ws: "/kb".to_string(),
			old_loc: NoteLoc { fname: old.to_string() },
			new_loc: NoteLoc { fname: new.to_string() },
		};
		let missing = note_rename(State(state.clone()), Json(rename("ghost", "x"))).await.unwrap_err();
		assert_eq!(missing.status(), StatusCode::NOT_FOUND);
		let clash = note_rename(State(state.clone()), Json(rename("draft", "taken"))).await.unwrap_err();
		assert_eq!(clash.status(), StatusCode::BAD_REQUEST);

		let changes = note_rename(State(state.clone()), Json(rename("draft", "archive.final"))).await.unwrap().0.data.unwrap();
		let statuses: Vec<ChangeStatus> = changes.iter().map(|c| c.status).collect();
		assert_eq!(statuses, vec![ChangeStatus::Delete, ChangeStatus::Create, ChangeStatus::Create]);
		let renamed = &changes[2].note;
		assert_eq!(renamed.id, changes[0].note.id);
		assert_eq!(renamed.title, "final");
		assert_eq!(query(&state, "draft").await, Vec::<String>::new());
	}

	#[tokio::test]
	async fn test_update_requires_existing_id() {
		let state = make_state();
		init(&state, "/kb").await;
		let mut note = write(&state, "/kb", "todo", "one").await.pop().unwrap().note;
		note.body = "# Todo List".to_string();
		note.title.clear();
		let req = UpdateNoteRequest { ws: "/kb".to_string(), note: note.clone() };
		let updated = note_update(State(state.clone()), Json(req)).await.unwrap().0.data.unwrap();
		assert_eq!(updated[0].note.title, "Todo List");
		let ghost = UpdateNoteRequest { ws: "/kb".to_string(), note: NoteProps { id: "ghost".to_string(), ..note } };
		let err = note_update(State(state.clone()), Json(ghost)).await.unwrap_err();
		assert_eq!(err.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_delete_parent_becomes_stub_then_leaf_prunes_it() {
		let state = make_state();
		init(&state, "/kb").await;
		let parent = write(&state, "/kb", "proj", "# Proj").await.pop().unwrap().note;
		let child = write(&state, "/kb", "proj.a", "x").await.pop().unwrap().note;
		let del = |id: &str| DeleteByIdRequest { ws: "/kb".to_string(), id: id.to_string() };

		let stubbed = note_delete(State(state.clone()), Json(del(&parent.id))).await.unwrap().0.data.unwrap();
		assert_eq!(stubbed[0].status, ChangeStatus::Update);
		assert!(stubbed[0].note.stub);
		assert!(stubbed[0].note.body.is_empty());

		let removed = note_delete(State(state.clone()), Json(del(&child.id))).await.unwrap().0.data.unwrap();
		let gone: Vec<(ChangeStatus, &str)> = removed.iter().map(|c| (c.status, c.note.fname.as_str())).collect();
		assert_eq!(gone, vec![(ChangeStatus::Delete, "proj.a"), (ChangeStatus::Delete, "proj")]);
		assert_eq!(query(&state, "proj").await, Vec::<String>::new());
		let again = note_delete(State(state.clone()), Json(del(&child.id))).await.unwrap_err();
		assert_eq!(again.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_delete_prunes_only_childless_stubs() {
		let state = make_state();
		init(&state, "/kb").await;
		let deep = write(&state, "/kb", "a.b.c", "deep").await.pop().unwrap().note;
		write(&state, "/kb", "a.x", "sibling").await;
		let removed = note_delete(State(state.clone()), Json(DeleteByIdRequest { ws: "/kb".to_string(), id: deep.id })).await.unwrap().0.data.unwrap();
		let gone: Vec<&str> = removed.iter().map(|c| c.note.fname.as_str()).collect();
		assert_eq!(gone, vec!["a.b.c", "a.b"]);
		assert_eq!(query(&state, "*").await, vec!["a", "a.x", "root"]);
	}

	#[tokio::test]
	async fn test_rename_out_of_a_stub_tree_prunes_it() {
		let state = make_state();
		init(&state, "/kb").await;
		write(&state, "/kb", "inbox.idea", "spark").await;
		let rename = RenameNoteRequest {
			ws: "/kb".to_string(),
			old_loc: NoteLoc { fname: "inbox.idea".to_string() },
			new_loc: NoteLoc { fname: "idea".to_string() },
		};
		let changes = note_rename(State(state.clone()), Json(rename)).await.unwrap().0.data.unwrap();
		let last = changes.last().unwrap();
		assert_eq!((last.status, last.note.fname.as_str()), (ChangeStatus::Delete, "inbox"));
		assert_eq!(query(&state, "*").await, vec!["idea", "root"]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_writes_keep_one_note_per_fname() {
		let state = make_state();
		init(&state, "/kb").await;
		let mut tasks = Vec::new();
		for round in 0..8 {
			for i in 0..10 {
				let state = state.clone();
				let fname = format!("race.n{}.leaf", i);
				tasks.push(tokio::spawn(async move {
					let req = WriteNoteRequest { ws: "/kb".to_string(), node: NoteProps::new(fname, format!("round {}", round)) };
					note_write(State(state), Json(req)).await.map(|_| ())
				}));
			}
		}
		for task in tasks {
			task.await.unwrap().unwrap();
		}
		let notes = store::list_notes(&state.db, &normalize("/kb")).unwrap();
		let mut fnames: Vec<&str> = notes.iter().map(|n| n.fname.as_str()).collect();
		let total = fnames.len();
		fnames.dedup();
		assert_eq!(fnames.len(), total);
		// root, race, 10 mids, 10 leaves
		assert_eq!(total, 22);
	}

	#[tokio::test]
	async fn test_query_matching_modes() {
		let state = make_state();
		init(&state, "/kb").await;
		for fname in ["daily.2024.01", "daily.2024.02", "Weekly.Review"] {
			write(&state, "/kb", fname, "").await;
		}
		// root, the three notes, and stubs for daily, daily.2024 and Weekly
		assert_eq!(query(&state, "").await.len(), 7);
		assert_eq!(query(&state, "*").await.len(), 7);
		assert_eq!(query(&state, "daily.*.01").await, vec!["daily.2024.01"]);
		assert_eq!(query(&state, "DAILY.2024").await, vec!["daily.2024", "daily.2024.01", "daily.2024.02"]);
		assert_eq!(query(&state, "review").await, vec!["Weekly.Review"]);
		assert!(query(&state, "weekly*x").await.is_empty());
		assert_eq!(query(&state, "(").await, Vec::<String>::new());
	}

	#[tokio::test]
	async fn test_schema_lifecycle() {
		let state = make_state();
		init(&state, "/kb").await;
		let schema = SchemaProps { id: "daily".to_string(), fname: "daily.schema".to_string(), data: serde_json::json!({"pattern": "daily.*"}) };
		let write_req = WriteSchemaRequest { ws: "/kb".to_string(), schema: schema.clone() };
		let missing = schema_update(State(state.clone()), Json(write_req.clone())).await.unwrap_err();
		assert_eq!(missing.status(), StatusCode::NOT_FOUND);
		schema_write(State(state.clone()), Json(write_req.clone())).await.unwrap();
		let get_req = GetSchemaRequest { ws: "/kb".to_string(), id: "daily".to_string() };
		let got = schema_get(State(state.clone()), Query(get_req.clone())).await.unwrap().0.data.unwrap();
		assert_eq!(got, schema);
		let found = schema_query(State(state.clone()), Query(QueryRequest { ws: "/kb".to_string(), qs: "daily".to_string() })).await.unwrap().0.data.unwrap();
		assert_eq!(found.len(), 1);
		schema_delete(State(state.clone()), Json(get_req.clone())).await.unwrap();
		assert_eq!(schema_get(State(state.clone()), Query(get_req)).await.unwrap_err().status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_health_reports_companion_hints() {
		let state = make_state();
		let Json(health) = health(State(state)).await;
		assert_eq!(health["status"], "ok");
		assert_eq!(health["nextServerUrl"], "http://localhost:3000");
		assert!(health["nextStaticRoot"].is_null());
	}

	#[tokio::test]
	async fn test_router_serves_health_api_and_static_fallback() {
		use axum::body::Body;
		use axum::http::Request;
		use tower::ServiceExt;

		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("index.html"), "<h1>notes</h1>").unwrap();
		let db = sled::Config::new().temporary(true).open().unwrap();
		let state = Arc::new(AppState::new(db, None, Some(dir.path().to_path_buf())));
		let app = build_router(state);

		let resp = app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let resp = app.clone().oneshot(Request::get("/index.html").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let resp = app.oneshot(Request::get("/api/note/info?ws=%2Fkb").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn test_derive_title_prefers_first_heading() {
		assert_eq!(derive_title("## Sub `code`\n# Main", "a.b"), "Sub code");
		assert_eq!(derive_title("no headings here", "a.b.leaf"), "leaf");
		assert_eq!(derive_title("", "root"), "root");
	}

	#[test]
	fn test_ancestors_of_dotted_fname() {
		assert_eq!(ancestors("a.b.c").collect::<Vec<_>>(), vec!["a", "a.b"]);
		assert_eq!(ancestors("solo").count(), 0);
	}

	#[tokio::test]
	async fn test_end_to_end_through_rpc_client() {
		let dir = tempfile::tempdir().unwrap();
		let config = EngineConfig {
			log_path: dir.path().join("engine.log"),
			port: None,
			next_server_url: None,
			next_static_root: None,
			data_dir: dir.path().join("data"),
		};
		let engine = start(&config).await.unwrap();
		let client = engine.client();

		let data = client.workspace_init(&WorkspaceInitRequest { ws: "/kb".to_string(), config: Some(serde_json::json!({"vaults": []})) }).await;
		assert_eq!(data.into_result().unwrap().unwrap().notes.len(), 1);

		let written = client.engine_write(&WriteNoteRequest { ws: "/kb".to_string(), node: NoteProps::new("inbox", "# Inbox") }).await;
		assert!(written.is_ok());

		let missing = client.note_get_by_path(&GetNoteByPathRequest { ws: "/kb".to_string(), npath: "nope".to_string(), create_if_new: false }).await;
		let err = missing.error.unwrap();
		assert_eq!(err.kind, ErrorKind::DoesNotExist);
		assert_eq!(err.code, Some(404));

		let uninit = client.note_query(&QueryRequest { ws: "/other".to_string(), qs: String::new() }).await;
		assert_eq!(uninit.error.map(|e| (e.kind, e.code)), Some((ErrorKind::UnknownError, Some(400))));

		let info = client.note_info(&WorkspaceRequest { ws: "/kb".to_string() }).await.into_result().unwrap().unwrap();
		assert_eq!(info.notes, 2);
		assert_eq!(info.version, env!("CARGO_PKG_VERSION"));

		let config = client.config_get(&WorkspaceRequest { ws: "/KB/".to_string() }).await;
		assert_eq!(config.data, Some(serde_json::json!({"vaults": []})));

		engine.stop().await.unwrap();
	}
}
