//! Wire types shared by the engine service and the RPC client.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Fixed operation paths, relative to the API prefix.
pub mod paths {
    pub const CONFIG_GET: &str = "config/get";
    pub const CONFIG_WRITE: &str = "config/write";
    pub const WORKSPACE_INITIALIZE: &str = "workspace/initialize";
    pub const WORKSPACE_ALL: &str = "workspace/all";
    pub const WORKSPACE_SYNC: &str = "workspace/sync";
    pub const NOTE_BULK_ADD: &str = "note/bulkAdd";
    pub const NOTE_DELETE: &str = "note/delete";
    pub const NOTE_GET_BY_PATH: &str = "note/getByPath";
    pub const NOTE_INFO: &str = "note/info";
    pub const NOTE_RENAME: &str = "note/rename";
    pub const NOTE_UPDATE: &str = "note/update";
    pub const NOTE_WRITE: &str = "note/write";
    pub const NOTE_QUERY: &str = "note/query";
    pub const SCHEMA_DELETE: &str = "schema/delete";
    pub const SCHEMA_GET: &str = "schema/get";
    pub const SCHEMA_QUERY: &str = "schema/query";
    pub const SCHEMA_WRITE: &str = "schema/write";
    pub const SCHEMA_UPDATE: &str = "schema/update";
}

pub const DEFAULT_API_PREFIX: &str = "api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotAuthorized,
    DoesNotExist,
    UpstreamUnavailable,
    UnknownError,
    /// The request never got a response.
    Transport,
    /// A success status with a body that does not decode.
    MalformedResponse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), code: None }
    }

    pub fn with_code(mut self, code: u16) -> Self { self.code = Some(code); self }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// `{data, error}` result of every remote call.
///
/// A populated `error` wins: some engines still send a default `data` shape
/// alongside an error, so read `error` first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiPayload<T> {
    pub data: Option<T>,
    pub error: Option<ErrorValue>,
}

impl<T> ApiPayload<T> {
    pub fn success(data: T) -> Self { Self { data: Some(data), error: None } }

    pub fn failure(error: ErrorValue) -> Self { Self { data: None, error: Some(error) } }

    pub fn is_ok(&self) -> bool { self.error.is_none() }

    pub fn into_result(self) -> Result<Option<T>, ErrorValue> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

fn default_json_object() -> JsonValue { JsonValue::Object(Default::default()) }

/// A note as stored by the engine. Missing fields are filled in on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NoteProps {
    #[serde(default)]
    pub id: String,
    pub fname: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    /// Placeholder created for a missing ancestor in a dotted hierarchy.
    #[serde(default)]
    pub stub: bool,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default = "default_json_object")]
    pub custom: JsonValue,
}

impl NoteProps {
    pub fn new(fname: impl Into<String>, body: impl Into<String>) -> Self {
        Self { fname: fname.into(), body: body.into(), custom: default_json_object(), ..Self::default() }
    }
}

/// A schema module: an id, the fname it governs, and its opaque definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaProps {
    pub id: String,
    pub fname: String,
    #[serde(default = "default_json_object")]
    pub data: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteChangeEntry {
    pub status: ChangeStatus,
    pub note: NoteProps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteLoc {
    pub fname: String,
}

// Requests. GET requests stay flat so they encode as a query string.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRequest {
    pub ws: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkspaceListRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigWriteRequest {
    pub ws: String,
    pub config: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInitRequest {
    pub ws: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkAddNotesRequest {
    pub ws: String,
    pub notes: Vec<NoteProps>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteByIdRequest {
    pub ws: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetNoteByPathRequest {
    pub ws: String,
    pub npath: String,
    #[serde(default)]
    pub create_if_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameNoteRequest {
    pub ws: String,
    pub old_loc: NoteLoc,
    pub new_loc: NoteLoc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNoteRequest {
    pub ws: String,
    pub note: NoteProps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteNoteRequest {
    pub ws: String,
    pub node: NoteProps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub ws: String,
    #[serde(default)]
    pub qs: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSchemaRequest {
    pub ws: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSchemaRequest {
    pub ws: String,
    pub schema: SchemaProps,
}

// Responses.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkspaceData {
    pub notes: Vec<NoteProps>,
    pub schemas: Vec<SchemaProps>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceList {
    pub workspaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetNoteByPathResponse {
    pub note: Option<NoteProps>,
    pub changed: Vec<NoteChangeEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInfo {
    pub version: String,
    pub uptime_ms: u64,
    pub notes: u64,
    pub schemas: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_static_root: Option<String>,
}
