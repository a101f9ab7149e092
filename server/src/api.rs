//! Typed bindings for every engine operation. Each one is a thin call through
//! [`RpcClient::call`] with a fixed path, method and payload shape.

use serde_json::Value as JsonValue;

use crate::protocol::*;
use crate::rpc::{Method, RpcClient};

impl RpcClient {
    pub async fn config_get(&self, req: &WorkspaceRequest) -> ApiPayload<JsonValue> {
        self.call(Method::Get, paths::CONFIG_GET, req).await
    }

    pub async fn config_write(&self, req: &ConfigWriteRequest) -> ApiPayload<JsonValue> {
        self.call(Method::Post, paths::CONFIG_WRITE, req).await
    }

    pub async fn workspace_init(&self, req: &WorkspaceInitRequest) -> ApiPayload<WorkspaceData> {
        self.call(Method::Post, paths::WORKSPACE_INITIALIZE, req).await
    }

    pub async fn workspace_list(&self, req: &WorkspaceListRequest) -> ApiPayload<WorkspaceList> {
        self.call(Method::Get, paths::WORKSPACE_ALL, req).await
    }

    pub async fn workspace_sync(&self, req: &WorkspaceRequest) -> ApiPayload<WorkspaceData> {
        self.call(Method::Post, paths::WORKSPACE_SYNC, req).await
    }

    pub async fn note_bulk_add(&self, req: &BulkAddNotesRequest) -> ApiPayload<Vec<NoteChangeEntry>> {
        self.call(Method::Post, paths::NOTE_BULK_ADD, req).await
    }

    pub async fn note_delete(&self, req: &DeleteByIdRequest) -> ApiPayload<Vec<NoteChangeEntry>> {
        self.call(Method::Post, paths::NOTE_DELETE, req).await
    }

    pub async fn note_get_by_path(&self, req: &GetNoteByPathRequest) -> ApiPayload<GetNoteByPathResponse> {
        self.call(Method::Post, paths::NOTE_GET_BY_PATH, req).await
    }

    pub async fn note_info(&self, req: &WorkspaceRequest) -> ApiPayload<EngineInfo> {
        self.call(Method::Get, paths::NOTE_INFO, req).await
    }

    pub async fn note_rename(&self, req: &RenameNoteRequest) -> ApiPayload<Vec<NoteChangeEntry>> {
        self.call(Method::Post, paths::NOTE_RENAME, req).await
    }

    pub async fn note_update(&self, req: &UpdateNoteRequest) -> ApiPayload<Vec<NoteChangeEntry>> {
        self.call(Method::Post, paths::NOTE_UPDATE, req).await
    }

    /// Create or overwrite a note by fname (`note/write`).
    pub async fn engine_write(&self, req: &WriteNoteRequest) -> ApiPayload<Vec<NoteChangeEntry>> {
        self.call(Method::Post, paths::NOTE_WRITE, req).await
    }

    pub async fn note_query(&self, req: &QueryRequest) -> ApiPayload<Vec<NoteProps>> {
        self.call(Method::Get, paths::NOTE_QUERY, req).await
    }

    pub async fn schema_delete(&self, req: &GetSchemaRequest) -> ApiPayload<JsonValue> {
        self.call(Method::Post, paths::SCHEMA_DELETE, req).await
    }

    pub async fn schema_get(&self, req: &GetSchemaRequest) -> ApiPayload<SchemaProps> {
        self.call(Method::Get, paths::SCHEMA_GET, req).await
    }

    pub async fn schema_query(&self, req: &QueryRequest) -> ApiPayload<Vec<SchemaProps>> {
        self.call(Method::Get, paths::SCHEMA_QUERY, req).await
    }

    pub async fn schema_write(&self, req: &WriteSchemaRequest) -> ApiPayload<JsonValue> {
        self.call(Method::Post, paths::SCHEMA_WRITE, req).await
    }

    pub async fn schema_update(&self, req: &WriteSchemaRequest) -> ApiPayload<JsonValue> {
        self.call(Method::Post, paths::SCHEMA_UPDATE, req).await
    }
}
