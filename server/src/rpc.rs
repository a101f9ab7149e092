//! Generic typed caller for the engine's HTTP API.
//!
//! Every call resolves to an [`ApiPayload`]: transport failures, non-2xx
//! statuses and undecodable bodies all land in `error`, nothing is returned as
//! `Err` or panics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info};

use crate::protocol::{ApiPayload, ErrorKind, ErrorValue, DEFAULT_API_PREFIX};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Supplies a bearer token, if any, for the next request.
pub trait AuthHook: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Builds the headers for one request. Runs before every call.
pub trait HeaderBuilder: Send + Sync {
    fn build(&self) -> Result<HeaderMap, String>;
}

impl<F> HeaderBuilder for F
where
    F: Fn() -> Result<HeaderMap, String> + Send + Sync,
{
    fn build(&self) -> Result<HeaderMap, String> { self() }
}

/// JSON content headers plus `Authorization: Bearer …` when the hook has a token.
#[derive(Clone, Default)]
pub struct DefaultHeaders {
    auth: Option<Arc<dyn AuthHook>>,
}

impl DefaultHeaders {
    pub fn with_auth(auth: Arc<dyn AuthHook>) -> Self { Self { auth: Some(auth) } }
}

impl HeaderBuilder for DefaultHeaders {
    fn build(&self) -> Result<HeaderMap, String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = self.auth.as_ref().and_then(|hook| hook.token()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| format!("invalid auth token: {}", e))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

/// Observes outgoing requests and captured errors. Never affects control flow.
pub trait RpcLogger: Send + Sync {
    fn request(&self, path: &str, params: &JsonValue);
    fn failure(&self, path: &str, error: &ErrorValue);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRpcLogger;

impl RpcLogger for NoopRpcLogger {
    fn request(&self, _path: &str, _params: &JsonValue) {}
    fn failure(&self, _path: &str, _error: &ErrorValue) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRpcLogger;

impl RpcLogger for TracingRpcLogger {
    fn request(&self, path: &str, params: &JsonValue) {
        info!(path, %params, "engine request");
    }

    fn failure(&self, path: &str, error: &ErrorValue) {
        error!(path, kind = %error.kind, code = ?error.code, message = %error.message, "engine request failed");
    }
}

pub fn default_status_errors() -> HashMap<u16, ErrorKind> {
    HashMap::from([
        (401, ErrorKind::NotAuthorized),
        (404, ErrorKind::DoesNotExist),
        (502, ErrorKind::UpstreamUnavailable),
    ])
}

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    api_prefix: String,
    headers: Arc<dyn HeaderBuilder>,
    status_errors: Arc<HashMap<u16, ErrorKind>>,
    logger: Arc<dyn RpcLogger>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("api_prefix", &self.api_prefix)
            .field("status_errors", &self.status_errors)
            .finish()
    }
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: build_http(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            headers: Arc::new(DefaultHeaders::default()),
            status_errors: Arc::new(default_status_errors()),
            logger: Arc::new(NoopRpcLogger),
        }
    }

    /// Client for an engine listening on the loopback interface.
    pub fn for_port(port: u16) -> Self { Self::new(format!("http://127.0.0.1:{}", port)) }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    pub fn with_header_builder(mut self, headers: Arc<dyn HeaderBuilder>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn RpcLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_status_error(mut self, status: u16, kind: ErrorKind) -> Self {
        Arc::make_mut(&mut self.status_errors).insert(status, kind);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = build_http(timeout);
        self
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.api_prefix.is_empty() {
            format!("{}/{}", self.endpoint, path)
        } else {
            format!("{}/{}/{}", self.endpoint, self.api_prefix, path)
        }
    }

    /// Issue one call. GET requests go out as a query string, POST as a JSON body.
    pub async fn call<Req, Resp>(&self, method: Method, path: &str, req: &Req) -> ApiPayload<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.logger.request(path, &serde_json::to_value(req).unwrap_or(JsonValue::Null));
        let payload = self.execute(method, path, req).await;
        if let Some(error) = &payload.error {
            self.logger.failure(path, error);
        }
        payload
    }

    async fn execute<Req, Resp>(&self, method: Method, path: &str, req: &Req) -> ApiPayload<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let headers = match self.headers.build() {
            Ok(headers) => headers,
            Err(message) => return ApiPayload::failure(ErrorValue::new(ErrorKind::UnknownError, format!("failed to build request headers: {}", message))),
        };
        let url = self.url(path);
        let builder = match method {
            Method::Get => self.http.get(&url).query(req),
            Method::Post => self.http.post(&url).json(req),
        };
        let resp = match builder.headers(headers).send().await {
            Ok(resp) => resp,
            Err(e) => return ApiPayload::failure(transport_error(&e)),
        };
        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => return ApiPayload::failure(transport_error(&e).with_code(status.as_u16())),
        };
        if status.is_success() {
            match serde_json::from_str::<ApiPayload<Resp>>(&text) {
                Ok(payload) => payload,
                Err(e) => ApiPayload::failure(
                    ErrorValue::new(ErrorKind::MalformedResponse, format!("undecodable response body: {}", e)).with_code(status.as_u16()),
                ),
            }
        } else {
            ApiPayload::failure(self.status_error(status, &text))
        }
    }

    fn status_error(&self, status: StatusCode, body: &str) -> ErrorValue {
        let kind = self.status_errors.get(&status.as_u16()).copied().unwrap_or(ErrorKind::UnknownError);
        let message = serde_json::from_str::<ApiPayload<JsonValue>>(body)
            .ok()
            .and_then(|p| p.error)
            .map(|e| e.message)
            .unwrap_or_else(|| match status.canonical_reason() {
                Some(reason) => format!("HTTP {}: {}", status.as_u16(), reason),
                None => format!("HTTP {}", status.as_u16()),
            });
        ErrorValue::new(kind, message).with_code(status.as_u16())
    }
}

fn build_http(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder().timeout(timeout).build().unwrap_or_else(|_| reqwest::Client::new())
}

fn transport_error(e: &reqwest::Error) -> ErrorValue {
    let message = if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    };
    ErrorValue::new(ErrorKind::Transport, message)
}
