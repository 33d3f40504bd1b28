//! Authenticated request pipeline.
//!
//! [`ApiClient`] attaches the current credential, unwraps the service's
//! `{data, error}` envelope, retries idempotent reads, and refreshes an
//! expired credential at most once per request chain. Concurrent 401s share
//! a single refresh.

use crate::auth::{Credential, CredentialStore, SessionSignal};
use crate::error::{self, codes, ApiError, ClientError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
pub const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
        }
    }

    /// Only idempotent reads are retried automatically.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
        }
    }
}

/// A single wire attempt, as handed to an [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub authorization: Option<String>,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.into().into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

/// Raw HTTP exchange. Connection failures surface as `NETWORK_ERROR`.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

pub struct ReqwestBackend {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ApiError::network)?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.into(), url)
            .header(CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, &request.request_id);
        if let Some(authorization) = &request.authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(ApiError::network)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(ApiError::network)?.to_vec();
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound for one wire attempt.
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_base: Duration::from_millis(250),
            retry_max: Duration::from_secs(4),
        }
    }
}

impl TransportOptions {
    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub use_auth: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            use_auth: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.use_auth = false;
        self
    }
}

/// Successful envelope contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub data: Value,
    pub meta: Option<Value>,
}

/// Token pair returned by `/auth/login` and `/auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
}

impl TokenPair {
    /// Keeps `previous_refresh` when the server does not rotate the refresh token.
    pub fn into_credential(self, previous_refresh: Option<String>) -> Credential {
        let mut credential = Credential::new(self.access_token);
        credential.refresh_token = self.refresh_token.or(previous_refresh);
        if let Some(seconds) = self.expires_in {
            credential = credential.expiring_in(seconds);
        }
        credential
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshBody {
    Wrapped { tokens: TokenPair },
    Bare(TokenPair),
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<dyn CredentialStore>,
    session: SessionSignal,
    options: TransportOptions,
    // Held for the whole refresh exchange so concurrent 401s queue behind
    // the first one and observe its outcome.
    refresh_gate: Mutex<()>,
}

impl ApiClient {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<dyn CredentialStore>,
        options: TransportOptions,
    ) -> Self {
        Self::with_session(backend, credentials, options, SessionSignal::new())
    }

    pub fn with_session(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<dyn CredentialStore>,
        options: TransportOptions,
        session: SessionSignal,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                backend,
                credentials,
                session,
                options,
                refresh_gate: Mutex::new(()),
            }),
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.credentials
    }

    pub fn session(&self) -> &SessionSignal {
        &self.inner.session
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    pub async fn request<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        let value = self.request_value(request).await?;
        Ok(error::decode(value)?)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: impl Into<String>) -> Result<T, ClientError> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: impl Into<String>,
        body: Value,
    ) -> Result<T, ClientError> {
        self.request(ApiRequest::post(path, body)).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        path: impl Into<String>,
        body: Value,
    ) -> Result<T, ClientError> {
        self.request(ApiRequest::patch(path, body)).await
    }

    pub async fn request_value(&self, request: ApiRequest) -> Result<Value, ApiError> {
        self.request_payload(request).await.map(|payload| payload.data)
    }

    /// Full pipeline: send (with retries for reads), and on `UNAUTHORIZED`
    /// refresh once and replay once.
    pub async fn request_payload(&self, request: ApiRequest) -> Result<Payload, ApiError> {
        let credential = if request.use_auth {
            self.inner.credentials.get()
        } else {
            None
        };

        let rejected = match self.send_with_retry(&request, credential.as_ref()).await {
            Err(err) if request.use_auth && err.unauthorized() => err,
            other => return other,
        };

        debug!(path = %request.path, "request unauthorized, refreshing credential");
        let fresh = match self.refresh(credential.as_ref()).await {
            Ok(fresh) => fresh,
            Err(refresh_err) => {
                debug!(error = %refresh_err, "refresh failed");
                return Err(rejected);
            }
        };

        match self.send_with_retry(&request, Some(&fresh)).await {
            Err(err) if err.unauthorized() => {
                self.invalidate_session("request rejected after credential refresh");
                Err(err)
            }
            other => other,
        }
    }

    /// Exchanges the current credential for a new one.
    ///
    /// `stale` is the credential the caller's request was rejected with. If
    /// the store no longer holds it, another request already finished a
    /// refresh and its outcome is returned without a new exchange.
    pub async fn refresh(&self, stale: Option<&Credential>) -> Result<Credential, ApiError> {
        let _gate = self.inner.refresh_gate.lock().await;

        let current = self.inner.credentials.get();
        let stale_token = stale.map(|c| c.access_token.as_str());
        if current.as_ref().map(|c| c.access_token.as_str()) != stale_token {
            return current.ok_or_else(|| {
                ApiError::new(codes::UNAUTHORIZED, 401, "session was invalidated")
            });
        }

        match self.exchange_refresh(current.as_ref()).await {
            Ok(fresh) => {
                self.inner.credentials.set(fresh.clone());
                info!("credential refreshed");
                Ok(fresh)
            }
            Err(err) => {
                self.invalidate_session(format!("credential refresh failed: {err}"));
                Err(err)
            }
        }
    }

    async fn exchange_refresh(&self, current: Option<&Credential>) -> Result<Credential, ApiError> {
        let previous_refresh = current.and_then(|c| c.refresh_token.clone());
        let mut request = ApiRequest::new(Method::Post, REFRESH_PATH).without_auth();
        if let Some(token) = &previous_refresh {
            request = request.with_body(json!({ "refresh_token": token }));
        }
        let payload = self.send_once(&request, None).await?;
        let body: RefreshBody = serde_json::from_value(payload.data).map_err(|err| {
            ApiError::new("INVALID_REFRESH", 200, format!("unexpected refresh response: {err}"))
        })?;
        let pair = match body {
            RefreshBody::Wrapped { tokens } => tokens,
            RefreshBody::Bare(pair) => pair,
        };
        Ok(pair.into_credential(previous_refresh))
    }

    fn invalidate_session(&self, reason: impl Into<String>) {
        self.inner.credentials.clear();
        self.inner.session.invalidate(reason);
    }

    async fn send_with_retry(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<Payload, ApiError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(request, credential).await {
                Err(err)
                    if request.method.is_idempotent()
                        && err.is_retriable()
                        && attempt < self.inner.options.max_retries =>
                {
                    let delay = self.inner.options.backoff(attempt);
                    warn!(
                        method = %request.method,
                        path = %request.path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<Payload, ApiError> {
        let wire = HttpRequest {
            method: request.method,
            path: request.path.clone(),
            body: request.body.clone(),
            authorization: credential.map(Credential::authorization_header),
            request_id: Uuid::new_v4().to_string(),
        };
        debug!(
            method = %wire.method,
            path = %wire.path,
            request_id = %wire.request_id,
            "sending request"
        );
        let timeout = self.inner.options.timeout;
        let response = match tokio::time::timeout(timeout, self.inner.backend.send(wire)).await {
            Ok(result) => result?,
            Err(_) => return Err(ApiError::timeout(timeout)),
        };
        unwrap_envelope(response)
    }
}

/// Unwraps `{data, error, meta}`; bodies without an envelope pass through.
pub fn unwrap_envelope(response: HttpResponse) -> Result<Payload, ApiError> {
    let status = response.status;
    let json: Option<Value> = if response.is_json() {
        serde_json::from_slice(&response.body).ok()
    } else {
        None
    };

    if !response.is_success() {
        let Some(body) = json else {
            return Err(ApiError::new(codes::UNKNOWN, status, format!("HTTP {status}")));
        };
        let code = body
            .pointer("/error/code")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| code_for_status(status).to_string());
        let message = body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(ApiError::new(code, status, message));
    }

    match json {
        Some(Value::Object(mut map)) if map.contains_key("data") || map.contains_key("error") => {
            Ok(Payload {
                data: map.remove("data").unwrap_or(Value::Null),
                meta: map.remove("meta").filter(|meta| !meta.is_null()),
            })
        }
        Some(raw) => Ok(Payload {
            data: raw,
            meta: None,
        }),
        None if response.body.is_empty() => Ok(Payload {
            data: Value::Null,
            meta: None,
        }),
        None => Ok(Payload {
            data: Value::String(String::from_utf8_lossy(&response.body).into_owned()),
            meta: None,
        }),
    }
}

/// Code to report when an error body carries none.
pub fn code_for_status(status: u16) -> &'static str {
    match status {
        401 => codes::UNAUTHORIZED,
        403 => codes::FORBIDDEN,
        404 => codes::NOT_FOUND,
        409 => codes::CONFLICT,
        413 => codes::PAYLOAD_TOO_LARGE,
        _ => codes::UNKNOWN,
    }
}

/// Percent-encodes `raw` as a single URL path segment.
pub fn path_segment(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse("http://localhost/") else {
        return raw.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(raw);
    }
    url.path().trim_start_matches('/').to_string()
}
