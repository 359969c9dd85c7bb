//! HTTP adapter for the backend's REST surface.
//!
//! The core hands this client to the reconciler, mood store, and autosave
//! queue through their backend traits; nothing else in the crate talks to the
//! network. Every request carries a bearer credential minted by the external
//! identity provider via [`TokenProvider`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use crate::autosave::DocumentStore;
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::mood::{MoodBackend, MoodEntry, MoodSummary, MoodTrendPoint, MoodWrite};
use crate::session::{ChatBackend, SessionPayload};
use crate::stream::ByteChunkStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies the opaque bearer credential from the identity provider.
///
/// The core never inspects the credential; it is fetched fresh per request so
/// the provider can rotate it silently.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, ApiError>;
}

/// Fixed credential, for tests and command-line hosts.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    /// Streams stay open far longer than any single request, so the
    /// streaming client bounds only the connect phase, not the whole body.
    stream_http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_timeout(base_url, tokens, None)
    }

    pub fn from_config(config: &ClientConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_timeout(
            config.api_base_url.clone(),
            tokens,
            Some(config.request_timeout()),
        )
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            http: build_http_client(timeout),
            stream_http: build_http_client(None),
            base_url: normalize_base_url(&base_url.into()),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch_session(&self, session_id: &str) -> Result<SessionPayload, ApiError> {
        let response = self
            .authorized(&self.http, Method::GET, &format!("/sessions/{}", session_id))
            .await?
            .send()
            .await?;
        let response = check(response).await?;
        decode(response, "session").await
    }

    pub async fn rename_session(
        &self,
        session_id: &str,
        name: &str,
    ) -> Result<SessionPayload, ApiError> {
        #[derive(Serialize)]
        struct RenameRequest<'a> {
            name: &'a str,
        }

        let response = self
            .authorized(
                &self.http,
                Method::PATCH,
                &format!("/sessions/{}", session_id),
            )
            .await?
            .json(&RenameRequest { name })
            .send()
            .await
            .map_err(|error| as_persist("session", error.into()))?;
        let response = check(response).await.map_err(|e| as_persist("session", e))?;
        decode(response, "session").await
    }

    /// Open the response stream for a prompt.
    ///
    /// The body is raw unframed text chunks until the connection closes. A
    /// non-success status is an immediate failure with zero fragments:
    /// auth/rate-limit/message-limit statuses keep their own error kinds,
    /// anything else is a stream error.
    pub async fn open_message_stream(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<ByteChunkStream, ApiError> {
        #[derive(Serialize)]
        struct GenerateStreamRequest<'a> {
            session_id: &'a str,
            prompt: &'a str,
        }

        let response = self
            .authorized(&self.stream_http, Method::POST, "/ai/generate-stream")
            .await?
            .json(&GenerateStreamRequest { session_id, prompt })
            .send()
            .await
            .map_err(|error| ApiError::Stream(format!("failed to open response stream: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_stream_open(
                status.as_u16(),
                retry_after,
                &truncate_detail(status.as_u16(), &body),
            ));
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|error| ApiError::Stream(error.to_string()))
        })))
    }

    pub async fn fetch_today_mood(&self) -> Result<Option<MoodEntry>, ApiError> {
        let response = self
            .authorized(&self.http, Method::GET, "/mood/today")
            .await?
            .send()
            .await?;
        let response = check(response).await?;
        decode(response, "today's mood").await
    }

    pub async fn put_daily_mood(&self, write: &MoodWrite) -> Result<MoodEntry, ApiError> {
        let response = self
            .authorized(&self.http, Method::PUT, "/mood/daily")
            .await?
            .json(write)
            .send()
            .await
            .map_err(|error| as_persist("mood", error.into()))?;
        let response = check(response).await.map_err(|e| as_persist("mood", e))?;
        decode(response, "mood entry").await
    }

    pub async fn fetch_mood_trend(&self, days: u32) -> Result<Vec<MoodTrendPoint>, ApiError> {
        let response = self
            .authorized(&self.http, Method::GET, "/mood/trend")
            .await?
            .query(&[("days", days)])
            .send()
            .await?;
        let response = check(response).await?;
        decode(response, "mood trend").await
    }

    pub async fn fetch_mood_summary(&self) -> Result<MoodSummary, ApiError> {
        let response = self
            .authorized(&self.http, Method::GET, "/mood/summary")
            .await?
            .send()
            .await?;
        let response = check(response).await?;
        decode(response, "mood summary").await
    }

    pub async fn fetch_journal(&self) -> Result<Value, ApiError> {
        let response = self
            .authorized(&self.http, Method::GET, "/journal")
            .await?
            .send()
            .await?;
        let response = check(response).await?;
        decode(response, "journal document").await
    }

    pub async fn save_journal(&self, document: &Value) -> Result<(), ApiError> {
        let response = self
            .authorized(&self.http, Method::PUT, "/journal")
            .await?
            .json(document)
            .send()
            .await
            .map_err(|error| as_persist("journal", error.into()))?;
        check(response).await.map_err(|e| as_persist("journal", e))?;
        Ok(())
    }

    async fn authorized(
        &self,
        client: &reqwest::Client,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self.tokens.bearer_token().await?;
        let url = format!("{}{}", self.base_url, path);
        Ok(client.request(method, url).bearer_auth(token))
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn fetch_session(&self, session_id: &str) -> Result<SessionPayload, ApiError> {
        ApiClient::fetch_session(self, session_id).await
    }

    async fn rename_session(
        &self,
        session_id: &str,
        name: &str,
    ) -> Result<SessionPayload, ApiError> {
        ApiClient::rename_session(self, session_id, name).await
    }

    async fn open_message_stream(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<ByteChunkStream, ApiError> {
        ApiClient::open_message_stream(self, session_id, prompt).await
    }
}

#[async_trait]
impl MoodBackend for ApiClient {
    async fn fetch_today_mood(&self) -> Result<Option<MoodEntry>, ApiError> {
        ApiClient::fetch_today_mood(self).await
    }

    async fn put_daily_mood(&self, write: &MoodWrite) -> Result<MoodEntry, ApiError> {
        ApiClient::put_daily_mood(self, write).await
    }

    async fn fetch_mood_trend(&self, days: u32) -> Result<Vec<MoodTrendPoint>, ApiError> {
        ApiClient::fetch_mood_trend(self, days).await
    }

    async fn fetch_mood_summary(&self) -> Result<MoodSummary, ApiError> {
        ApiClient::fetch_mood_summary(self).await
    }
}

#[async_trait]
impl DocumentStore for ApiClient {
    async fn save_document(&self, document: &Value) -> Result<(), ApiError> {
        self.save_journal(document).await
    }
}

/// Map a non-success response into an error, consuming the body for context.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(
        status.as_u16(),
        retry_after,
        truncate_detail(status.as_u16(), &body),
    ))
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T, ApiError> {
    response
        .json::<T>()
        .await
        .map_err(|error| ApiError::Network(format!("failed to decode {what}: {error}")))
}

/// Write failures become persist errors unless the status already has a more
/// specific kind (auth, rate limit, message limit).
fn as_persist(entity: &'static str, error: ApiError) -> ApiError {
    match error {
        ApiError::Network(message) => ApiError::Persist { entity, message },
        other => other,
    }
}

/// Status mapping for the stream-open request: statuses with their own error
/// kinds keep them; everything else non-success is a stream failure.
fn classify_stream_open(status: u16, retry_after: Option<Duration>, detail: &str) -> ApiError {
    match ApiError::from_status(status, retry_after, detail) {
        ApiError::Network(message) => ApiError::Stream(message),
        other => other,
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_detail(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>())
    }
}

fn build_http_client(timeout: Option<Duration>) -> reqwest::Client {
    let allow_system_proxy = std::env::var("HAVEN_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if !allow_system_proxy {
        builder = builder.no_proxy();
    }

    match builder.build() {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!("HTTP client build failed ({}); using defaults", error);
            reqwest::Client::new()
        }
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8000".to_string()
    } else {
        trimmed.to_string()
    }
}
