//! HTTP client for the crawler sidecar
//!
//! The sidecar exposes:
//!
//! ```text
//! GET    /health          liveness
//! POST   /crawl           {url, crawler_params, browser_params, session_id?}
//! POST   /session         open a browser session
//! DELETE /session/{id}    close it
//! ```
//!
//! Different crawler builds answer `/crawl` with different shapes, so every
//! response goes through `normalize_response` before the worker sees it.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CrawlerConfig;
use crate::docker::DockerError;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Crawler sidecar unavailable: {0}")]
    Unavailable(#[from] DockerError),
    #[error("Crawler request failed: {0}")]
    Transport(String),
    #[error("Crawler returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Crawl of {url} failed: {message}")]
    CrawlFailed { url: String, message: String },
    #[error("Invalid crawler response: {0}")]
    Decode(String),
}

impl CrawlerError {
    /// Docker itself is missing or down
    pub fn is_availability(&self) -> bool {
        matches!(self, Self::Unavailable(e) if e.is_availability())
    }
}

/// Something that can hand out a healthy crawler base URL
#[async_trait]
pub trait Sidecar: Send + Sync {
    /// Bring the sidecar up if needed and return its base URL
    async fn ensure_running(&self) -> Result<String, DockerError>;

    /// Cheap liveness probe
    async fn is_healthy(&self) -> bool;
}

/// What the worker needs from a crawler
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn initialize(&self) -> Result<(), CrawlerError>;

    async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlResult, CrawlerError>;

    /// Release sessions; the sidecar stays up for warm reuse
    async fn close(&self);
}

/// Crawler cache policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Enabled,
    #[default]
    Bypass,
    ReadOnly,
    WriteOnly,
    Disabled,
}

/// One crawl; unset options fall back to the client configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlRequest {
    pub url: String,
    pub light_mode: Option<bool>,
    pub text_mode: Option<bool>,
    pub cache_mode: Option<CacheMode>,
    pub session_id: Option<String>,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn light_mode(mut self, enabled: bool) -> Self {
        self.light_mode = Some(enabled);
        self
    }

    pub fn text_mode(mut self, enabled: bool) -> Self {
        self.text_mode = Some(enabled);
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = Some(mode);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn to_body(&self, config: &CrawlerConfig) -> Value {
        let light = self.light_mode.unwrap_or(config.light_mode);
        let text = self.text_mode.unwrap_or(config.text_mode);
        let cache = self.cache_mode.unwrap_or(config.cache_mode);
        let mut body = json!({
            "url": self.url,
            "crawler_params": {
                "cache_mode": cache,
                "light_mode": light,
                "text_mode": text,
                "page_timeout": config.crawl_timeout().as_millis() as u64,
            },
            "browser_params": {
                "headless": true,
                "light_mode": light,
                "text_mode": text,
            },
        });
        if let Some(session) = &self.session_id {
            body["session_id"] = json!(session);
        }
        body
    }
}

/// Normalized crawl output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    pub markdown: String,
    pub metadata: Value,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl CrawlResult {
    pub fn has_content(&self) -> bool {
        !self.markdown.trim().is_empty()
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn extract_markdown(v: &Value) -> Option<String> {
    match v.get("markdown") {
        Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
        Some(obj @ Value::Object(_)) => {
            if let Some(s) = non_empty_str(obj.get("fit_markdown"))
                .or_else(|| non_empty_str(obj.get("raw_markdown")))
            {
                return Some(s);
            }
        }
        _ => {}
    }
    v.get("markdown_v2")
        .and_then(|m| non_empty_str(m.get("raw_markdown")))
        .or_else(|| non_empty_str(v.get("content")))
        .or_else(|| non_empty_str(v.get("text")))
}

/// Flatten the response shapes crawler builds are known to produce
pub fn normalize_response(body: Value, requested_url: &str) -> CrawlResult {
    let nested = match body.get("results") {
        Some(Value::Array(items)) if !items.is_empty() => Some(items[0].clone()),
        _ => body.get("result").filter(|r| r.is_object()).cloned(),
    };
    let item = nested.unwrap_or(body);

    let markdown = extract_markdown(&item).unwrap_or_default();
    let failed = item.get("success").and_then(Value::as_bool) == Some(false);
    let error = non_empty_str(item.get("error"))
        .or_else(|| non_empty_str(item.get("error_message")))
        .or_else(|| failed.then(|| "crawler reported failure".to_string()));

    CrawlResult {
        url: non_empty_str(item.get("url")).unwrap_or_else(|| requested_url.to_string()),
        markdown,
        metadata: match item.get("metadata") {
            Some(meta @ Value::Object(_)) => meta.clone(),
            _ => json!({}),
        },
        status_code: item
            .get("status_code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok()),
        error,
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(alias = "id")]
    session_id: String,
}

pub struct CrawlerClient {
    sidecar: Arc<dyn Sidecar>,
    config: CrawlerConfig,
    http: reqwest::Client,
    base_url: RwLock<Option<String>>,
    /// Set after a transport failure against an unhealthy sidecar
    needs_reinit: AtomicBool,
    sessions: Mutex<HashSet<String>>,
}

impl CrawlerClient {
    pub fn new(sidecar: Arc<dyn Sidecar>, config: CrawlerConfig) -> Self {
        Self {
            sidecar,
            config,
            http: reqwest::Client::new(),
            base_url: RwLock::new(None),
            needs_reinit: AtomicBool::new(true),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn needs_reinit(&self) -> bool {
        self.needs_reinit.load(Ordering::SeqCst)
    }

    async fn base_url(&self) -> Result<String, CrawlerError> {
        if !self.needs_reinit() {
            if let Some(url) = self.base_url.read().clone() {
                return Ok(url);
            }
        }
        self.initialize().await?;
        self.base_url
            .read()
            .clone()
            .ok_or_else(|| CrawlerError::Transport("sidecar returned no base URL".to_string()))
    }

    async fn on_transport_failure(&self, error: &reqwest::Error) {
        warn!("Crawler request failed: {}", error);
        if !self.sidecar.is_healthy().await {
            warn!("Crawler sidecar unhealthy, full re-initialization on next call");
            self.needs_reinit.store(true, Ordering::SeqCst);
        }
    }

    /// Probe the sidecar directly
    pub async fn health(&self) -> bool {
        let Some(base) = self.base_url.read().clone() else {
            return false;
        };
        match self
            .http
            .get(crate::util::join_url(&base, "/health"))
            .timeout(self.config.health_timeout())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn create_session(&self) -> Result<String, CrawlerError> {
        let base = self.base_url().await?;
        let resp = self
            .http
            .post(crate::util::join_url(&base, "/session"))
            .timeout(self.config.crawl_timeout())
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| CrawlerError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CrawlerError::Http { status, body });
        }

        let session: SessionResponse = resp
            .json()
            .await
            .map_err(|e| CrawlerError::Decode(e.to_string()))?;
        self.sessions.lock().insert(session.session_id.clone());
        debug!("Opened crawler session {}", session.session_id);
        Ok(session.session_id)
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), CrawlerError> {
        self.sessions.lock().remove(session_id);
        let Some(base) = self.base_url.read().clone() else {
            return Ok(());
        };
        let resp = self
            .http
            .delete(crate::util::join_url(&base, &format!("/session/{}", session_id)))
            .timeout(self.config.health_timeout())
            .send()
            .await
            .map_err(|e| CrawlerError::Transport(e.to_string()))?;

        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CrawlerError::Http { status, body });
        }
        Ok(())
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl Crawler for CrawlerClient {
    async fn initialize(&self) -> Result<(), CrawlerError> {
        let url = self.sidecar.ensure_running().await?;
        info!("Crawler sidecar ready at {}", url);
        *self.base_url.write() = Some(url);
        self.needs_reinit.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlResult, CrawlerError> {
        let base = self.base_url().await?;
        let body = request.to_body(&self.config);

        let resp = match self
            .http
            .post(crate::util::join_url(&base, "/crawl"))
            .timeout(self.config.crawl_timeout())
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.on_transport_failure(&e).await;
                return Err(CrawlerError::Transport(e.to_string()));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CrawlerError::Http { status, body });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| CrawlerError::Decode(e.to_string()))?;
        let result = normalize_response(value, &request.url);

        if let Some(message) = &result.error {
            if !result.has_content() {
                return Err(CrawlerError::CrawlFailed {
                    url: request.url.clone(),
                    message: message.clone(),
                });
            }
        }

        debug!(
            "Crawled {} ({} chars, status {:?})",
            result.url,
            result.markdown.len(),
            result.status_code
        );
        Ok(result)
    }

    async fn close(&self) {
        let sessions: Vec<String> = self.sessions.lock().iter().cloned().collect();
        for session in sessions {
            if let Err(e) = self.close_session(&session).await {
                debug!("Failed to close crawler session {}: {}", session, e);
            }
        }
        self.needs_reinit.store(true, Ordering::SeqCst);
        debug!("Crawler client closed");
    }
}
