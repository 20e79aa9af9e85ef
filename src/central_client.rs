//! Client for the remote assignment API
//!
//! All calls carry a bearer token from a [`TokenSource`]. `409 Conflict` on
//! start/submit is not an error: it means the transition already happened,
//! and is surfaced as [`StartOutcome::AlreadyStarted`] /
//! [`SubmitOutcome::AlreadyCompleted`].
//!
//! Endpoints:
//! ```text
//! GET  /assignments?statuses=..&limit=..&platforms=..
//! POST /assignments/{id}/start
//! POST /assignments/{id}/submit     {content, metadata}
//! POST /workers/heartbeat           {agent_info}
//! PUT  /workers/preferences         {platforms}
//! GET  /events                      text/event-stream
//! POST /uptime/report               {duration_ms, started_at, ended_at}
//! ```

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::models::{
    AgentInfo, AssignmentList, AssignmentQuery, Reward, StartOutcome, SubmitOutcome, Submission,
    UptimeReport,
};
use crate::util::join_url;
use crate::worker::uptime::UptimeReporter;

/// Raw body chunks of the event stream
pub type EventStream = BoxStream<'static, Result<Vec<u8>, ApiError>>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unauthorized (HTTP {0})")]
    Unauthorized(u16),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(code) => Some(*code),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Supplies the bearer token for each request
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A token fixed at startup
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone().filter(|t| !t.is_empty())
    }
}

#[async_trait]
pub trait AssignmentApi: Send + Sync {
    async fn list_assignments(&self, query: &AssignmentQuery) -> Result<AssignmentList, ApiError>;

    async fn start_assignment(&self, id: &str) -> Result<StartOutcome, ApiError>;

    async fn submit_assignment(
        &self,
        id: &str,
        submission: &Submission,
    ) -> Result<SubmitOutcome, ApiError>;

    async fn heartbeat(&self, info: &AgentInfo) -> Result<(), ApiError>;

    async fn update_preferences(&self, platforms: &[String]) -> Result<(), ApiError>;

    /// Open the server-sent event stream; resolves once headers arrive
    async fn open_event_stream(&self) -> Result<EventStream, ApiError>;
}

pub struct HttpAssignmentApi {
    base_url: String,
    client: reqwest::Client,
    /// No overall timeout: the event stream stays open indefinitely
    stream_client: reqwest::Client,
    token: Arc<dyn TokenSource>,
}

impl HttpAssignmentApi {
    pub fn new(config: &ApiConfig, token: Arc<dyn TokenSource>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.stream_connect_timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            stream_client,
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map non-2xx responses to errors, passing 409 through to the caller
    async fn check(resp: Response) -> Result<Response, ApiError> {
        let status = resp.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(status.as_u16()));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_transition(&self, path: &str, body: Option<Value>) -> Result<bool, ApiError> {
        let mut request = self.authorize(self.client.post(self.url(path)));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = Self::check(request.send().await?).await?;
        Ok(resp.status() != StatusCode::CONFLICT)
    }
}

#[async_trait]
impl AssignmentApi for HttpAssignmentApi {
    async fn list_assignments(&self, query: &AssignmentQuery) -> Result<AssignmentList, ApiError> {
        let resp = self
            .authorize(self.client.get(self.url("/assignments")))
            .query(&query.to_query_pairs())
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(ApiError::Status {
                status: 409,
                body: resp.text().await.unwrap_or_default(),
            });
        }
        resp.json::<AssignmentList>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn start_assignment(&self, id: &str) -> Result<StartOutcome, ApiError> {
        let started = self
            .post_transition(&format!("/assignments/{}/start", id), None)
            .await?;
        if !started {
            debug!("Assignment {} was already started", id);
        }
        Ok(if started {
            StartOutcome::Started
        } else {
            StartOutcome::AlreadyStarted
        })
    }

    async fn submit_assignment(
        &self,
        id: &str,
        submission: &Submission,
    ) -> Result<SubmitOutcome, ApiError> {
        let body = serde_json::to_value(submission).map_err(|e| ApiError::Decode(e.to_string()))?;
        let submitted = self
            .post_transition(&format!("/assignments/{}/submit", id), Some(body))
            .await?;
        Ok(if submitted {
            SubmitOutcome::Submitted
        } else {
            SubmitOutcome::AlreadyCompleted
        })
    }

    async fn heartbeat(&self, info: &AgentInfo) -> Result<(), ApiError> {
        let resp = self
            .authorize(self.client.post(self.url("/workers/heartbeat")))
            .json(&serde_json::json!({ "agent_info": info }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn update_preferences(&self, platforms: &[String]) -> Result<(), ApiError> {
        let resp = self
            .authorize(self.client.put(self.url("/workers/preferences")))
            .json(&serde_json::json!({ "platforms": platforms }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn open_event_stream(&self) -> Result<EventStream, ApiError> {
        let resp = self
            .authorize(self.stream_client.get(self.url("/events")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(ApiError::Status {
                status: 409,
                body: String::new(),
            });
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ApiError::from))
            .boxed())
    }
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    #[serde(default)]
    reward: Option<Value>,
}

#[async_trait]
impl UptimeReporter for HttpAssignmentApi {
    async fn report(&self, report: &UptimeReport) -> Result<Option<Reward>, ApiError> {
        let resp = self
            .authorize(self.client.post(self.url("/uptime/report")))
            .json(report)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body: ReportResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        match body.reward {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => match serde_json::from_value::<Reward>(raw) {
                Ok(reward) => Ok(Some(reward)),
                Err(e) => {
                    warn!("Ignoring malformed uptime reward: {}", e);
                    Ok(None)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssignmentStatus;
    use httpmock::prelude::*;
    use serde_json::json;

    fn api(server: &MockServer) -> HttpAssignmentApi {
        let config = ApiConfig {
            base_url: server.base_url(),
            ..Default::default()
        };
        HttpAssignmentApi::new(&config, Arc::new(StaticToken(Some("tok".to_string())))).unwrap()
    }

    #[tokio::test]
    async fn test_list_assignments_sends_filters_and_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/assignments")
                    .query_param("statuses", "not_started,in_progress")
                    .query_param("limit", "10")
                    .query_param("platforms", "reddit,x")
                    .header("authorization", "Bearer tok");
                then.status(200).json_body(json!({
                    "assignments": [
                        {"id": "a1", "status": "not_started", "task": {"source_url": "https://ex.com"}}
                    ],
                    "total": 1
                }));
            })
            .await;

        let query = AssignmentQuery::actionable(10, &["reddit".to_string(), "x".to_string()]);
        let list = api(&server).list_assignments(&query).await.unwrap();

        mock.assert_async().await;
        assert_eq!(list.total, 1);
        assert_eq!(list.assignments[0].id, "a1");
        assert_eq!(list.assignments[0].status, AssignmentStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_start_conflict_is_already_started() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/assignments/a1/start");
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/assignments/a2/start");
                then.status(409).body("already started");
            })
            .await;

        let api = api(&server);
        assert_eq!(api.start_assignment("a1").await.unwrap(), StartOutcome::Started);
        assert_eq!(
            api.start_assignment("a2").await.unwrap(),
            StartOutcome::AlreadyStarted
        );
    }

    #[tokio::test]
    async fn test_submit_body_and_conflict() {
        let server = MockServer::start_async().await;
        let ok = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/assignments/a1/submit")
                    .json_body(json!({"content": "# page", "metadata": {"url": "https://ex.com"}}));
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/assignments/a2/submit");
                then.status(409);
            })
            .await;

        let api = api(&server);
        let submission = Submission {
            content: "# page".to_string(),
            metadata: json!({"url": "https://ex.com"}),
        };
        assert_eq!(
            api.submit_assignment("a1", &submission).await.unwrap(),
            SubmitOutcome::Submitted
        );
        ok.assert_async().await;
        assert_eq!(
            api.submit_assignment("a2", &submission).await.unwrap(),
            SubmitOutcome::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/assignments/a1/start");
                then.status(500).body("boom");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/workers/heartbeat");
                then.status(401);
            })
            .await;

        let api = api(&server);
        let err = api.start_assignment("a1").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, ref body } if body == "boom"));

        let info = AgentInfo {
            worker_id: "w".to_string(),
            version: "0.1.0".to_string(),
            os: "linux".to_string(),
            can_crawl: true,
            sse_connected: false,
            platforms: vec![],
        };
        let err = api.heartbeat(&info).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(401)));
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn test_heartbeat_and_preferences_bodies() {
        let server = MockServer::start_async().await;
        let heartbeat = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/workers/heartbeat")
                    .json_body_partial(r#"{"agent_info": {"worker_id": "w1", "can_crawl": false}}"#);
                then.status(200);
            })
            .await;
        let prefs = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/workers/preferences")
                    .json_body(json!({"platforms": ["reddit"]}));
                then.status(204);
            })
            .await;

        let api = api(&server);
        let info = AgentInfo {
            worker_id: "w1".to_string(),
            version: "0.1.0".to_string(),
            os: "linux".to_string(),
            can_crawl: false,
            sse_connected: true,
            platforms: vec!["reddit".to_string()],
        };
        api.heartbeat(&info).await.unwrap();
        api.update_preferences(&["reddit".to_string()]).await.unwrap();

        heartbeat.assert_async().await;
        prefs.assert_async().await;
    }

    #[tokio::test]
    async fn test_event_stream_yields_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/events")
                    .header("accept", "text/event-stream");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("event: assignment\ndata: {}\n\n");
            })
            .await;

        let mut stream = api(&server).open_event_stream().await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend(chunk.unwrap());
        }
        assert_eq!(body, b"event: assignment\ndata: {}\n\n");
    }

    #[tokio::test]
    async fn test_event_stream_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/events");
                then.status(503);
            })
            .await;

        let result = api(&server).open_event_stream().await;
        assert!(matches!(result, Err(ApiError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_uptime_report_reward() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/uptime/report").json_body(json!({
                    "duration_ms": 3_600_000,
                    "started_at": 0,
                    "ended_at": 3_600_000
                }));
                then.status(200)
                    .json_body(json!({"reward": {"id": "r1", "amount": "0.5", "currency": "PTS"}}));
            })
            .await;

        let report = UptimeReport {
            duration_ms: 3_600_000,
            started_at: 0,
            ended_at: 3_600_000,
        };
        let reward = api(&server).report(&report).await.unwrap().unwrap();

        mock.assert_async().await;
        assert_eq!(reward.amount, 0.5);
        assert_eq!(reward.id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_uptime_report_without_reward() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/uptime/report");
                then.status(200).json_body(json!({"reward": {"amount": "n/a"}}));
            })
            .await;

        let report = UptimeReport {
            duration_ms: 5_000,
            started_at: 0,
            ended_at: 5_000,
        };
        assert!(api(&server).report(&report).await.unwrap().is_none());
    }

    #[test]
    fn test_static_token_blank_is_none() {
        assert_eq!(StaticToken(Some(String::new())).token(), None);
        assert_eq!(StaticToken(Some("t".to_string())).token().as_deref(), Some("t"));
    }
}
