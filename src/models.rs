//! Wire types shared with the remote assignment API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Assignment lifecycle as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    /// Any status this worker does not understand; never processed
    #[serde(other)]
    Unknown,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses the worker can pick up
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::NotStarted | Self::InProgress)
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work description attached to an assignment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTask {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub reward_amount: Option<f64>,
}

/// A unit of crawl work issued by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub task: AssignmentTask,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Assignment {
    /// The source URL if present and non-blank
    pub fn source_url(&self) -> Option<&str> {
        self.task
            .source_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Response of `GET /assignments`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentList {
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub total: u64,
}

/// Filter for `GET /assignments`
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentQuery {
    pub statuses: Vec<AssignmentStatus>,
    pub limit: u32,
    pub platforms: Vec<String>,
}

impl AssignmentQuery {
    /// Actionable assignments, optionally restricted to platforms
    pub fn actionable(limit: u32, platforms: &[String]) -> Self {
        Self {
            statuses: vec![AssignmentStatus::NotStarted, AssignmentStatus::InProgress],
            limit,
            platforms: platforms.to_vec(),
        }
    }

    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (
                "statuses",
                self.statuses
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("limit", self.limit.to_string()),
        ];
        if !self.platforms.is_empty() {
            pairs.push(("platforms", self.platforms.join(",")));
        }
        pairs
    }
}

/// Body of `POST /assignments/{id}/submit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Result of `POST /assignments/{id}/start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// 409: someone (possibly us, earlier) already started it
    AlreadyStarted,
}

/// Result of `POST /assignments/{id}/submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// 409: the server already holds a result
    AlreadyCompleted,
}

/// Capability flags carried by the heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub worker_id: String,
    pub version: String,
    pub os: String,
    pub can_crawl: bool,
    pub sse_connected: bool,
    pub platforms: Vec<String>,
}

/// Uptime report sent when a cycle expires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeReport {
    pub duration_ms: i64,
    pub started_at: i64,
    pub ended_at: i64,
}

/// Reward returned for an uptime report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(deserialize_with = "strict_amount")]
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

/// One uptime accounting window, timestamps in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptimeCycle {
    pub uptime_ms: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub refresh_at: i64,
}

impl UptimeCycle {
    pub fn new(now_ms: i64, window_ms: i64) -> Self {
        Self {
            uptime_ms: 0,
            created_at: now_ms,
            updated_at: now_ms,
            refresh_at: now_ms + window_ms,
        }
    }

    /// Persisted cycles that fail this are discarded
    pub fn is_valid(&self) -> bool {
        self.uptime_ms >= 0 && self.refresh_at > self.created_at
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.refresh_at
    }

    pub fn window_ms(&self) -> i64 {
        self.refresh_at - self.created_at
    }
}

/// Amounts arrive as numbers or decimal strings depending on the endpoint
fn parse_amount(value: serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(parse_amount))
}

fn strict_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    parse_amount(value).ok_or_else(|| serde::de::Error::custom("invalid reward amount"))
}
