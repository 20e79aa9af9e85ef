//! Assignment worker.
//!
//! Pulls crawl assignments from the remote API and completes them through the
//! crawler sidecar. Work is discovered two ways: a periodic poll and a
//! server-sent event stream that triggers an immediate fetch. Both paths end
//! in [`AssignmentWorker::run_cycle`]; the claim set makes sure overlapping
//! cycles never process the same assignment twice.
//!
//! Pipeline per assignment:
//! ```text
//! claim -> start (skip if in_progress, 409 = fine) -> crawl -> submit (409 = fine) -> release
//! ```
//!
//! When the crawler cannot be initialized the worker keeps running in a
//! degraded mode: heartbeats and fetches continue, nothing is processed.

use chrono::Utc;
use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::claims::{ClaimSet, ClaimTicket};
use crate::central_client::{ApiError, AssignmentApi};
use crate::config::WorkerConfig;
use crate::crawler::{CrawlRequest, Crawler, CrawlerError};
use crate::models::{
    AgentInfo, Assignment, AssignmentQuery, AssignmentStatus, StartOutcome, SubmitOutcome,
    Submission,
};
use crate::sse::{Backoff, SseParser};
use crate::util::short_id;

/// SSE event name that announces new work
pub const ASSIGNMENT_EVENT: &str = "assignment";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Crawl(#[from] CrawlerError),

    #[error("Assignment {0} has no source URL")]
    MissingSourceUrl(String),

    #[error("Crawl for assignment {0} returned no content")]
    EmptyContent(String),

    #[error("Worker is shutting down")]
    ShuttingDown,
}

/// What caused a fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Poll,
    Event,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Poll => "poll",
            Self::Event => "event",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// The server already had a result (submit returned 409)
    AlreadyCompleted,
}

/// Summary of one fetch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub claimed: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    pub degraded: bool,
}

/// Snapshot published for UIs and logs
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub running: bool,
    pub can_process: bool,
    pub sse_connected: bool,
    /// Assignment ids currently claimed
    pub active: Vec<String>,
    /// Assignments seen by the latest fetch
    pub assignments: Vec<Assignment>,
    pub total_available: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

struct RunState {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: WorkerConfig,
    worker_id: String,
    api: Arc<dyn AssignmentApi>,
    crawler: Arc<dyn Crawler>,
    claims: ClaimSet,
    /// Bounds concurrent pipelines across overlapping cycles
    slots: Semaphore,
    can_process: AtomicBool,
    sse_connected: AtomicBool,
    /// Set once the degraded warning has been logged
    degraded_warned: AtomicBool,
    sse_attempt: Mutex<Option<CancellationToken>>,
    /// Pending fetch requested by the event stream; bursts collapse into one permit
    fetch_requested: Notify,
    status: watch::Sender<WorkerStatus>,
}

pub struct AssignmentWorker {
    inner: Arc<Inner>,
    run: tokio::sync::Mutex<Option<RunState>>,
}

impl AssignmentWorker {
    pub fn new(
        config: WorkerConfig,
        api: Arc<dyn AssignmentApi>,
        crawler: Arc<dyn Crawler>,
    ) -> Self {
        let (status, _) = watch::channel(WorkerStatus::default());
        let slots = Semaphore::new(config.max_concurrent.max(1));
        Self {
            inner: Arc::new(Inner {
                claims: ClaimSet::new(config.claim_ttl()),
                worker_id: uuid::Uuid::new_v4().to_string(),
                config,
                api,
                crawler,
                slots,
                can_process: AtomicBool::new(false),
                sse_connected: AtomicBool::new(false),
                degraded_warned: AtomicBool::new(false),
                sse_attempt: Mutex::new(None),
                fetch_requested: Notify::new(),
                status,
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.status.borrow().clone()
    }

    pub fn can_process(&self) -> bool {
        self.inner.can_process.load(Ordering::SeqCst)
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.inner.claims
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// (Re)initialize the crawler; returns whether processing is enabled
    pub async fn initialize(&self) -> bool {
        self.inner.initialize_crawler().await
    }

    /// Start heartbeat, polling and the event stream. No-op when running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if run.is_some() {
            debug!("Assignment worker already running");
            return;
        }

        info!(
            "Starting assignment worker {}",
            short_id(&self.inner.worker_id)
        );
        self.inner.initialize_crawler().await;

        let platforms = &self.inner.config.platforms;
        if !platforms.is_empty() {
            if let Err(e) = self.inner.api.update_preferences(platforms).await {
                warn!("Failed to publish platform preferences: {}", e);
            }
        }

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(self.inner.clone().heartbeat_loop(shutdown.clone())),
            tokio::spawn(self.inner.clone().poll_loop(shutdown.clone())),
            tokio::spawn(self.inner.clone().sse_loop(shutdown.clone())),
            tokio::spawn(self.inner.clone().event_loop(shutdown.clone())),
        ];
        self.inner.status.send_modify(|s| s.running = true);
        *run = Some(RunState { shutdown, tasks });
    }

    /// Stop all loops, close the crawler and forget claims. No-op when stopped.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(state) = run.take() else {
            return;
        };

        info!("Stopping assignment worker");
        state.shutdown.cancel();
        if let Some(attempt) = self.inner.sse_attempt.lock().take() {
            attempt.cancel();
        }
        for task in state.tasks {
            task.abort();
            let _ = task.await;
        }

        self.inner.crawler.close().await;
        self.inner.claims.clear();
        self.inner.sse_connected.store(false, Ordering::SeqCst);
        self.inner.status.send_modify(|s| {
            s.running = false;
            s.sse_connected = false;
            s.active.clear();
        });
        info!("Assignment worker stopped");
    }

    /// Fetch once and process everything claimable, waiting for completion
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle(Trigger::Manual).await
    }
}

impl Inner {
    async fn initialize_crawler(&self) -> bool {
        let ready = match self.crawler.initialize().await {
            Ok(()) => {
                info!("Crawler ready, assignment processing enabled");
                self.degraded_warned.store(false, Ordering::SeqCst);
                true
            }
            Err(e) if e.is_availability() => {
                warn!(
                    "Crawler unavailable ({}); running degraded: assignments are fetched but not processed",
                    e
                );
                false
            }
            Err(e) => {
                error!(
                    "Crawler initialization failed ({}); running degraded: assignments are fetched but not processed",
                    e
                );
                false
            }
        };
        self.can_process.store(ready, Ordering::SeqCst);
        self.status.send_modify(|s| s.can_process = ready);
        ready
    }

    fn agent_info(&self) -> AgentInfo {
        AgentInfo {
            worker_id: self.worker_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            can_crawl: self.can_process.load(Ordering::SeqCst),
            sse_connected: self.sse_connected.load(Ordering::SeqCst),
            platforms: self.config.platforms.clone(),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.api.heartbeat(&self.agent_info()).await {
                Ok(()) => debug!("Heartbeat sent"),
                Err(e) => warn!("Heartbeat failed: {}", e),
            }
        }
        debug!("Heartbeat loop stopped");
    }

    async fn poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut trigger = Trigger::Startup;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let evicted = self.claims.evict_expired();
            if evicted > 0 {
                warn!("Dropped {} expired assignment claims", evicted);
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.run_cycle(trigger) => {}
            }
            trigger = Trigger::Poll;
        }
        debug!("Poll loop stopped");
    }

    /// Runs one cycle per pending event-stream request, never more than one at a time
    async fn event_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.fetch_requested.notified() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.run_cycle(Trigger::Event) => {}
            }
        }
        debug!("Event cycle loop stopped");
    }

    async fn run_cycle(&self, trigger: Trigger) -> CycleReport {
        let degraded = !self.can_process.load(Ordering::SeqCst);
        let query = AssignmentQuery::actionable(self.config.fetch_limit, &self.config.platforms);

        let list = match self.api.list_assignments(&query).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to fetch assignments ({}): {}", trigger, e);
                self.status
                    .send_modify(|s| s.last_error = Some(e.to_string()));
                return CycleReport {
                    degraded,
                    ..Default::default()
                };
            }
        };

        let mut report = CycleReport {
            fetched: list.assignments.len(),
            degraded,
            ..Default::default()
        };
        debug!(
            "Fetched {} assignments ({} available, trigger: {})",
            report.fetched, list.total, trigger
        );
        self.status.send_modify(|s| {
            s.assignments = list.assignments.clone();
            s.total_available = list.total;
        });

        if degraded {
            if !self.degraded_warned.swap(true, Ordering::SeqCst) {
                warn!(
                    "Crawler unavailable: {} assignment(s) visible, none will be processed",
                    report.fetched
                );
            }
            report.skipped = report.fetched;
            return report;
        }

        let mut claimed = Vec::new();
        for assignment in list.assignments {
            if !assignment.status.is_actionable() {
                report.skipped += 1;
                continue;
            }
            let Some(ticket) = self.claims.try_claim(&assignment.id) else {
                debug!("Assignment {} already in flight", short_id(&assignment.id));
                report.skipped += 1;
                continue;
            };
            claimed.push((assignment, ticket));
        }
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return report;
        }
        self.publish_active();

        let pipelines = claimed
            .into_iter()
            .map(|(assignment, ticket)| self.process_claimed(assignment, ticket));
        for result in join_all(pipelines).await {
            match result {
                Ok(_) => report.completed += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Runs the pipeline for an already claimed assignment and releases it
    async fn process_claimed(
        &self,
        assignment: Assignment,
        ticket: ClaimTicket,
    ) -> Result<ProcessOutcome, WorkerError> {
        let result = match self.slots.acquire().await {
            Ok(_permit) => {
                self.claims.touch(&ticket);
                self.process(&assignment, &ticket).await
            }
            Err(_) => Err(WorkerError::ShuttingDown),
        };
        self.claims.release(&ticket);

        let id = short_id(&assignment.id);
        match &result {
            Ok(ProcessOutcome::Completed) => info!("Assignment {} completed", id),
            Ok(ProcessOutcome::AlreadyCompleted) => {
                info!("Assignment {} was already completed on the server", id)
            }
            Err(e) => warn!("Assignment {} failed: {}", id, e),
        }
        self.status.send_modify(|s| match &result {
            Ok(_) => s.completed += 1,
            Err(e) => {
                s.failed += 1;
                s.last_error = Some(e.to_string());
            }
        });
        self.publish_active();
        result
    }

    async fn process(
        &self,
        assignment: &Assignment,
        ticket: &ClaimTicket,
    ) -> Result<ProcessOutcome, WorkerError> {
        let id = short_id(&assignment.id);

        if assignment.status == AssignmentStatus::NotStarted {
            match self.api.start_assignment(&assignment.id).await? {
                StartOutcome::Started => debug!("Assignment {} started", id),
                StartOutcome::AlreadyStarted => {
                    info!("Assignment {} already started, continuing", id)
                }
            }
            self.claims.touch(ticket);
        }

        let url = assignment
            .source_url()
            .ok_or_else(|| WorkerError::MissingSourceUrl(assignment.id.clone()))?;

        info!("Crawling {} for assignment {}", url, id);
        let result = self.crawler.crawl(&CrawlRequest::new(url)).await?;
        if !result.has_content() {
            return Err(WorkerError::EmptyContent(assignment.id.clone()));
        }
        self.claims.touch(ticket);

        let submission = Submission {
            metadata: json!({
                "url": result.url,
                "status_code": result.status_code,
                "platform": assignment.task.platform,
                "crawled_at": Utc::now().to_rfc3339(),
                "worker_id": self.worker_id,
                "crawler": result.metadata,
            }),
            content: result.markdown,
        };

        Ok(
            match self.api.submit_assignment(&assignment.id, &submission).await? {
                SubmitOutcome::Submitted => ProcessOutcome::Completed,
                SubmitOutcome::AlreadyCompleted => ProcessOutcome::AlreadyCompleted,
            },
        )
    }

    fn publish_active(&self) {
        let active = self.claims.ids();
        self.status.send_modify(|s| s.active = active);
    }

    fn set_sse_connected(&self, connected: bool) {
        self.sse_connected.store(connected, Ordering::SeqCst);
        self.status.send_modify(|s| s.sse_connected = connected);
    }

    /// New attempt token; cancels whatever attempt was still registered
    fn begin_sse_attempt(&self, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        if let Some(previous) = self.sse_attempt.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    async fn sse_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(
            self.config.sse_backoff_base(),
            self.config.sse_backoff_max(),
        );

        while !shutdown.is_cancelled() {
            let attempt = self.begin_sse_attempt(&shutdown);
            let result = self.consume_events(&attempt, &mut backoff).await;
            attempt.cancel();
            self.set_sse_connected(false);

            match result {
                Ok(()) => info!("Event stream closed"),
                Err(e) => warn!("Event stream failed: {}", e),
            }
            if shutdown.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting event stream in {:?}", delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!("Event stream loop stopped");
    }

    async fn consume_events(
        &self,
        attempt: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), ApiError> {
        let mut stream = tokio::select! {
            _ = attempt.cancelled() => return Ok(()),
            opened = self.api.open_event_stream() => opened?,
        };

        backoff.reset();
        self.set_sse_connected(true);
        info!("Event stream connected");

        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                _ = attempt.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok(bytes)) => bytes,
            };

            for event in parser.feed(&bytes) {
                if attempt.is_cancelled() {
                    return Ok(());
                }
                if event.is(ASSIGNMENT_EVENT) {
                    debug!("Assignment event received, fetching");
                    self.fetch_requested.notify_one();
                } else {
                    debug!("Ignoring event {:?}", event.event);
                }
            }
        }
    }
}
