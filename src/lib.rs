//! Crawl Worker
//!
//! Fetches crawl assignments from the remote API, runs them against a local
//! crawler sidecar container and submits the results. Alongside the worker it
//! can supervise a local node process and account for uptime.
//!
//! ## Module Structure
//!
//! - `docker`: Docker CLI client (binary discovery, images, containers)
//! - `container/`: Crawler sidecar orchestration
//! - `crawler`: HTTP client for the crawler sidecar
//! - `central_client`: Remote assignment API client
//! - `sse`: Server-sent events parsing and reconnect backoff
//! - `worker/`: Assignment worker, claim set and uptime runner
//! - `supervisor`: Node process supervisor
//! - `local_storage`: Persisted uptime state
//! - `config`: Settings file and environment overrides
//! - `models`: Wire types
//! - `clock`, `util`: Shared helpers

// ============================================================================
// MODULES
// ============================================================================

/// Shared utility functions
pub mod util;

/// Wall-clock abstraction
pub mod clock;

/// Settings
pub mod config;

/// Wire types shared with the assignment API
pub mod models;

/// Docker CLI client
pub mod docker;

/// Crawler sidecar orchestration
pub mod container;

/// Crawler sidecar HTTP client
pub mod crawler;

/// Remote assignment API client
pub mod central_client;

/// Server-sent events
pub mod sse;

/// Persisted local state
pub mod local_storage;

/// Node process supervisor
pub mod supervisor;

/// Background workers
pub mod worker;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use central_client::{
    ApiError, AssignmentApi, EventStream, HttpAssignmentApi, StaticToken, TokenSource,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ApiConfig, CrawlerConfig, NodeConfig, Settings, SidecarConfig, UptimeConfig, WorkerConfig,
};
pub use container::{ContainerOrchestrator, OrchestratorEvent};
pub use crawler::{
    CacheMode, CrawlRequest, CrawlResult, Crawler, CrawlerClient, CrawlerError, Sidecar,
};
pub use docker::{
    BinaryLocator, CommandRunner, ContainerDescriptor, ContainerStatus, DockerClient, DockerError,
    ProcessRunner, Remediation,
};
pub use local_storage::{FileUptimeStore, MemoryUptimeStore, StorageError, UptimeState, UptimeStore};
pub use models::{
    AgentInfo, Assignment, AssignmentList, AssignmentQuery, AssignmentStatus, Reward,
    StartOutcome, SubmitOutcome, Submission, UptimeCycle, UptimeReport,
};
pub use sse::{Backoff, SseEvent, SseParser};
pub use supervisor::{
    CommandLauncher, HealthProbe, HttpHealthProbe, ProcessHandle, ProcessLauncher,
    ProcessSupervisor, SupervisedChild, SupervisorError, SupervisorEvent, SupervisorStatus,
};
pub use worker::{
    AssignmentWorker, ClaimSet, ClaimTicket, CycleReport, TickOutcome, UptimeError,
    UptimeReporter, UptimeRunner, WorkerError, WorkerStatus,
};
