//! Crawler sidecar orchestration
//!
//! Owns the single crawler container. `ensure_running` is the one entry
//! point callers need: it checks Docker, pulls the image, creates or starts
//! the container and waits until the crawler answers `/health`.
//!
//! The orchestrator never calls back into its users. Status changes and pull
//! progress are published on a broadcast channel instead.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::{CrawlerConfig, SidecarConfig};
use crate::crawler::Sidecar;
use crate::docker::{
    ContainerDescriptor, ContainerStatus, DockerClient, DockerError, PullOutcome, RunOutcome,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications published by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PullProgress(String),
    StatusChanged(ContainerStatus),
}

pub struct ContainerOrchestrator {
    docker: Arc<DockerClient>,
    descriptor: RwLock<ContainerDescriptor>,
    health_retries: u32,
    health_delay: Duration,
    http: reqwest::Client,
    /// Serializes orchestration so concurrent callers never race `docker run`
    ensure_lock: Mutex<()>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl ContainerOrchestrator {
    pub fn new(docker: Arc<DockerClient>, sidecar: &SidecarConfig, crawler: &CrawlerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            docker,
            descriptor: RwLock::new(ContainerDescriptor::from_config(sidecar)),
            health_retries: sidecar.health_retries,
            health_delay: sidecar.health_delay(),
            http: reqwest::Client::builder()
                .timeout(crawler.health_timeout())
                .build()
                .unwrap_or_default(),
            ensure_lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn descriptor(&self) -> ContainerDescriptor {
        self.descriptor.read().clone()
    }

    pub fn status(&self) -> ContainerStatus {
        self.descriptor.read().status
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.descriptor.read().host_port)
    }

    pub fn docker(&self) -> &DockerClient {
        &self.docker
    }

    fn set_status(&self, status: ContainerStatus) {
        let changed = {
            let mut descriptor = self.descriptor.write();
            let changed = descriptor.status != status;
            descriptor.status = status;
            changed
        };
        if changed {
            debug!("Sidecar status -> {}", status);
            let _ = self.events.send(OrchestratorEvent::StatusChanged(status));
        }
    }

    /// One `/health` probe against the sidecar
    pub async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.base_url());
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Sidecar health probe failed: {}", e);
                false
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<PullOutcome, DockerError> {
        let events = self.events.clone();
        self.docker
            .pull_image(image, &move |line| {
                let _ = events.send(OrchestratorEvent::PullProgress(line.to_string()));
            })
            .await
    }

    async fn bring_up(&self) -> Result<String, DockerError> {
        let descriptor = self.descriptor();

        self.pull(&descriptor.image).await?;

        match self.docker.run_container(&descriptor).await? {
            RunOutcome::AlreadyRunning => debug!("Sidecar {} already running", descriptor.name),
            RunOutcome::Started => info!("Sidecar {} restarted from stopped state", descriptor.name),
            RunOutcome::Created => info!("Sidecar {} created", descriptor.name),
        }

        self.wait_healthy(&descriptor.name).await?;
        self.set_status(ContainerStatus::Running);
        Ok(self.base_url())
    }

    async fn wait_healthy(&self, name: &str) -> Result<(), DockerError> {
        let result = self
            .docker
            .wait_for_health(
                name,
                || self.probe_health(),
                self.health_retries,
                self.health_delay,
            )
            .await;

        if let Err(DockerError::ContainerNotRunning { status, .. }) = &result {
            self.set_status(*status);
        }
        result
    }

    /// Guarantee the sidecar runs and is healthy; returns its base URL
    pub async fn ensure_running(&self) -> Result<String, DockerError> {
        let _guard = self.ensure_lock.lock().await;

        if let Err(e) = self.docker.ensure_availability().await {
            self.set_status(ContainerStatus::Unknown);
            return Err(e);
        }

        self.bring_up().await
    }

    /// Restart the sidecar, rebuilding it when `docker restart` fails
    pub async fn restart(&self) -> Result<String, DockerError> {
        let _guard = self.ensure_lock.lock().await;
        let name = self.descriptor.read().name.clone();

        match self.docker.restart_container(&name).await {
            Ok(()) => {
                self.wait_healthy(&name).await?;
                self.set_status(ContainerStatus::Running);
                Ok(self.base_url())
            }
            Err(e) => {
                warn!(
                    "docker restart {} failed ({}), recreating the container",
                    name, e
                );
                if let Err(e) = self.docker.remove_container(&name, true).await {
                    debug!("No stale container to remove: {}", e);
                }
                self.bring_up().await
            }
        }
    }

    /// Stop the container but keep it for a fast start next time
    pub async fn stop(&self) -> Result<(), DockerError> {
        let _guard = self.ensure_lock.lock().await;
        let name = self.descriptor.read().name.clone();
        self.docker.stop_container(&name).await?;
        self.set_status(ContainerStatus::Exited);
        Ok(())
    }

    /// Stop and remove the container
    pub async fn destroy(&self) -> Result<(), DockerError> {
        let _guard = self.ensure_lock.lock().await;
        let name = self.descriptor.read().name.clone();
        if let Err(e) = self.docker.stop_container(&name).await {
            debug!("Stop before removal failed: {}", e);
        }
        self.docker.remove_container(&name, true).await?;
        self.set_status(ContainerStatus::Unknown);
        info!("Sidecar {} destroyed", name);
        Ok(())
    }

    pub async fn logs(&self, tail: usize) -> Result<String, DockerError> {
        let name = self.descriptor.read().name.clone();
        self.docker.logs(&name, tail).await
    }
}

#[async_trait]
impl Sidecar for ContainerOrchestrator {
    async fn ensure_running(&self) -> Result<String, DockerError> {
        ContainerOrchestrator::ensure_running(self).await
    }

    async fn is_healthy(&self) -> bool {
        self.probe_health().await
    }
}
