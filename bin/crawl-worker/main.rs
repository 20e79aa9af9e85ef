//! Crawl Worker
//!
//! Runs the assignment worker against the crawler sidecar, optionally with a
//! supervised node process and uptime reporting, until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use crawl_worker::{
    AssignmentWorker, ContainerOrchestrator, CrawlerClient, DockerClient, FileUptimeStore,
    HttpAssignmentApi, OrchestratorEvent, ProcessSupervisor, Settings, StaticToken,
    SupervisorError, SupervisorEvent, SystemClock, UptimeRunner,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "crawl-worker")]
#[command(about = "Fetches crawl assignments and completes them with a local crawler sidecar")]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, env = "CRAWL_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Assignment API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token for the assignment API
    #[arg(long)]
    token: Option<String>,

    /// Do not supervise the node process even if configured
    #[arg(long)]
    no_node: bool,

    /// Disable uptime tracking
    #[arg(long)]
    no_uptime: bool,

    /// Run a single fetch cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crawl_worker=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(url) = args.api_url {
        settings.api.base_url = url;
    }
    if let Some(token) = args.token {
        settings.api.token = Some(token);
    }

    info!("Starting Crawl Worker v{}", env!("CARGO_PKG_VERSION"));
    info!("  API: {}", settings.api.base_url);
    info!("  Sidecar image: {}", settings.sidecar.image);
    info!("  Data dir: {}", settings.uptime.data_dir.display());
    if settings.api.token.is_none() {
        warn!("No API token configured, requests will be unauthenticated");
    }

    let docker = Arc::new(DockerClient::from_env(
        settings.sidecar.docker_search_paths.clone(),
    ));
    let orchestrator = Arc::new(ContainerOrchestrator::new(
        docker,
        &settings.sidecar,
        &settings.crawler,
    ));
    let mut sidecar_events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = sidecar_events.recv().await {
            match event {
                OrchestratorEvent::PullProgress(line) => debug!("pull: {}", line),
                OrchestratorEvent::StatusChanged(status) => info!("Sidecar is {}", status),
            }
        }
    });

    let crawler = Arc::new(CrawlerClient::new(
        orchestrator.clone(),
        settings.crawler.clone(),
    ));
    let api = Arc::new(
        HttpAssignmentApi::new(
            &settings.api,
            Arc::new(StaticToken(settings.api.token.clone())),
        )
        .context("Failed to build API client")?,
    );
    let worker = AssignmentWorker::new(settings.worker.clone(), api.clone(), crawler);

    if args.once {
        worker.initialize().await;
        let report = worker.run_cycle().await;
        info!(
            "Cycle done: {} fetched, {} completed, {} failed, {} skipped",
            report.fetched, report.completed, report.failed, report.skipped
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    let supervisor = if args.no_node {
        None
    } else {
        match ProcessSupervisor::from_config(&settings.node) {
            Ok(supervisor) => Some(supervisor),
            Err(SupervisorError::NotConfigured) => None,
            Err(e) => return Err(e.into()),
        }
    };
    if let Some(supervisor) = &supervisor {
        let mut events = supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SupervisorEvent::Fatal { message, .. }) => {
                        error!("Node supervision stopped: {}", message)
                    }
                    Ok(event) => debug!("Node event: {:?}", event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Missed {} node events", n)
                    }
                    Err(_) => break,
                }
            }
        });
        match supervisor.start().await {
            Ok(handle) => info!("Node running at {}", handle.base_url()),
            Err(e) => warn!("Node failed to start: {}", e),
        }
    }

    let uptime = if args.no_uptime {
        None
    } else {
        let runner = Arc::new(UptimeRunner::new(
            &settings.uptime,
            Arc::new(SystemClock),
            Arc::new(FileUptimeStore::new(settings.uptime.state_path())),
            api.clone(),
        ));
        Some(tokio::spawn(runner.run(shutdown.clone())))
    };

    worker.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    shutdown.cancel();
    worker.stop().await;
    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }
    if let Some(uptime) = uptime {
        let _ = uptime.await;
    }
    info!("Crawl Worker stopped");
    Ok(())
}
