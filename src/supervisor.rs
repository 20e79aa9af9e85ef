//! Node process supervisor
//!
//! Runs the local node CLI as a child process on a freshly allocated port and
//! keeps it alive:
//!
//! - `start` spawns `<program> <args..> --port <n>` and polls `GET /health`
//!   until it answers `{"status": "ok"}`
//! - an unexpected exit of a ready process schedules a restart after a delay
//! - after `max_restarts` consecutive failed restarts the supervisor gives up
//!   and emits exactly one [`SupervisorEvent::Fatal`]
//! - `stop` clears any pending restart and marks the exit as intentional
//!   before killing the child, so a stop never triggers a restart
//!
//! The restart budget refills once a process has stayed ready for
//! `stable_after`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::util::allocate_free_port;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Idle,
    Starting,
    Ready,
    Stopping,
    CrashDetected,
    Restarting,
    /// Restart budget exhausted; only an explicit `start` leaves this state
    Failed,
}

impl fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::CrashDetected => "crash_detected",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub port: u16,
    pub ready: bool,
}

impl ProcessHandle {
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StatusChanged(SupervisorStatus),
    Exited {
        pid: Option<u32>,
        code: Option<i32>,
        intentional: bool,
    },
    RestartScheduled {
        attempt: u32,
        delay: Duration,
    },
    Fatal {
        restarts: u32,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No program configured")]
    NotConfigured,

    #[error("Failed to allocate a port: {0}")]
    PortAllocation(#[source] io::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Process exited during startup (code {code:?})")]
    ExitedDuringStartup { code: Option<i32> },

    #[error("Health check failed after {attempts} attempts")]
    HealthCheckFailed { attempts: u32 },

    #[error("Start interrupted by stop")]
    Stopped,
}

/// A spawned child the supervisor can wait on and kill
#[async_trait]
pub trait SupervisedChild: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves with the exit code once the process is gone
    async fn wait(&mut self) -> Option<i32>;

    async fn kill(&mut self);
}

/// Spawns the supervised program on a given port
pub trait ProcessLauncher: Send + Sync {
    fn program(&self) -> String;

    fn spawn(&self, port: u16) -> io::Result<Box<dyn SupervisedChild>>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, port: u16) -> bool;
}

/// Launches a real executable, forwarding its output to tracing
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .map(|program| Self::new(program, config.args.clone()))
    }
}

async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if stream == "stderr" {
            warn!(target: "node", "{}", line);
        } else {
            info!(target: "node", "{}", line);
        }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn program(&self) -> String {
        self.program.display().to_string()
    }

    fn spawn(&self, port: u16) -> io::Result<Box<dyn SupervisedChild>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }
        Ok(Box::new(TokioChild(child)))
    }
}

struct TokioChild(tokio::process::Child);

#[async_trait]
impl SupervisedChild for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.0.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait on node process: {}", e);
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.0.kill().await {
            debug!("Kill failed (already exited?): {}", e);
        }
    }
}

/// `GET /health` expecting `{"status": "ok"}`
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}/health", port);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!("Node health returned {}", resp.status());
                return false;
            }
            Err(e) => {
                debug!("Node health probe failed: {}", e);
                return false;
            }
        };
        match resp.json::<serde_json::Value>().await {
            Ok(body) => body.get("status").and_then(|s| s.as_str()) == Some("ok"),
            Err(_) => false,
        }
    }
}

struct RunningChild {
    generation: u64,
    pid: Option<u32>,
    port: u16,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: Option<oneshot::Receiver<Option<i32>>>,
}

struct Shared {
    status: SupervisorStatus,
    child: Option<RunningChild>,
    intentional_stop: bool,
    restart_attempts: u32,
    pending_restart: Option<JoinHandle<()>>,
    ready_since: Option<Instant>,
    last_exit_code: Option<i32>,
    generation: u64,
    fatal_emitted: bool,
}

struct Inner {
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
    config: NodeConfig,
    shared: Mutex<Shared>,
    /// One start sequence at a time
    start_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<SupervisorStatus>,
    events: broadcast::Sender<SupervisorEvent>,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        config: NodeConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                launcher,
                probe,
                config,
                shared: Mutex::new(Shared {
                    status: SupervisorStatus::Idle,
                    child: None,
                    intentional_stop: false,
                    restart_attempts: 0,
                    pending_restart: None,
                    ready_since: None,
                    last_exit_code: None,
                    generation: 0,
                    fatal_emitted: false,
                }),
                start_lock: tokio::sync::Mutex::new(()),
                status_tx,
                events,
            }),
        }
    }

    /// Supervisor for the configured program with the HTTP health probe
    pub fn from_config(config: &NodeConfig) -> Result<Self, SupervisorError> {
        let launcher = CommandLauncher::from_config(config).ok_or(SupervisorError::NotConfigured)?;
        let probe = HttpHealthProbe::new(config.health_timeout());
        Ok(Self::new(config.clone(), Arc::new(launcher), Arc::new(probe)))
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn handle(&self) -> Option<ProcessHandle> {
        let shared = self.inner.shared.lock();
        shared.child.as_ref().map(|c| ProcessHandle {
            pid: c.pid,
            port: c.port,
            ready: shared.status == SupervisorStatus::Ready,
        })
    }

    pub fn restart_attempts(&self) -> u32 {
        self.inner.shared.lock().restart_attempts
    }

    /// Start the process and wait until it is healthy.
    ///
    /// Returns the running handle if the process is already ready. An
    /// explicit start resets the restart budget.
    pub async fn start(&self) -> Result<ProcessHandle, SupervisorError> {
        {
            let mut shared = self.inner.shared.lock();
            shared.intentional_stop = false;
            if shared.status == SupervisorStatus::Failed {
                shared.restart_attempts = 0;
                shared.fatal_emitted = false;
            }
        }
        self.inner.start_once().await
    }

    /// Stop the process without triggering a restart. Safe to call anytime.
    pub async fn stop(&self) {
        let (kill_tx, exited_rx, pid) = {
            let mut shared = self.inner.shared.lock();
            shared.intentional_stop = true;
            if let Some(pending) = shared.pending_restart.take() {
                pending.abort();
                debug!("Cancelled pending node restart");
            }
            match shared.child.as_mut() {
                Some(child) => {
                    let taken = (child.kill_tx.take(), child.exited_rx.take(), child.pid);
                    self.inner.set_status(&mut shared, SupervisorStatus::Stopping);
                    taken
                }
                None => {
                    if shared.status != SupervisorStatus::Failed {
                        self.inner.set_status(&mut shared, SupervisorStatus::Idle);
                    }
                    return;
                }
            }
        };

        info!("Stopping node process (pid {:?})", pid);
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if let Some(exited_rx) = exited_rx {
            match timeout(self.inner.config.stop_timeout(), exited_rx).await {
                Ok(_) => debug!("Node process exited"),
                Err(_) => warn!(
                    "Node process did not exit within {:?}",
                    self.inner.config.stop_timeout()
                ),
            }
        }

        let mut shared = self.inner.shared.lock();
        shared.child = None;
        shared.ready_since = None;
        self.inner.set_status(&mut shared, SupervisorStatus::Idle);
    }
}

impl Inner {
    fn set_status(&self, shared: &mut Shared, status: SupervisorStatus) {
        if shared.status == status {
            return;
        }
        debug!("Node supervisor {} -> {}", shared.status, status);
        shared.status = status;
        self.status_tx.send_replace(status);
        let _ = self.events.send(SupervisorEvent::StatusChanged(status));
    }

    async fn start_once(self: &Arc<Self>) -> Result<ProcessHandle, SupervisorError> {
        let _serial = self.start_lock.lock().await;

        {
            let mut shared = self.shared.lock();
            if shared.intentional_stop {
                return Err(SupervisorError::Stopped);
            }
            if shared.status == SupervisorStatus::Ready {
                if let Some(child) = &shared.child {
                    return Ok(ProcessHandle {
                        pid: child.pid,
                        port: child.port,
                        ready: true,
                    });
                }
            }
            self.set_status(&mut shared, SupervisorStatus::Starting);
        }

        let (generation, port, pid) = match self.spawn_child() {
            Ok(spawned) => spawned,
            Err(e) => {
                let mut shared = self.shared.lock();
                self.set_status(&mut shared, SupervisorStatus::Idle);
                return Err(e);
            }
        };
        info!(
            "Started {} (pid {:?}) on port {}",
            self.launcher.program(),
            pid,
            port
        );

        let attempts = self.config.health_retries.max(1);
        for attempt in 1..=attempts {
            if let Some(err) = self.startup_interrupted(generation) {
                return Err(err);
            }

            if self.probe.check(port).await {
                let mut shared = self.shared.lock();
                let current = shared.child.as_ref().map(|c| c.generation) == Some(generation);
                if shared.intentional_stop || !current {
                    return Err(SupervisorError::Stopped);
                }
                shared.ready_since = Some(Instant::now());
                self.set_status(&mut shared, SupervisorStatus::Ready);
                info!("Node ready on port {}", port);
                return Ok(ProcessHandle {
                    pid,
                    port,
                    ready: true,
                });
            }

            if attempt < attempts {
                sleep(self.config.health_delay()).await;
            }
        }

        warn!("Node failed health checks after {} attempts", attempts);
        self.kill_generation(generation).await;
        let mut shared = self.shared.lock();
        if !shared.intentional_stop {
            self.set_status(&mut shared, SupervisorStatus::Idle);
        }
        Err(SupervisorError::HealthCheckFailed { attempts })
    }

    /// Spawn and register the child without an await in between
    fn spawn_child(self: &Arc<Self>) -> Result<(u64, u16, Option<u32>), SupervisorError> {
        let port = allocate_free_port().map_err(SupervisorError::PortAllocation)?;
        let child = self
            .launcher
            .spawn(port)
            .map_err(|source| SupervisorError::Spawn {
                program: self.launcher.program(),
                source,
            })?;
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.child = Some(RunningChild {
                generation: shared.generation,
                pid,
                port,
                kill_tx: Some(kill_tx),
                exited_rx: Some(exited_rx),
            });
            shared.generation
        };

        tokio::spawn(self.clone().watch_child(generation, child, kill_rx, exited_tx));
        Ok((generation, port, pid))
    }

    fn startup_interrupted(&self, generation: u64) -> Option<SupervisorError> {
        let shared = self.shared.lock();
        if shared.intentional_stop {
            return Some(SupervisorError::Stopped);
        }
        let alive = shared.child.as_ref().map(|c| c.generation) == Some(generation);
        if !alive {
            return Some(SupervisorError::ExitedDuringStartup {
                code: shared.last_exit_code,
            });
        }
        None
    }

    async fn kill_generation(&self, generation: u64) {
        let (kill_tx, exited_rx) = {
            let mut shared = self.shared.lock();
            match shared.child.as_mut() {
                Some(child) if child.generation == generation => {
                    (child.kill_tx.take(), child.exited_rx.take())
                }
                _ => return,
            }
        };
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if let Some(exited_rx) = exited_rx {
            let _ = timeout(self.config.stop_timeout(), exited_rx).await;
        }
    }

    async fn watch_child(
        self: Arc<Self>,
        generation: u64,
        mut child: Box<dyn SupervisedChild>,
        mut kill_rx: oneshot::Receiver<()>,
        exited_tx: oneshot::Sender<Option<i32>>,
    ) {
        let code = tokio::select! {
            code = child.wait() => code,
            Ok(()) = &mut kill_rx => {
                child.kill().await;
                child.wait().await
            }
        };
        self.handle_exit(generation, code);
        let _ = exited_tx.send(code);
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, code: Option<i32>) {
        let mut shared = self.shared.lock();
        if shared.child.as_ref().map(|c| c.generation) != Some(generation) {
            debug!("Ignoring exit of stale node process (generation {})", generation);
            return;
        }

        let child = shared.child.take();
        let pid = child.as_ref().and_then(|c| c.pid);
        let was_ready = shared.status == SupervisorStatus::Ready;
        let intentional = shared.intentional_stop;
        let ready_for = shared.ready_since.take().map(|t| t.elapsed());
        shared.last_exit_code = code;

        let _ = self.events.send(SupervisorEvent::Exited {
            pid,
            code,
            intentional,
        });

        if intentional {
            info!("Node process exited (code {:?})", code);
            return;
        }
        if !was_ready {
            debug!("Node process exited during startup (code {:?})", code);
            return;
        }

        warn!("Node process crashed (pid {:?}, code {:?})", pid, code);
        self.set_status(&mut shared, SupervisorStatus::CrashDetected);
        if ready_for.is_some_and(|d| d >= self.config.stable_after()) {
            shared.restart_attempts = 0;
        }

        if let Some(previous) = shared.pending_restart.take() {
            previous.abort();
        }
        let inner = self.clone();
        shared.pending_restart = Some(tokio::spawn(async move { inner.restart_loop().await }));
    }

    async fn restart_loop(self: Arc<Self>) {
        loop {
            let attempt = {
                let mut shared = self.shared.lock();
                if shared.intentional_stop {
                    return;
                }
                if shared.restart_attempts >= self.config.max_restarts {
                    self.give_up(&mut shared);
                    return;
                }
                shared.restart_attempts += 1;
                self.set_status(&mut shared, SupervisorStatus::Restarting);
                shared.restart_attempts
            };

            let delay = self.config.restart_delay();
            let _ = self
                .events
                .send(SupervisorEvent::RestartScheduled { attempt, delay });
            info!(
                "Restarting node in {:?} (attempt {}/{})",
                delay, attempt, self.config.max_restarts
            );
            sleep(delay).await;

            if self.shared.lock().intentional_stop {
                return;
            }
            match self.start_once().await {
                Ok(handle) => {
                    info!("Node recovered on port {}", handle.port);
                    return;
                }
                Err(SupervisorError::Stopped) => return,
                Err(e) => warn!("Node restart attempt {} failed: {}", attempt, e),
            }
        }
    }

    fn give_up(&self, shared: &mut Shared) {
        self.set_status(shared, SupervisorStatus::Failed);
        if shared.fatal_emitted {
            return;
        }
        shared.fatal_emitted = true;
        let message = format!(
            "node process keeps crashing, gave up after {} restarts",
            shared.restart_attempts
        );
        error!("{}", message);
        let _ = self.events.send(SupervisorEvent::Fatal {
            restarts: shared.restart_attempts,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeChild {
        pid: u32,
        exit_rx: Option<oneshot::Receiver<i32>>,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SupervisedChild for FakeChild {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        async fn wait(&mut self) -> Option<i32> {
            if self.killed.load(Ordering::SeqCst) {
                return None;
            }
            match self.exit_rx.as_mut() {
                Some(rx) => rx.await.ok(),
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        spawns: AtomicU32,
        exits: Mutex<Vec<oneshot::Sender<i32>>>,
        killed: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeLauncher {
        /// Make the most recent child exit with `code`
        fn crash_latest(&self, code: i32) {
            if let Some(tx) = self.exits.lock().pop() {
                let _ = tx.send(code);
            }
        }

        fn killed_count(&self) -> usize {
            self.killed
                .lock()
                .iter()
                .filter(|k| k.load(Ordering::SeqCst))
                .count()
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn program(&self) -> String {
            "fake-node".to_string()
        }

        fn spawn(&self, _port: u16) -> io::Result<Box<dyn SupervisedChild>> {
            let n = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = oneshot::channel();
            let killed = Arc::new(AtomicBool::new(false));
            self.exits.lock().push(tx);
            self.killed.lock().push(killed.clone());
            Ok(Box::new(FakeChild {
                pid: 1000 + n,
                exit_rx: Some(rx),
                killed,
            }))
        }
    }

    struct FakeProbe {
        healthy: AtomicBool,
        checks: AtomicU32,
    }

    impl FakeProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                checks: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn check(&self, _port: u16) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn config() -> NodeConfig {
        NodeConfig {
            program: Some(PathBuf::from("fake-node")),
            health_retries: 3,
            health_delay_ms: 100,
            max_restarts: 5,
            restart_delay_ms: 2_000,
            ..Default::default()
        }
    }

    fn supervisor(launcher: &Arc<FakeLauncher>, probe: &Arc<FakeProbe>) -> ProcessSupervisor {
        ProcessSupervisor::new(config(), launcher.clone(), probe.clone())
    }

    fn drain(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_ready() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = FakeProbe::new(true);
        let sup = supervisor(&launcher, &probe);

        let handle = tokio_test::assert_ok!(sup.start().await);
        assert!(handle.ready);
        assert_eq!(handle.pid, Some(1001));
        assert!(handle.port > 0);
        assert_eq!(sup.status(), SupervisorStatus::Ready);
        assert_eq!(sup.handle(), Some(handle));

        // Already ready: no second spawn
        sup.start().await.unwrap();
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_failure_kills_child() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = FakeProbe::new(false);
        let sup = supervisor(&launcher, &probe);

        let err = tokio_test::assert_err!(sup.start().await);
        assert!(matches!(err, SupervisorError::HealthCheckFailed { attempts: 3 }));
        assert_eq!(probe.checks.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.killed_count(), 1);
        assert_eq!(sup.status(), SupervisorStatus::Idle);

        // Startup failures are not crashes
        sleep(Duration::from_secs(30)).await;
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_restart() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = FakeProbe::new(true);
        let sup = supervisor(&launcher, &probe);
        let mut events = sup.subscribe();

        sup.start().await.unwrap();
        sup.stop().await;
        assert_eq!(sup.status(), SupervisorStatus::Idle);
        assert!(sup.handle().is_none());

        sleep(Duration::from_secs(30)).await;
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);
        assert!(drain(&mut events).contains(&SupervisorEvent::Exited {
            pid: Some(1001),
            code: None,
            intentional: true,
        }));

        // Idempotent
        sup.stop().await;
        assert_eq!(sup.status(), SupervisorStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_is_restarted() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = FakeProbe::new(true);
        let sup = supervisor(&launcher, &probe);

        sup.start().await.unwrap();
        launcher.crash_latest(1);
        sleep(Duration::from_secs(3)).await;

        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(sup.status(), SupervisorStatus::Ready);
        assert_eq!(sup.restart_attempts(), 1);
        assert_eq!(sup.handle().unwrap().pid, Some(1002));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restart() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = FakeProbe::new(true);
        let sup = supervisor(&launcher, &probe);

        sup.start().await.unwrap();
        launcher.crash_latest(1);
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(sup.status(), SupervisorStatus::Restarting);

        sup.stop().await;
        sleep(Duration::from_secs(30)).await;

        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(sup.status(), SupervisorStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_single_fatal_event() {
        let launcher = Arc::new(FakeLauncher::default());
        let probe = FakeProbe::new(true);
        let sup = supervisor(&launcher, &probe);
        let mut events = sup.subscribe();

        sup.start().await.unwrap();
        probe.healthy.store(false, Ordering::SeqCst);
        launcher.crash_latest(1);

        sleep(Duration::from_secs(120)).await;

        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1 + 5);
        assert_eq!(sup.status(), SupervisorStatus::Failed);
        let fatal: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SupervisorEvent::Fatal { .. }))
            .collect();
        assert_eq!(fatal.len(), 1);
        assert!(matches!(fatal[0], SupervisorEvent::Fatal { restarts: 5, .. }));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 6);

        // Explicit start resets the budget
        probe.healthy.store(true, Ordering::SeqCst);
        sup.start().await.unwrap();
        assert_eq!(sup.status(), SupervisorStatus::Ready);
        assert_eq!(sup.restart_attempts(), 0);
    }

    #[tokio::test]
    async fn test_http_health_probe_requires_ok_status() {
        use httpmock::prelude::*;

        let ready = MockServer::start_async().await;
        ready
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).json_body(serde_json::json!({"status": "ok"}));
            })
            .await;
        let booting = MockServer::start_async().await;
        booting
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).json_body(serde_json::json!({"status": "starting"}));
            })
            .await;

        let probe = HttpHealthProbe::new(Duration::from_secs(2));
        assert!(probe.check(ready.port()).await);
        assert!(!probe.check(booting.port()).await);
    }

    #[test]
    fn test_command_launcher_from_config() {
        assert!(CommandLauncher::from_config(&NodeConfig::default()).is_none());
        let launcher = CommandLauncher::from_config(&config()).unwrap();
        assert_eq!(launcher.program(), "fake-node");
        assert!(matches!(
            ProcessSupervisor::from_config(&NodeConfig::default()),
            Err(SupervisorError::NotConfigured)
        ));
    }
}
