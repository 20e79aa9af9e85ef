//! Docker CLI client for the crawler sidecar
//!
//! Talks to Docker through the `docker` executable rather than the daemon
//! socket so it works the same with Docker Desktop, colima and native
//! engines. The executable is located once per client:
//!
//! 1. Configured extra directories
//! 2. Every `PATH` entry
//! 3. Well-known install directories for the current platform
//!
//! Each candidate is validated with `docker --version` and the first one
//! that answers is cached.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SidecarConfig;

/// Default deadline for non-streaming docker commands
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker executable not found (searched {} locations)", .searched.len())]
    NotFound { searched: Vec<PathBuf> },
    #[error("Docker is not installed")]
    NotInstalled,
    #[error("Docker daemon is not running: {detail}")]
    NotRunning { detail: String },
    #[error("docker {command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Failed to pull image {image}: {detail}")]
    PullFailed { image: String, detail: String },
    #[error("Container {name} is not running (status: {status})")]
    ContainerNotRunning {
        name: String,
        status: ContainerStatus,
    },
    #[error("Container {name} not healthy after {attempts} attempts")]
    HealthTimeout { name: String, attempts: u32 },
    #[error("Unexpected docker output: {0}")]
    Parse(String),
    #[error("Failed to execute docker: {0}")]
    Io(#[from] io::Error),
}

/// What the embedding shell should ask the user to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    InstallDocker,
    StartDocker,
    Retry,
}

impl DockerError {
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound { .. } | Self::NotInstalled => Remediation::InstallDocker,
            Self::NotRunning { .. } => Remediation::StartDocker,
            _ => Remediation::Retry,
        }
    }

    /// Docker itself is unusable, as opposed to one command failing
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::NotInstalled | Self::NotRunning { .. }
        )
    }
}

// ============================================================================
// COMMAND EXECUTION
// ============================================================================

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the client and the operating system
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput>;

    /// Run to completion, handing every stdout line to `on_line` as it arrives
    async fn run_streaming(
        &self,
        program: &Path,
        args: &[String],
        on_line: &(dyn for<'l> Fn(&'l str) + Send + Sync),
    ) -> io::Result<CommandOutput>;
}

/// Runs commands with `tokio::process`
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("command timed out after {}s", self.timeout.as_secs()),
                )
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_streaming(
        &self,
        program: &Path,
        args: &[String],
        on_line: &(dyn for<'l> Fn(&'l str) + Send + Sync),
    ) -> io::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;

        let read_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut all = String::new();
            while let Some(line) = lines.next_line().await? {
                on_line(&line);
                all.push_str(&line);
                all.push('\n');
            }
            Ok::<_, io::Error>(all)
        };
        let read_stderr = async {
            let mut all = String::new();
            BufReader::new(stderr).read_to_string(&mut all).await?;
            Ok::<_, io::Error>(all)
        };

        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = child.wait().await?;

        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

// ============================================================================
// BINARY RESOLUTION
// ============================================================================

/// Produces the ordered list of places a docker executable may live
#[derive(Debug, Clone, Default)]
pub struct BinaryLocator {
    pub path_var: Option<OsString>,
    pub home: Option<PathBuf>,
    pub extra_dirs: Vec<PathBuf>,
    /// Skip the well-known platform directories (tests)
    pub skip_platform_dirs: bool,
}

impl BinaryLocator {
    pub fn from_env(extra_dirs: Vec<PathBuf>) -> Self {
        Self {
            path_var: std::env::var_os("PATH"),
            home: dirs::home_dir(),
            extra_dirs,
            skip_platform_dirs: false,
        }
    }

    pub fn executable_name() -> &'static str {
        if cfg!(windows) {
            "docker.exe"
        } else {
            "docker"
        }
    }

    /// Candidate executables, most specific first, without duplicates
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.extra_dirs.clone();
        if let Some(path) = &self.path_var {
            dirs.extend(std::env::split_paths(path).filter(|p| !p.as_os_str().is_empty()));
        }
        if !self.skip_platform_dirs {
            dirs.extend(platform_dirs(self.home.as_deref()));
        }

        let mut seen = Vec::new();
        for dir in dirs {
            let candidate = dir.join(Self::executable_name());
            if !seen.contains(&candidate) {
                seen.push(candidate);
            }
        }
        seen
    }
}

fn platform_dirs(home: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(target_os = "macos") {
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from(
            "/Applications/Docker.app/Contents/Resources/bin",
        ));
        if let Some(home) = home {
            dirs.push(home.join(".docker/bin"));
            dirs.push(home.join(".colima/bin"));
        }
    } else if cfg!(windows) {
        dirs.push(PathBuf::from(r"C:\Program Files\Docker\Docker\resources\bin"));
        dirs.push(PathBuf::from(r"C:\ProgramData\DockerDesktop\version-bin"));
    } else {
        dirs.push(PathBuf::from("/usr/bin"));
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/snap/bin"));
        if let Some(home) = home {
            dirs.push(home.join(".docker/bin"));
        }
    }
    dirs
}

// ============================================================================
// CONTAINER MODEL
// ============================================================================

/// Container state as reported by `docker ps`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerStatus {
    Running,
    Exited,
    Created,
    Paused,
    #[default]
    Unknown,
}

impl ContainerStatus {
    /// Parse either the `State` column or the human `Status` column
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("(paused)") || lower == "paused" {
            Self::Paused
        } else if lower == "running" || lower.starts_with("up") {
            Self::Running
        } else if lower == "exited" || lower.starts_with("exited") {
            Self::Exited
        } else if lower == "created" || lower.starts_with("created") {
            Self::Created
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Created => "created",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one container backing the crawler sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub container_port: u16,
    pub restart_policy: String,
    pub env: BTreeMap<String, String>,
    pub status: ContainerStatus,
}

impl ContainerDescriptor {
    pub fn from_config(config: &SidecarConfig) -> Self {
        Self {
            name: config.container_name.clone(),
            image: config.image.clone(),
            host_port: config.host_port,
            container_port: config.container_port,
            restart_policy: config.restart_policy.clone(),
            env: config.env.clone(),
            status: ContainerStatus::Unknown,
        }
    }

    /// Arguments for `docker run`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-p".to_string(),
            format!("127.0.0.1:{}:{}", self.host_port, self.container_port),
            "--restart".to_string(),
            self.restart_policy.clone(),
        ];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args
    }
}

/// One row of `docker ps --format {{json .}}`
#[derive(Debug, Clone, Deserialize)]
struct PsRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

/// Container details extracted from `docker ps`
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub status_text: String,
}

/// Pick the row whose name matches exactly; `--filter name=` is a regex on
/// some engines and a substring match on others.
fn parse_ps_output(stdout: &str, name: &str) -> Result<Option<ContainerInfo>, DockerError> {
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row: PsRow = serde_json::from_str(line)
            .map_err(|e| DockerError::Parse(format!("{}: {}", e, line)))?;
        let matches = row
            .names
            .split(',')
            .any(|n| n.trim().trim_start_matches('/') == name);
        if !matches {
            continue;
        }
        let status = if row.state.is_empty() {
            ContainerStatus::parse(&row.status)
        } else {
            ContainerStatus::parse(&row.state)
        };
        return Ok(Some(ContainerInfo {
            id: row.id,
            name: name.to_string(),
            image: row.image,
            status,
            status_text: row.status,
        }));
    }
    Ok(None)
}

/// Outcome of `pull_image`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    AlreadyPresent,
    Pulled,
}

/// Outcome of `run_container`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    AlreadyRunning,
    /// An existing stopped container was started again
    Started,
    Created,
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct DockerClient {
    runner: Arc<dyn CommandRunner>,
    locator: BinaryLocator,
    binary: RwLock<Option<PathBuf>>,
}

impl DockerClient {
    pub fn new(runner: Arc<dyn CommandRunner>, locator: BinaryLocator) -> Self {
        Self {
            runner,
            locator,
            binary: RwLock::new(None),
        }
    }

    /// Client backed by real processes and the current environment
    pub fn from_env(extra_dirs: Vec<PathBuf>) -> Self {
        Self::new(
            Arc::new(ProcessRunner::new()),
            BinaryLocator::from_env(extra_dirs),
        )
    }

    /// Find a working docker executable, caching the first success
    pub async fn resolve_binary(&self) -> Result<PathBuf, DockerError> {
        if let Some(path) = self.binary.read().clone() {
            return Ok(path);
        }

        let candidates = self.locator.candidates();
        for candidate in &candidates {
            match self
                .runner
                .run(candidate, &["--version".to_string()])
                .await
            {
                Ok(output) if output.success => {
                    info!(
                        "Using docker at {} ({})",
                        candidate.display(),
                        output.stdout.trim()
                    );
                    *self.binary.write() = Some(candidate.clone());
                    return Ok(candidate.clone());
                }
                Ok(output) => {
                    debug!(
                        "Docker candidate {} rejected: {}",
                        candidate.display(),
                        output.stderr.trim()
                    );
                }
                Err(e) => {
                    debug!("Docker candidate {} unusable: {}", candidate.display(), e);
                }
            }
        }

        Err(DockerError::NotFound {
            searched: candidates,
        })
    }

    /// Distinguish "not installed" from "installed but daemon down"
    pub async fn ensure_availability(&self) -> Result<PathBuf, DockerError> {
        let binary = match self.resolve_binary().await {
            Ok(path) => path,
            Err(DockerError::NotFound { searched }) => {
                warn!(
                    "Docker not found after probing {} locations",
                    searched.len()
                );
                return Err(DockerError::NotInstalled);
            }
            Err(e) => return Err(e),
        };

        // A daemon that is still booting makes `info` hang until the runner times out
        let output = match self.runner.run(&binary, &["info".to_string()]).await {
            Ok(output) => output,
            Err(e) => {
                warn!("docker info did not complete: {}", e);
                return Err(DockerError::NotRunning {
                    detail: e.to_string(),
                });
            }
        };
        if !output.success {
            let detail = first_line(&output.stderr)
                .unwrap_or("docker info failed")
                .to_string();
            return Err(DockerError::NotRunning { detail });
        }

        debug!("Docker daemon reachable");
        Ok(binary)
    }

    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput, DockerError> {
        let binary = self.resolve_binary().await?;
        Ok(self.runner.run(&binary, &args).await?)
    }

    async fn exec_checked(&self, args: Vec<String>) -> Result<CommandOutput, DockerError> {
        let command = args.first().cloned().unwrap_or_default();
        let output = self.exec(args).await?;
        if !output.success {
            return Err(DockerError::CommandFailed {
                command,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        let output = self
            .exec(vec![
                "image".to_string(),
                "inspect".to_string(),
                image.to_string(),
            ])
            .await?;
        Ok(output.success)
    }

    /// Pull an image if not present, streaming progress lines
    pub async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<PullOutcome, DockerError> {
        if self.image_exists(image).await? {
            debug!("Image {} already exists", image);
            return Ok(PullOutcome::AlreadyPresent);
        }

        info!("Pulling image: {}", image);
        let binary = self.resolve_binary().await?;
        let output = self
            .runner
            .run_streaming(
                &binary,
                &["pull".to_string(), image.to_string()],
                progress,
            )
            .await
            .map_err(|e| DockerError::PullFailed {
                image: image.to_string(),
                detail: e.to_string(),
            })?;

        if !output.success {
            return Err(DockerError::PullFailed {
                image: image.to_string(),
                detail: output.stderr.trim().to_string(),
            });
        }

        info!("Image {} pulled successfully", image);
        Ok(PullOutcome::Pulled)
    }

    /// Look up a container by exact name
    pub async fn container_status(&self, name: &str) -> Result<Option<ContainerInfo>, DockerError> {
        let output = self
            .exec_checked(vec![
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("name=^{}$", name),
                "--format".to_string(),
                "{{json .}}".to_string(),
            ])
            .await?;
        parse_ps_output(&output.stdout, name)
    }

    /// Make sure the named container exists and runs, reusing an existing one
    pub async fn run_container(
        &self,
        descriptor: &ContainerDescriptor,
    ) -> Result<RunOutcome, DockerError> {
        match self.container_status(&descriptor.name).await? {
            Some(info) if info.status == ContainerStatus::Running => {
                debug!("Container {} already running", descriptor.name);
                Ok(RunOutcome::AlreadyRunning)
            }
            Some(info) if info.status == ContainerStatus::Paused => {
                self.exec_checked(vec!["unpause".to_string(), descriptor.name.clone()])
                    .await?;
                info!("Unpaused container: {}", descriptor.name);
                Ok(RunOutcome::Started)
            }
            Some(info) => {
                if info.image != descriptor.image {
                    warn!(
                        "Container {} runs image {}, expected {}; starting it anyway",
                        descriptor.name, info.image, descriptor.image
                    );
                }
                self.start_container(&descriptor.name).await?;
                Ok(RunOutcome::Started)
            }
            None => {
                let output = self.exec_checked(descriptor.run_args()).await?;
                info!(
                    "Created container {} ({})",
                    descriptor.name,
                    crate::util::short_id(output.stdout.trim())
                );
                Ok(RunOutcome::Created)
            }
        }
    }

    pub async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        self.exec_checked(vec!["start".to_string(), name.to_string()])
            .await?;
        info!("Started container: {}", name);
        Ok(())
    }

    pub async fn stop_container(&self, name: &str) -> Result<(), DockerError> {
        self.exec_checked(vec!["stop".to_string(), name.to_string()])
            .await?;
        info!("Stopped container: {}", name);
        Ok(())
    }

    pub async fn restart_container(&self, name: &str) -> Result<(), DockerError> {
        self.exec_checked(vec!["restart".to_string(), name.to_string()])
            .await?;
        info!("Restarted container: {}", name);
        Ok(())
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> Result<(), DockerError> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        self.exec_checked(args).await?;
        debug!("Removed container: {}", name);
        Ok(())
    }

    /// Last `tail` lines of container output (stdout and stderr)
    pub async fn logs(&self, name: &str, tail: usize) -> Result<String, DockerError> {
        let output = self
            .exec_checked(vec![
                "logs".to_string(),
                "--tail".to_string(),
                tail.to_string(),
                name.to_string(),
            ])
            .await?;
        let mut logs = output.stdout;
        logs.push_str(&output.stderr);
        Ok(logs)
    }

    /// Poll `check` until it passes, failing fast if the container stops
    pub async fn wait_for_health<F, Fut>(
        &self,
        name: &str,
        mut check: F,
        max_retries: u32,
        delay: Duration,
    ) -> Result<(), DockerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        for attempt in 1..=max_retries {
            let status = self
                .container_status(name)
                .await?
                .map(|info| info.status)
                .unwrap_or(ContainerStatus::Unknown);
            if status != ContainerStatus::Running {
                warn!("Container {} is {} while waiting for health", name, status);
                return Err(DockerError::ContainerNotRunning {
                    name: name.to_string(),
                    status,
                });
            }

            if check().await {
                info!("Container {} healthy after {} attempt(s)", name, attempt);
                return Ok(());
            }

            debug!(
                "Container {} not healthy yet ({}/{})",
                name, attempt, max_retries
            );
            if attempt < max_retries {
                tokio::time::sleep(delay).await;
            }
        }

        Err(DockerError::HealthTimeout {
            name: name.to_string(),
            attempts: max_retries,
        })
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

// ============================================================================
// TEST DOUBLE
// ============================================================================

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory docker engine driven through the `CommandRunner` seam.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    pub const DOCKER_PATH: &str = "/fake/bin/docker";

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub image: String,
        pub status: ContainerStatus,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub installed: bool,
        pub daemon_running: bool,
        pub images: HashSet<String>,
        pub pullable: HashSet<String>,
        pub containers: HashMap<String, FakeContainer>,
        pub calls: Vec<Vec<String>>,
        pub fail_restart: bool,
        /// `start`/`run` leave the container exited (it crashes on boot)
        pub crash_on_start: bool,
        /// `info` never answers and the runner times out
        pub info_hangs: bool,
    }

    #[derive(Default)]
    pub struct FakeDocker {
        pub state: Mutex<FakeState>,
    }

    impl FakeDocker {
        pub fn installed() -> Arc<Self> {
            let fake = Self::default();
            {
                let mut state = fake.state.lock();
                state.installed = true;
                state.daemon_running = true;
            }
            Arc::new(fake)
        }

        pub fn calls_starting_with(&self, verb: &str) -> usize {
            self.state
                .lock()
                .calls
                .iter()
                .filter(|c| c.first().map(String::as_str) == Some(verb))
                .count()
        }

        pub fn locator() -> BinaryLocator {
            BinaryLocator {
                path_var: Some(OsString::from("/nowhere/bin:/fake/bin")),
                home: None,
                extra_dirs: Vec::new(),
                skip_platform_dirs: true,
            }
        }

        fn ok(stdout: impl Into<String>) -> CommandOutput {
            CommandOutput {
                success: true,
                code: Some(0),
                stdout: stdout.into(),
                stderr: String::new(),
            }
        }

        fn fail(stderr: impl Into<String>) -> CommandOutput {
            CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.into(),
            }
        }

        fn handle(&self, args: &[String]) -> CommandOutput {
            let mut state = self.state.lock();
            state.calls.push(args.to_vec());
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["--version"] => Self::ok("Docker version 27.0.3, build 7d4bcd8"),
                ["info"] if state.daemon_running => Self::ok("Server: Docker Engine"),
                ["info"] => Self::fail("Cannot connect to the Docker daemon"),
                _ if !state.daemon_running => Self::fail("Cannot connect to the Docker daemon"),
                ["image", "inspect", image] => {
                    if state.images.contains(*image) {
                        Self::ok("[{}]")
                    } else {
                        Self::fail("No such image")
                    }
                }
                ["ps", "-a", "--filter", filter, "--format", _] => {
                    let name = filter
                        .trim_start_matches("name=^")
                        .trim_end_matches('$');
                    let rows: Vec<String> = state
                        .containers
                        .iter()
                        .filter(|(n, _)| n.as_str() == name)
                        .map(|(n, c)| {
                            serde_json::json!({
                                "ID": "abcdef0123456789",
                                "Image": c.image,
                                "Names": n,
                                "State": c.status.as_str(),
                                "Status": "",
                            })
                            .to_string()
                        })
                        .collect();
                    Self::ok(rows.join("\n"))
                }
                ["run", rest @ ..] => {
                    let name = rest
                        .iter()
                        .position(|a| *a == "--name")
                        .and_then(|i| rest.get(i + 1))
                        .map(|s| s.to_string())
                        .unwrap_or_default();
                    let image = rest.last().map(|s| s.to_string()).unwrap_or_default();
                    if state.containers.contains_key(&name) {
                        return Self::fail("Conflict. The container name is already in use");
                    }
                    if !state.images.contains(&image) {
                        return Self::fail("Unable to find image");
                    }
                    let status = if state.crash_on_start {
                        ContainerStatus::Exited
                    } else {
                        ContainerStatus::Running
                    };
                    state.containers.insert(name, FakeContainer { image, status });
                    Self::ok("0123456789abcdef0123\n")
                }
                ["start", name] | ["unpause", name] => {
                    let crash = state.crash_on_start;
                    match state.containers.get_mut(*name) {
                        Some(c) => {
                            c.status = if crash {
                                ContainerStatus::Exited
                            } else {
                                ContainerStatus::Running
                            };
                            Self::ok(*name)
                        }
                        None => Self::fail("No such container"),
                    }
                }
                ["stop", name] => match state.containers.get_mut(*name) {
                    Some(c) => {
                        c.status = ContainerStatus::Exited;
                        Self::ok(*name)
                    }
                    None => Self::fail("No such container"),
                },
                ["restart", name] => {
                    if state.fail_restart {
                        return Self::fail("image not found");
                    }
                    match state.containers.get_mut(*name) {
                        Some(c) => {
                            c.status = ContainerStatus::Running;
                            Self::ok(*name)
                        }
                        None => Self::fail("No such container"),
                    }
                }
                ["rm", "-f", name] | ["rm", name] => match state.containers.remove(*name) {
                    Some(_) => Self::ok(*name),
                    None => Self::fail("No such container"),
                },
                ["logs", "--tail", _, name] => {
                    if state.containers.contains_key(*name) {
                        CommandOutput {
                            success: true,
                            code: Some(0),
                            stdout: "server started\n".to_string(),
                            stderr: "warning: slow disk\n".to_string(),
                        }
                    } else {
                        Self::fail("No such container")
                    }
                }
                _ => Self::fail(format!("unsupported: {:?}", args)),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for FakeDocker {
        async fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput> {
            if program != Path::new(DOCKER_PATH) || !self.state.lock().installed {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
            }
            if self.state.lock().info_hangs && args.first().map(String::as_str) == Some("info") {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "command timed out after 60s",
                ));
            }
            Ok(self.handle(args))
        }

        async fn run_streaming(
            &self,
            program: &Path,
            args: &[String],
            on_line: &(dyn for<'l> Fn(&'l str) + Send + Sync),
        ) -> io::Result<CommandOutput> {
            if program != Path::new(DOCKER_PATH) || !self.state.lock().installed {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
            }
            let mut state = self.state.lock();
            state.calls.push(args.to_vec());
            match args {
                [verb, image] if verb == "pull" => {
                    if state.pullable.contains(image) {
                        on_line("latest: Pulling from crawler");
                        on_line("Status: Downloaded newer image");
                        state.images.insert(image.clone());
                        Ok(Self::ok("done"))
                    } else {
                        Ok(Self::fail("manifest unknown"))
                    }
                }
                _ => Ok(Self::fail("unsupported streaming command")),
            }
        }
    }
}
