//! Constrained subprocess execution.
//!
//! A [`Sandbox`] runs one command at a time inside a validated working
//! directory with a whitelisted environment and a watchdog timeout. Timeouts,
//! explicit termination and destroy all stop the child the same way: SIGTERM
//! first, SIGKILL once the grace window runs out.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SkillError};
use crate::security::path_policy::{absolutize, is_under_any};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);
pub const SAFE_ENV_VARS: [&str; 5] = ["PATH", "HOME", "USER", "LANG", "LC_ALL"];
/// Minimum time left for draining output pipes after the process ends.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);
const GROUP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub working_dir: PathBuf,
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub allow_network: bool,
    pub max_memory_mb: u64,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment plus [`SAFE_ENV_VARS`]. When false the
    /// parent environment is inherited.
    #[serde(default = "default_isolate_env")]
    pub isolate_env: bool,
    #[serde(default = "default_kill_grace", with = "humantime_serde")]
    pub kill_grace: Duration,
}

const fn default_isolate_env() -> bool {
    true
}

const fn default_kill_grace() -> Duration {
    DEFAULT_KILL_GRACE
}

impl SandboxConfig {
    /// Sandbox confined to `working_dir` itself.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        Self {
            allowed_paths: vec![working_dir.clone()],
            working_dir,
            allow_network: false,
            max_memory_mb: 512,
            timeout: None,
            env: BTreeMap::new(),
            isolate_env: true,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.working_dir.as_os_str().is_empty() {
            return Err(SkillError::Sandbox("working_dir is required".to_string()));
        }
        if self.allowed_paths.is_empty() {
            return Err(SkillError::Sandbox(
                "allowed_paths must contain at least one path".to_string(),
            ));
        }
        if self.max_memory_mb == 0 {
            return Err(SkillError::Sandbox(
                "max_memory_mb must be greater than 0".to_string(),
            ));
        }
        let cwd = std::env::current_dir()?;
        let working_dir = absolutize(&self.working_dir, &cwd);
        let allowed: Vec<PathBuf> = self
            .allowed_paths
            .iter()
            .map(|p| absolutize(p, &cwd))
            .collect();
        if !is_under_any(&working_dir, &allowed) {
            return Err(SkillError::Sandbox(
                "working_dir must be within allowed_paths".to_string(),
            ));
        }
        Ok(())
    }
}

pub type SpawnHook = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
    pub input: Option<String>,
    /// Called with the child's pid right after spawn.
    pub on_spawn: Option<SpawnHook>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("env", &self.env)
            .field("input", &self.input.as_ref().map(String::len))
            .field("on_spawn", &self.on_spawn.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    /// -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub timed_out: bool,
    pub terminated: bool,
}

impl SandboxOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.terminated
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Terminated,
}

/// Clears the busy flag when a run ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct Sandbox {
    id: String,
    config: SandboxConfig,
    busy: AtomicBool,
    destroyed: AtomicBool,
    terminate_tx: watch::Sender<bool>,
}

impl Sandbox {
    fn new(id: String, config: SandboxConfig) -> Self {
        let (terminate_tx, _) = watch::channel(false);
        Self {
            id,
            config,
            busy: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            terminate_tx,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Run `command` to completion, timeout or termination.
    pub async fn run(&self, command: &str, args: &[String], options: RunOptions) -> Result<SandboxOutput> {
        if self.is_destroyed() {
            return Err(SkillError::Sandbox("Sandbox has been destroyed".to_string()));
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SkillError::Sandbox(
                "Another process is already running in this sandbox".to_string(),
            ));
        }
        let _busy = BusyGuard(&self.busy);
        self.terminate_tx.send_replace(false);

        let timeout = options
            .timeout
            .or(self.config.timeout)
            .unwrap_or(DEFAULT_TIMEOUT);
        let env = self.build_env(&options.env);
        let program = resolve_program(command, &env, &self.config.working_dir);

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(&self.config.working_dir)
            .stdin(if options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.config.isolate_env {
            cmd.env_clear();
        }
        cmd.envs(&env);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SkillError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();
        info!(sandbox = %self.id, command, pid, timeout_ms = timeout.as_millis(), "process spawned");
        if let (Some(hook), Some(pid)) = (&options.on_spawn, pid) {
            hook(pid);
        }

        let stdout = OutputCollector::spawn(child.stdout.take());
        let stderr = OutputCollector::spawn(child.stderr.take());
        let stdin_writer = match (options.input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let sandbox_id = self.id.clone();
                Some(tokio::spawn(async move {
                    if let Err(err) = stdin.write_all(input.as_bytes()).await {
                        debug!(sandbox = %sandbox_id, error = %err, "stdin closed before input was written");
                    }
                }))
            }
            _ => None,
        };

        let mut terminate_rx = self.terminate_tx.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            () = &mut deadline => Outcome::TimedOut,
            () = termination_requested(&mut terminate_rx) => Outcome::Terminated,
        };
        if let Some(writer) = stdin_writer {
            writer.abort();
        }

        let (status, timed_out, terminated) = match outcome {
            Outcome::Exited(status) => (status, false, false),
            Outcome::TimedOut => {
                warn!(sandbox = %self.id, command, timeout_ms = timeout.as_millis(), "process timed out");
                (stop_child(&mut child, self.config.kill_grace).await?, true, false)
            }
            Outcome::Terminated => {
                info!(sandbox = %self.id, command, "termination requested");
                (stop_child(&mut child, self.config.kill_grace).await?, false, true)
            }
        };
        if let Some(pid) = pid {
            stop_group(pid, self.config.kill_grace).await;
        }

        let drain = timeout.saturating_sub(start.elapsed()).max(OUTPUT_DRAIN);
        let output = SandboxOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout.finish(drain).await?,
            stderr: stderr.finish(drain).await?,
            duration: start.elapsed(),
            timed_out,
            terminated,
        };
        debug!(
            sandbox = %self.id,
            exit_code = output.exit_code,
            duration_ms = output.duration.as_millis(),
            "process finished"
        );
        Ok(output)
    }

    fn build_env(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = if self.config.isolate_env {
            SAFE_ENV_VARS
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| ((*key).to_string(), value)))
                .collect()
        } else {
            BTreeMap::new()
        };
        env.extend(self.config.env.clone());
        env.extend(overrides.clone());
        env
    }

    /// Ask the running command to stop. Returns false when nothing is running.
    pub fn terminate(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.terminate_tx.send_replace(true);
        true
    }

    /// Stop any running command and refuse further runs. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.terminate() {
            let deadline = Instant::now() + self.config.kill_grace + Duration::from_secs(1);
            while self.is_running() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        debug!(sandbox = %self.id, "sandbox destroyed");
    }
}

async fn termination_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM the child's process group, then SIGKILL it after `grace`.
async fn stop_child(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return Ok(child.wait().await?);
    };
    signal_group(pid, Signal::Terminate);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Ok(status?);
    }
    warn!(pid, "process ignored SIGTERM, killing");
    signal_group(pid, Signal::Kill);
    child.start_kill()?;
    Ok(child.wait().await?)
}

/// Stop whatever is left of the group once the leader is gone, so background
/// children cannot outlive the run or hold the output pipes open.
async fn stop_group(pid: u32, grace: Duration) {
    if !group_alive(pid) {
        return;
    }
    debug!(pid, "stopping leftover process group members");
    signal_group(pid, Signal::Terminate);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(GROUP_POLL).await;
        if !group_alive(pid) {
            return;
        }
    }
    warn!(pid, "process group ignored SIGTERM, killing");
    signal_group(pid, Signal::Kill);
}

#[derive(Clone, Copy)]
enum Signal {
    Alive,
    Terminate,
    Kill,
}

/// Children run as group leaders, so the group id equals the child pid.
#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        Signal::Alive => 0,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pid, signal) == 0 }
}

#[cfg(not(unix))]
const fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

fn group_alive(pid: u32) -> bool {
    signal_group(pid, Signal::Alive)
}

fn resolve_program(command: &str, env: &BTreeMap<String, String>, cwd: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return absolutize(path, cwd);
    }
    let search_path: OsString = env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();
    which::which_in(command, Some(search_path), cwd).unwrap_or_else(|_| PathBuf::from(command))
}

/// Reads a child pipe in the background. The buffer is shared so output read
/// so far survives when the pipe never reaches EOF.
struct OutputCollector {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl OutputCollector {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return Ok(());
            };
            let mut chunk = [0_u8; 8192];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock().extend_from_slice(&chunk[..n]);
            }
        });
        Self { buf, handle }
    }

    /// Wait up to `limit` for EOF, then return whatever was read.
    async fn finish(mut self, limit: Duration) -> Result<String> {
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(joined) => joined
                .map_err(|e| SkillError::Sandbox(format!("output reader failed: {e}")))??,
            Err(_) => {
                warn!("output pipe still open after the run, truncating");
                self.handle.abort();
            }
        }
        let bytes = std::mem::take(&mut *self.buf.lock());
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Owns every sandbox it creates until they are removed or destroyed.
#[derive(Debug, Default)]
pub struct SandboxCreator {
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
    counter: AtomicU64,
}

impl SandboxCreator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>> {
        config.validate()?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("sandbox-{n}-{}", chrono::Utc::now().timestamp_millis());
        let sandbox = Arc::new(Sandbox::new(id.clone(), config));
        self.sandboxes.lock().insert(id.clone(), Arc::clone(&sandbox));
        debug!(sandbox = %id, "sandbox created");
        Ok(sandbox)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().remove(id)
    }

    /// Destroy and forget one sandbox. Returns false for unknown ids.
    pub async fn destroy(&self, id: &str) -> bool {
        let Some(sandbox) = self.remove(id) else {
            return false;
        };
        sandbox.destroy().await;
        true
    }

    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<Arc<Sandbox>> = self.sandboxes.lock().drain().map(|(_, s)| s).collect();
        for sandbox in &drained {
            sandbox.destroy().await;
        }
        drained.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sandboxes.lock().len()
    }
}
