//! Resource ceilings for a running script.
//!
//! A [`ResourceLimiter`] samples CPU, memory, wall-clock time and process
//! count on a fixed interval. Every sample over a ceiling is recorded as a
//! [`ResourceViolation`] and emitted on the event bus. The enforced variant
//! also fires a kill switch on memory or time violations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EventBus, SkillEvent};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Time,
    Processes,
    FileSize,
}

impl ResourceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Time => "time",
            Self::Processes => "processes",
            Self::FileSize => "file_size",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_cpu_percent: Option<f64>,
    pub max_memory_mb: f64,
    #[serde(with = "humantime_serde")]
    pub max_execution_time: Duration,
    pub max_processes: Option<usize>,
    pub max_file_size_mb: Option<f64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: Some(80.0),
            max_memory_mb: 512.0,
            max_execution_time: Duration::from_secs(30),
            max_processes: Some(5),
            max_file_size_mb: Some(10.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub execution_time_ms: u64,
    pub active_processes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub resource: ResourceKind,
    pub current: f64,
    pub limit: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringResult {
    pub within_limits: bool,
    pub usage: ResourceUsage,
    pub violations: Vec<ResourceViolation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsagePercentages {
    pub cpu: f64,
    pub memory: f64,
    pub time: f64,
}

pub type KillSwitch = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct LimiterState {
    started_at: Option<Instant>,
    active_processes: usize,
    violations: Vec<ResourceViolation>,
    pid: Option<u32>,
    last_cpu_sample: Option<(Instant, u64)>,
}

struct LimiterInner {
    limits: RwLock<ResourceLimits>,
    state: Mutex<LimiterState>,
    events: EventBus,
    enforce: bool,
    kill_switch: Mutex<Option<KillSwitch>>,
    sample_interval: Duration,
}

pub struct ResourceLimiter {
    inner: Arc<LimiterInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLimiter")
            .field("limits", &*self.inner.limits.read())
            .field("enforce", &self.inner.enforce)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ResourceLimiter {
    #[must_use]
    pub fn new(limits: ResourceLimits, events: EventBus) -> Self {
        Self::build(limits, events, false, DEFAULT_SAMPLE_INTERVAL)
    }

    /// Limiter that fires its kill switch on memory or time violations.
    #[must_use]
    pub fn enforced(limits: ResourceLimits, events: EventBus) -> Self {
        Self::build(limits, events, true, DEFAULT_SAMPLE_INTERVAL)
    }

    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        let inner = LimiterInner {
            limits: RwLock::new(*self.inner.limits.read()),
            state: Mutex::new(LimiterState::default()),
            events: self.inner.events.clone(),
            enforce: self.inner.enforce,
            kill_switch: Mutex::new(self.inner.kill_switch.lock().clone()),
            sample_interval: interval.max(Duration::from_millis(10)),
        };
        self.stop();
        self.inner = Arc::new(inner);
        self
    }

    fn build(limits: ResourceLimits, events: EventBus, enforce: bool, interval: Duration) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                limits: RwLock::new(limits),
                state: Mutex::new(LimiterState::default()),
                events,
                enforce,
                kill_switch: Mutex::new(None),
                sample_interval: interval,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn set_kill_switch(&self, kill: impl Fn() + Send + Sync + 'static) {
        *self.inner.kill_switch.lock() = Some(Arc::new(kill));
    }

    #[must_use]
    pub fn is_enforced(&self) -> bool {
        self.inner.enforce
    }

    /// Start the clock and the sampling task. Must be called inside a tokio
    /// runtime. Restarting clears earlier violations.
    pub fn start(&self) {
        self.stop();
        {
            let mut state = self.inner.state.lock();
            state.started_at = Some(Instant::now());
            state.violations.clear();
            state.last_cpu_sample = None;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.sample_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.check_limits();
            }
        });
        *self.task.lock() = Some(handle);
        debug!(interval_ms = self.inner.sample_interval.as_millis(), "resource monitoring started");
    }

    /// Stop sampling. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            debug!("resource monitoring stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Take one sample now and record any violations.
    pub fn check_limits(&self) -> MonitoringResult {
        self.inner.check_limits()
    }

    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        self.inner.usage()
    }

    /// Record a file-size violation when `bytes` is over the ceiling.
    pub fn check_file_size(&self, bytes: u64) -> bool {
        let Some(limit) = self.inner.limits.read().max_file_size_mb else {
            return true;
        };
        let size_mb = bytes_to_mb(bytes);
        if size_mb <= limit {
            return true;
        }
        self.inner.record(vec![violation(
            ResourceKind::FileSize,
            size_mb,
            limit,
            format!("File size ({size_mb:.1}MB) exceeds limit ({limit}MB)"),
        )]);
        false
    }

    /// Sample usage of `pid` instead of reporting zero.
    pub fn attach_process(&self, pid: u32) {
        let mut state = self.inner.state.lock();
        state.pid = Some(pid);
        state.last_cpu_sample = None;
    }

    pub fn detach_process(&self) {
        self.inner.state.lock().pid = None;
    }

    pub fn register_process(&self) {
        self.inner.state.lock().active_processes += 1;
    }

    pub fn unregister_process(&self) {
        let mut state = self.inner.state.lock();
        state.active_processes = state.active_processes.saturating_sub(1);
    }

    #[must_use]
    pub fn violations(&self) -> Vec<ResourceViolation> {
        self.inner.state.lock().violations.clone()
    }

    pub fn clear_violations(&self) {
        self.inner.state.lock().violations.clear();
    }

    pub fn update_limits(&self, update: impl FnOnce(&mut ResourceLimits)) {
        update(&mut self.inner.limits.write());
    }

    #[must_use]
    pub fn limits(&self) -> ResourceLimits {
        *self.inner.limits.read()
    }

    pub fn reset(&self) {
        self.stop();
        let mut state = self.inner.state.lock();
        *state = LimiterState::default();
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.elapsed()
    }

    #[must_use]
    pub fn is_timeout_exceeded(&self) -> bool {
        self.elapsed() > self.inner.limits.read().max_execution_time
    }

    #[must_use]
    pub fn remaining_time(&self) -> Duration {
        self.inner
            .limits
            .read()
            .max_execution_time
            .saturating_sub(self.elapsed())
    }

    #[must_use]
    pub fn usage_percentages(&self) -> UsagePercentages {
        let usage = self.usage();
        let limits = self.limits();
        let ratio = |current: f64, limit: f64| {
            if limit > 0.0 { current / limit * 100.0 } else { 0.0 }
        };
        UsagePercentages {
            cpu: limits
                .max_cpu_percent
                .map_or(0.0, |limit| ratio(usage.cpu_percent, limit)),
            memory: ratio(usage.memory_mb, limits.max_memory_mb),
            time: ratio(
                duration_ms_f64(Duration::from_millis(usage.execution_time_ms)),
                duration_ms_f64(limits.max_execution_time),
            ),
        }
    }
}

impl Drop for ResourceLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LimiterInner {
    fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .started_at
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    fn usage(&self) -> ResourceUsage {
        let mut state = self.state.lock();
        let execution_time = state.started_at.map_or(Duration::ZERO, |s| s.elapsed());
        let (cpu_percent, memory_mb) = match state.pid {
            Some(pid) => {
                let now = Instant::now();
                let ticks = proc_stats::cpu_ticks(pid);
                let cpu = match (ticks, state.last_cpu_sample) {
                    (Some(ticks), Some((at, previous))) => {
                        cpu_percent(ticks.saturating_sub(previous), now.duration_since(at))
                    }
                    (Some(ticks), None) => cpu_percent(ticks, execution_time),
                    (None, _) => 0.0,
                };
                if let Some(ticks) = ticks {
                    state.last_cpu_sample = Some((now, ticks));
                }
                (cpu, proc_stats::resident_mb(pid).unwrap_or(0.0))
            }
            None => (0.0, 0.0),
        };

        ResourceUsage {
            cpu_percent,
            memory_mb,
            execution_time_ms: u64::try_from(execution_time.as_millis()).unwrap_or(u64::MAX),
            active_processes: state.active_processes,
        }
    }

    fn check_limits(&self) -> MonitoringResult {
        let usage = self.usage();
        let limits = *self.limits.read();
        let mut violations = Vec::new();

        if let Some(max_cpu) = limits.max_cpu_percent.filter(|max| usage.cpu_percent > *max) {
            violations.push(violation(
                ResourceKind::Cpu,
                usage.cpu_percent,
                max_cpu,
                format!(
                    "CPU usage ({:.1}%) exceeds limit ({max_cpu}%)",
                    usage.cpu_percent
                ),
            ));
        }

        if usage.memory_mb > limits.max_memory_mb {
            violations.push(violation(
                ResourceKind::Memory,
                usage.memory_mb,
                limits.max_memory_mb,
                format!(
                    "Memory usage ({:.1}MB) exceeds limit ({}MB)",
                    usage.memory_mb, limits.max_memory_mb
                ),
            ));
        }

        let limit_ms = u64::try_from(limits.max_execution_time.as_millis()).unwrap_or(u64::MAX);
        if usage.execution_time_ms > limit_ms {
            violations.push(violation(
                ResourceKind::Time,
                duration_ms_f64(Duration::from_millis(usage.execution_time_ms)),
                duration_ms_f64(limits.max_execution_time),
                format!(
                    "Execution time ({}ms) exceeds limit ({limit_ms}ms)",
                    usage.execution_time_ms
                ),
            ));
        }

        if let Some(max_processes) = limits
            .max_processes
            .filter(|max| usage.active_processes > *max)
        {
            violations.push(violation(
                ResourceKind::Processes,
                usize_f64(usage.active_processes),
                usize_f64(max_processes),
                format!(
                    "Active processes ({}) exceeds limit ({max_processes})",
                    usage.active_processes
                ),
            ));
        }

        self.record(violations.clone());
        if violations.iter().any(|v| v.resource == ResourceKind::Time) {
            self.events.emit(SkillEvent::Timeout {
                elapsed_ms: usage.execution_time_ms,
                limit_ms,
            });
        }

        MonitoringResult {
            within_limits: violations.is_empty(),
            usage,
            violations,
        }
    }

    fn record(&self, violations: Vec<ResourceViolation>) {
        if violations.is_empty() {
            return;
        }
        let fatal = violations
            .iter()
            .any(|v| matches!(v.resource, ResourceKind::Memory | ResourceKind::Time));

        for v in &violations {
            warn!(resource = v.resource.as_str(), current = v.current, limit = v.limit, "{}", v.message);
            self.events.emit(SkillEvent::Violation(v.clone()));
        }
        self.state.lock().violations.extend(violations);

        if self.enforce && fatal {
            let kill = self.kill_switch.lock().clone();
            if let Some(kill) = kill {
                warn!("resource ceiling exceeded, terminating process");
                kill();
            }
        }
    }
}

fn violation(resource: ResourceKind, current: f64, limit: f64, message: String) -> ResourceViolation {
    ResourceViolation {
        resource,
        current,
        limit,
        timestamp: Utc::now(),
        message,
    }
}

#[allow(clippy::cast_precision_loss)]
fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[allow(clippy::cast_precision_loss)]
fn usize_f64(n: usize) -> f64 {
    n as f64
}

fn duration_ms_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn cpu_percent(ticks: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let cpu_secs = ticks as f64 / proc_stats::CLOCK_TICKS_PER_SEC;
    (cpu_secs / secs * 100.0).min(100.0)
}

#[cfg(target_os = "linux")]
mod proc_stats {
    use std::fs;

    pub const CLOCK_TICKS_PER_SEC: f64 = 100.0;

    /// utime + stime of `pid`, in clock ticks.
    pub fn cpu_ticks(pid: u32) -> Option<u64> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_cpu_ticks(&stat)
    }

    pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
        // Field 2 (comm) may contain spaces; everything after the last ')'
        // starts at field 3.
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    pub fn resident_mb(pid: u32) -> Option<f64> {
        let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_resident_mb(&status)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn parse_resident_mb(status: &str) -> Option<f64> {
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb as f64 / 1024.0)
    }
}

#[cfg(not(target_os = "linux"))]
mod proc_stats {
    pub const CLOCK_TICKS_PER_SEC: f64 = 100.0;

    pub const fn cpu_ticks(_pid: u32) -> Option<u64> {
        None
    }

    pub const fn resident_mb(_pid: u32) -> Option<f64> {
        None
    }
}
