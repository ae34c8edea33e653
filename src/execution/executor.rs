//! Script execution pipeline.
//!
//! Every run goes through the same tracked stages: permission check,
//! checkpoint, sandbox creation, resource limits, the run itself and change
//! detection. Whatever happens, the sandbox is destroyed and the limiter is
//! stopped before [`ScriptExecutor::execute`] returns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SkillError};
use crate::events::EventBus;
use crate::execution::rollback::{
    ChangeKind, CheckpointOptions, FileChange, RollbackManager, RollbackResult,
};
use crate::execution::tracker::{ExecutionStatus, ExecutionTracker, OutputStream};
use crate::sandbox::limiter::{DEFAULT_SAMPLE_INTERVAL, ResourceLimiter, ResourceLimits, ResourceViolation};
use crate::sandbox::permissions::{Permission, PermissionChecker};
use crate::sandbox::process::{
    DEFAULT_KILL_GRACE, DEFAULT_TIMEOUT, RunOptions, Sandbox, SandboxConfig, SandboxCreator, SandboxOutput,
};

pub const CHECKPOINT_METADATA_KEY: &str = "checkpoint_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub estimated_duration: Option<Duration>,
}

impl Script {
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            permissions: Vec::new(),
            description: None,
            estimated_duration: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timeout: Option<Duration>,
    /// Run with a whitelisted environment. When false the parent
    /// environment is inherited.
    pub sandbox: bool,
    pub allow_network: bool,
    pub max_memory_mb: u64,
    pub max_cpu_percent: Option<f64>,
    pub max_processes: Option<usize>,
    /// Ceiling for files the run creates or modifies.
    pub max_file_size_mb: Option<u64>,
    pub create_checkpoint: bool,
    pub auto_rollback_on_error: bool,
    /// Terminate the run on memory or time violations.
    pub enforce_limits: bool,
    pub env: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, Value>,
    pub checkpoint: CheckpointOptions,
    pub kill_grace: Duration,
    pub sample_interval: Duration,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            sandbox: true,
            allow_network: false,
            max_memory_mb: 512,
            max_cpu_percent: Some(80.0),
            max_processes: Some(5),
            max_file_size_mb: Some(10),
            create_checkpoint: true,
            auto_rollback_on_error: false,
            enforce_limits: false,
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
            checkpoint: CheckpointOptions::default(),
            kill_grace: DEFAULT_KILL_GRACE,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub script: Script,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub timed_out: bool,
    pub files_modified: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FileChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub resource_violations: Vec<ResourceViolation>,
    pub rolled_back: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-run resources released on every exit path.
#[derive(Default)]
struct RunResources {
    checkpoint_id: Option<String>,
    sandbox: Option<Arc<Sandbox>>,
    limiter: Option<Arc<ResourceLimiter>>,
}

#[derive(Debug)]
pub struct ScriptExecutor {
    permissions: PermissionChecker,
    sandboxes: SandboxCreator,
    rollback: RollbackManager,
    tracker: ExecutionTracker,
    events: EventBus,
    /// execution id -> sandbox of the run in flight
    running: Mutex<HashMap<String, Arc<Sandbox>>>,
    results: Mutex<HashMap<String, ExecutionResult>>,
}

impl ScriptExecutor {
    #[must_use]
    pub fn new(permissions: PermissionChecker, events: EventBus) -> Self {
        Self {
            permissions,
            sandboxes: SandboxCreator::new(),
            rollback: RollbackManager::new(),
            tracker: ExecutionTracker::new(events.clone()),
            events,
            running: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn for_workspace(root: impl AsRef<Path>, events: EventBus) -> Self {
        Self::new(PermissionChecker::for_workspace(root), events)
    }

    #[must_use]
    pub const fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    #[must_use]
    pub const fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    #[must_use]
    pub const fn permission_checker(&self) -> &PermissionChecker {
        &self.permissions
    }

    #[must_use]
    pub const fn sandbox_creator(&self) -> &SandboxCreator {
        &self.sandboxes
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run `script` through the full pipeline.
    ///
    /// A script that runs and exits non-zero, times out or is cancelled is
    /// an `Ok` result with `success == false`. `Err` means the pipeline
    /// itself failed (permission denial, checkpoint or spawn failure); the
    /// execution is marked failed before the error is returned.
    pub async fn execute(&self, script: &Script, options: &ExecutionOptions) -> Result<ExecutionResult> {
        let execution_id = self.tracker.start_execution(
            &script.name,
            &script.command,
            &script.args,
            options.metadata.clone(),
        );
        info!(execution = %execution_id, script = %script.name, command = %script.command, "execution requested");

        let mut resources = RunResources::default();
        let outcome = self
            .run_stages(&execution_id, script, options, &mut resources)
            .await;

        match outcome {
            Ok(mut result) => {
                if !result.success && options.auto_rollback_on_error {
                    result.rolled_back = self.auto_rollback(&execution_id, resources.checkpoint_id.as_deref());
                }
                self.release(&execution_id, &resources).await;
                self.results
                    .lock()
                    .insert(execution_id.clone(), result.clone());
                Ok(result)
            }
            Err(err) => {
                warn!(execution = %execution_id, error = %err, "execution failed");
                self.fail_current_step(&execution_id, &err.to_string());
                self.tracker
                    .set_error(&execution_id, &err.to_string(), Some(err.code().to_string()));
                self.tracker
                    .update_status(&execution_id, ExecutionStatus::Failed);
                if options.auto_rollback_on_error {
                    self.auto_rollback(&execution_id, resources.checkpoint_id.as_deref());
                }
                self.release(&execution_id, &resources).await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        execution_id: &str,
        script: &Script,
        options: &ExecutionOptions,
        resources: &mut RunResources,
    ) -> Result<ExecutionResult> {
        let tracker = &self.tracker;
        let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let step = tracker.start_step(execution_id, "Checking permissions");
        self.check_permissions(&script.permissions)?;
        complete(tracker, execution_id, step, true);

        if options.create_checkpoint {
            let step = tracker.start_step(execution_id, "Creating checkpoint");
            let checkpoint_options = CheckpointOptions {
                description: Some(format!("Before executing {}", script.name)),
                script_name: Some(script.name.clone()),
                ..options.checkpoint.clone()
            };
            let checkpoint = self
                .rollback
                .create_checkpoint(&script.working_dir, checkpoint_options)?;
            tracker.set_metadata(
                execution_id,
                CHECKPOINT_METADATA_KEY,
                Value::from(checkpoint.id.clone()),
            );
            resources.checkpoint_id = Some(checkpoint.id.clone());
            complete(tracker, execution_id, step, true);
        }

        let step = options
            .sandbox
            .then(|| tracker.start_step(execution_id, "Creating sandbox"))
            .flatten();
        let config = SandboxConfig {
            allow_network: options.allow_network,
            max_memory_mb: options.max_memory_mb,
            timeout: Some(timeout),
            isolate_env: options.sandbox,
            kill_grace: options.kill_grace,
            ..SandboxConfig::new(&script.working_dir)
        };
        let sandbox = self.sandboxes.create(config)?;
        resources.sandbox = Some(Arc::clone(&sandbox));
        self.running
            .lock()
            .insert(execution_id.to_string(), Arc::clone(&sandbox));
        complete(tracker, execution_id, step, true);

        let step = tracker.start_step(execution_id, "Setting up resource limits");
        let limits = ResourceLimits {
            max_cpu_percent: options.max_cpu_percent,
            max_memory_mb: u64_f64(options.max_memory_mb),
            max_execution_time: timeout,
            max_processes: options.max_processes,
            max_file_size_mb: options.max_file_size_mb.map(u64_f64),
        };
        let limiter = if options.enforce_limits {
            let limiter = ResourceLimiter::enforced(limits, self.events.clone());
            let target = Arc::clone(&sandbox);
            limiter.set_kill_switch(move || {
                target.terminate();
            });
            limiter
        } else {
            ResourceLimiter::new(limits, self.events.clone())
        };
        let limiter = Arc::new(limiter.with_sample_interval(options.sample_interval));
        limiter.start();
        resources.limiter = Some(Arc::clone(&limiter));
        complete(tracker, execution_id, step, true);

        let step = tracker.start_step(execution_id, "Executing script");
        tracker.update_status(execution_id, ExecutionStatus::Running);
        let attach = Arc::clone(&limiter);
        let run_options = RunOptions {
            timeout: Some(timeout),
            env: options.env.clone(),
            input: None,
            on_spawn: Some(Arc::new(move |pid| {
                attach.attach_process(pid);
                attach.register_process();
            })),
        };
        let output = sandbox
            .run(&script.command, &script.args, run_options)
            .await?;
        limiter.detach_process();
        limiter.unregister_process();
        if output.timed_out {
            limiter.check_limits();
        }
        limiter.stop();
        tracker.add_output_lines(execution_id, OutputStream::Stdout, &output.stdout);
        tracker.add_output_lines(execution_id, OutputStream::Stderr, &output.stderr);
        complete(tracker, execution_id, step, output.success());

        let mut changes = Vec::new();
        if let Some(checkpoint) = resources
            .checkpoint_id
            .as_deref()
            .and_then(|id| self.rollback.checkpoint(id))
        {
            let step = tracker.start_step(execution_id, "Detecting file changes");
            changes = self
                .rollback
                .detect_changes(&checkpoint, &script.working_dir)?;
            for change in changes.iter().filter(|c| c.operation != ChangeKind::Delete) {
                if let Ok(meta) = std::fs::metadata(script.working_dir.join(&change.path)) {
                    limiter.check_file_size(meta.len());
                }
            }
            complete(tracker, execution_id, step, true);
        }

        let (status, error) = self.finish(execution_id, &output, timeout);
        Ok(ExecutionResult {
            execution_id: execution_id.to_string(),
            script: script.clone(),
            status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration: output.duration,
            timed_out: output.timed_out,
            files_modified: changes.iter().map(|c| c.path.clone()).collect(),
            changes,
            checkpoint_id: resources.checkpoint_id.clone(),
            resource_violations: limiter.violations(),
            rolled_back: false,
            success: status == ExecutionStatus::Completed,
            error,
        })
    }

    /// Settle the tracked status from the sandbox outcome.
    fn finish(
        &self,
        execution_id: &str,
        output: &SandboxOutput,
        timeout: Duration,
    ) -> (ExecutionStatus, Option<String>) {
        let tracker = &self.tracker;
        if tracker.status(execution_id) == Some(ExecutionStatus::Cancelled) {
            return (ExecutionStatus::Cancelled, Some("Execution cancelled".to_string()));
        }
        if output.timed_out {
            let message = format!("Script timed out after {}ms", timeout.as_millis());
            tracker.set_error(execution_id, &message, Some("timeout".to_string()));
            tracker.update_status(execution_id, ExecutionStatus::Timeout);
            return (ExecutionStatus::Timeout, Some(message));
        }
        if output.terminated {
            let message = "Script terminated after exceeding resource limits".to_string();
            tracker.set_error(execution_id, &message, Some("terminated".to_string()));
            tracker.update_status(execution_id, ExecutionStatus::Failed);
            return (ExecutionStatus::Failed, Some(message));
        }
        tracker.set_exit_code(execution_id, output.exit_code);
        if output.exit_code == 0 {
            info!(execution = execution_id, duration_ms = output.duration.as_millis(), "execution completed");
            (ExecutionStatus::Completed, None)
        } else {
            let message = format!("Script exited with code {}", output.exit_code);
            tracker.set_error(execution_id, &message, Some(output.exit_code.to_string()));
            tracker.update_status(execution_id, ExecutionStatus::Failed);
            (ExecutionStatus::Failed, Some(message))
        }
    }

    /// Fail with every blocking denial listed, not only the first.
    fn check_permissions(&self, permissions: &[Permission]) -> Result<()> {
        let mut blocking = Vec::new();
        for result in self.permissions.denied(permissions) {
            if result.permission.required {
                blocking.push(result);
            } else {
                warn!(
                    kind = %result.permission.kind,
                    scope = %result.permission.scope,
                    reason = result.denial_reason.as_deref().unwrap_or_default(),
                    "optional permission denied"
                );
            }
        }
        if blocking.is_empty() {
            return Ok(());
        }
        let listed = blocking
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.permission.kind,
                    r.denial_reason.as_deref().unwrap_or("denied")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Err(SkillError::PermissionDenied(format!("Permission denied:\n{listed}")))
    }

    fn fail_current_step(&self, execution_id: &str, message: &str) {
        let Some(state) = self.tracker.execution(execution_id) else {
            return;
        };
        if let Some(index) = state
            .current_step
            .filter(|i| state.steps.get(*i).is_some_and(|s| s.status == ExecutionStatus::Running))
        {
            self.tracker.fail_step(execution_id, index, message);
        }
    }

    /// Roll back to the run's checkpoint. Failures are logged, never raised.
    fn auto_rollback(&self, execution_id: &str, checkpoint_id: Option<&str>) -> bool {
        let Some(checkpoint_id) = checkpoint_id else {
            return false;
        };
        match self.rollback.rollback(checkpoint_id) {
            Ok(result) if result.success => {
                info!(execution = execution_id, checkpoint = checkpoint_id, "automatic rollback applied");
                true
            }
            Ok(result) => {
                for failure in &result.errors {
                    error!(
                        execution = execution_id,
                        path = %failure.path.display(),
                        "rollback failed: {}",
                        failure.message
                    );
                }
                false
            }
            Err(err) => {
                error!(execution = execution_id, error = %err, "rollback failed");
                false
            }
        }
    }

    async fn release(&self, execution_id: &str, resources: &RunResources) {
        self.running.lock().remove(execution_id);
        if let Some(limiter) = &resources.limiter {
            limiter.stop();
        }
        if let Some(sandbox) = &resources.sandbox {
            self.sandboxes.destroy(sandbox.id()).await;
        }
        debug!(execution = execution_id, "run resources released");
    }

    /// Mark a running execution cancelled and stop its process.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let status = self
            .tracker
            .status(execution_id)
            .ok_or_else(|| SkillError::NotFound(format!("Execution {execution_id} not found")))?;
        if status != ExecutionStatus::Running {
            return Err(SkillError::InvalidState(format!(
                "Execution {execution_id} is not running"
            )));
        }
        self.tracker
            .update_status(execution_id, ExecutionStatus::Cancelled);
        let sandbox = self.running.lock().get(execution_id).cloned();
        if let Some(sandbox) = sandbox {
            sandbox.terminate();
        }
        info!(execution = execution_id, "execution cancelled");
        Ok(())
    }

    pub fn rollback(&self, execution_id: &str) -> Result<RollbackResult> {
        let checkpoint_id = self.checkpoint_for(execution_id)?;
        self.rollback.rollback(&checkpoint_id)
    }

    pub fn preview_rollback(&self, execution_id: &str) -> Result<Vec<FileChange>> {
        let checkpoint_id = self.checkpoint_for(execution_id)?;
        self.rollback.preview_rollback(&checkpoint_id)
    }

    fn checkpoint_for(&self, execution_id: &str) -> Result<String> {
        let state = self
            .tracker
            .execution(execution_id)
            .ok_or_else(|| SkillError::NotFound(format!("Execution {execution_id} not found")))?;
        state
            .metadata_str(CHECKPOINT_METADATA_KEY)
            .map(ToString::to_string)
            .ok_or_else(|| {
                SkillError::NotFound(format!("No checkpoint found for execution {execution_id}"))
            })
    }

    #[must_use]
    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.tracker.status(execution_id)
    }

    /// Result of a finished run. Runs that failed before producing output
    /// are rebuilt from the tracked state.
    #[must_use]
    pub fn result(&self, execution_id: &str) -> Option<ExecutionResult> {
        if let Some(result) = self.results.lock().get(execution_id) {
            return Some(result.clone());
        }
        let state = self.tracker.execution(execution_id)?;
        Some(ExecutionResult {
            execution_id: state.execution_id.clone(),
            script: Script::new(&state.script_name, &state.command, PathBuf::new()).with_args(state.args.clone()),
            status: state.status,
            exit_code: state.exit_code.unwrap_or(-1),
            stdout: self.tracker.stdout(execution_id),
            stderr: self.tracker.stderr(execution_id),
            duration: Duration::from_millis(state.duration_ms.unwrap_or(0)),
            timed_out: state.status == ExecutionStatus::Timeout,
            files_modified: Vec::new(),
            changes: Vec::new(),
            checkpoint_id: state.metadata_str(CHECKPOINT_METADATA_KEY).map(ToString::to_string),
            resource_violations: Vec::new(),
            rolled_back: false,
            success: state.status == ExecutionStatus::Completed,
            error: state.error.map(|e| e.message),
        })
    }

    /// Forget finished executions and their cached results. Runs still in
    /// flight are kept. Returns how many executions were dropped.
    pub fn clear_history(&self) -> usize {
        let running: HashSet<String> = self.running.lock().keys().cloned().collect();
        let mut dropped = 0;
        for state in self.tracker.all() {
            if !running.contains(&state.execution_id) && self.tracker.delete(&state.execution_id) {
                dropped += 1;
            }
        }
        self.results.lock().retain(|id, _| running.contains(id));
        debug!(dropped, kept = running.len(), "execution history cleared");
        dropped
    }

    /// Forget one finished execution. False when unknown or still running.
    pub fn forget(&self, execution_id: &str) -> bool {
        if self.running.lock().contains_key(execution_id) {
            return false;
        }
        let cached = self.results.lock().remove(execution_id).is_some();
        self.tracker.delete(execution_id) || cached
    }

    /// Destroy every sandbox still owned by this executor.
    pub async fn shutdown(&self) -> usize {
        self.running.lock().clear();
        self.sandboxes.destroy_all().await
    }
}

fn complete(tracker: &ExecutionTracker, execution_id: &str, step: Option<usize>, success: bool) {
    if let Some(step) = step {
        tracker.complete_step(execution_id, step, success);
    }
}

#[allow(clippy::cast_precision_loss)]
fn u64_f64(n: u64) -> f64 {
    n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::permissions::PermissionKind;

    #[test]
    fn denials_are_listed_together() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptExecutor::for_workspace(dir.path(), EventBus::new());
        let permissions = vec![
            Permission::new(PermissionKind::SystemExec, "rm -rf /", "cleanup"),
            Permission::new(PermissionKind::NetworkHttps, "https://example.com", "fetch"),
            Permission::new(PermissionKind::SystemEnv, "HOME", "read home").optional(),
        ];
        let err = executor.check_permissions(&permissions).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Permission denied:\n"));
        assert!(message.contains("system:exec: "));
        assert!(message.contains("network:https: "));
        assert!(!message.contains("system:env"));
    }

    #[test]
    fn rollback_requires_known_execution_with_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptExecutor::for_workspace(dir.path(), EventBus::new());
        assert_eq!(executor.rollback("exec-0-0").unwrap_err().code(), "not_found");

        let id = executor
            .tracker()
            .start_execution("x", "true", &[], BTreeMap::new());
        let err = executor.preview_rollback(&id).unwrap_err();
        assert!(err.to_string().contains("No checkpoint found"));
    }

    #[test]
    fn cancel_rejects_idle_executions() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptExecutor::for_workspace(dir.path(), EventBus::new());
        let id = executor
            .tracker()
            .start_execution("x", "true", &[], BTreeMap::new());
        assert_eq!(executor.cancel(&id).unwrap_err().code(), "invalid_state");
        assert_eq!(executor.cancel("nope").unwrap_err().code(), "not_found");
    }

    #[test]
    fn result_falls_back_to_tracked_state() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptExecutor::for_workspace(dir.path(), EventBus::new());
        let id = executor
            .tracker()
            .start_execution("x", "true", &[], BTreeMap::new());
        executor.tracker().set_error(&id, "boom", None);
        let result = executor.result(&id).unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn clearing_history_drops_cached_results() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptExecutor::for_workspace(dir.path(), EventBus::new());
        let options = ExecutionOptions {
            create_checkpoint: false,
            ..ExecutionOptions::default()
        };
        let first = executor
            .execute(&Script::new("first", "true", dir.path()), &options)
            .await
            .unwrap();
        let second = executor
            .execute(&Script::new("second", "true", dir.path()), &options)
            .await
            .unwrap();
        assert!(executor.result(&first.execution_id).is_some());

        assert!(executor.forget(&first.execution_id));
        assert!(executor.result(&first.execution_id).is_none());
        assert!(!executor.forget(&first.execution_id));

        assert_eq!(executor.clear_history(), 1);
        assert!(executor.result(&second.execution_id).is_none());
        assert!(executor.results.lock().is_empty());
        assert_eq!(executor.tracker().len(), 0);
    }
}
