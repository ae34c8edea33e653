//! Per-run execution state: status, steps, captured output.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::events::{EventBus, SkillEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Debug,
    Info,
}

impl LogLevel {
    /// Guess a level from the text of an output line.
    #[must_use]
    pub fn detect(content: &str) -> Option<Self> {
        let lower = content.to_lowercase();
        if lower.contains("error") || lower.contains('✗') {
            Some(Self::Error)
        } else if lower.contains("warn") {
            Some(Self::Warn)
        } else if lower.contains("debug") {
            Some(Self::Debug)
        } else if lower.contains("info") || lower.contains('✓') {
            Some(Self::Info)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// 1-based position in the execution's output log.
    pub line_number: usize,
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    fn new(message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            message: message.into(),
            code,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// 0-based index into the execution's step list.
    pub index: usize,
    pub name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub output: Vec<OutputLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionStep {
    fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some(millis_between(self.started_at, now));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: String,
    pub script_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    pub steps: Vec<ExecutionStep>,
    pub output: Vec<OutputLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// 0 to 100.
    pub progress: f64,
    pub metadata: BTreeMap<String, Value>,
    #[serde(skip)]
    sequence: u64,
}

impl ExecutionState {
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

/// Shared registry of execution states. All methods take `&self`; unknown
/// execution ids are ignored by mutators.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    executions: Mutex<HashMap<String, ExecutionState>>,
    counter: AtomicU64,
    events: EventBus,
}

impl ExecutionTracker {
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            events,
        }
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn start_execution(
        &self,
        script_name: &str,
        command: &str,
        args: &[String],
        metadata: BTreeMap<String, Value>,
    ) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let execution_id = format!("exec-{sequence}-{}", Utc::now().timestamp_millis());
        let state = ExecutionState {
            execution_id: execution_id.clone(),
            script_name: script_name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            current_step: None,
            steps: Vec::new(),
            output: Vec::new(),
            exit_code: None,
            error: None,
            progress: 0.0,
            metadata,
            sequence,
        };
        self.executions.lock().insert(execution_id.clone(), state);
        debug!(execution = %execution_id, script = script_name, "execution started");
        self.events.emit(SkillEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            script_name: script_name.to_string(),
        });
        execution_id
    }

    /// Terminal statuses stamp the end time and pin progress at 100.
    pub fn update_status(&self, execution_id: &str, status: ExecutionStatus) {
        {
            let mut executions = self.executions.lock();
            let Some(state) = executions.get_mut(execution_id) else {
                return;
            };
            state.status = status;
            if status.is_terminal() {
                let now = Utc::now();
                state.finished_at = Some(now);
                state.duration_ms = Some(millis_between(state.started_at, now));
                state.progress = 100.0;
            }
        }
        self.events.emit(SkillEvent::ExecutionStatusChanged {
            execution_id: execution_id.to_string(),
            status,
        });
    }

    pub fn add_output(&self, execution_id: &str, stream: OutputStream, content: &str) {
        let line = {
            let mut executions = self.executions.lock();
            let Some(state) = executions.get_mut(execution_id) else {
                return;
            };
            let line = OutputLine {
                line_number: state.output.len() + 1,
                timestamp: Utc::now(),
                stream,
                content: content.to_string(),
                level: LogLevel::detect(content),
            };
            state.output.push(line.clone());
            if let Some(step) = state.current_step.and_then(|i| state.steps.get_mut(i)) {
                step.output.push(line.clone());
            }
            line
        };
        self.events.emit(SkillEvent::ExecutionOutput {
            execution_id: execution_id.to_string(),
            line,
        });
    }

    /// Add every non-blank line of `text`.
    pub fn add_output_lines(&self, execution_id: &str, stream: OutputStream, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.add_output(execution_id, stream, line);
        }
    }

    /// Record the error and mark the execution failed.
    pub fn set_error(&self, execution_id: &str, message: &str, code: Option<String>) {
        let error = ExecutionError::new(message, code);
        {
            let mut executions = self.executions.lock();
            let Some(state) = executions.get_mut(execution_id) else {
                return;
            };
            state.error = Some(error.clone());
            state.status = ExecutionStatus::Failed;
        }
        self.events.emit(SkillEvent::ExecutionErrored {
            execution_id: execution_id.to_string(),
            error,
        });
    }

    /// Zero completes the execution, anything else fails it.
    pub fn set_exit_code(&self, execution_id: &str, exit_code: i32) {
        {
            let mut executions = self.executions.lock();
            let Some(state) = executions.get_mut(execution_id) else {
                return;
            };
            state.exit_code = Some(exit_code);
        }
        let status = if exit_code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.update_status(execution_id, status);
    }

    pub fn update_progress(&self, execution_id: &str, progress: f64) {
        let progress = progress.clamp(0.0, 100.0);
        {
            let mut executions = self.executions.lock();
            let Some(state) = executions.get_mut(execution_id) else {
                return;
            };
            state.progress = progress;
        }
        self.events.emit(SkillEvent::ExecutionProgress {
            execution_id: execution_id.to_string(),
            progress,
        });
    }

    /// Open a new step and make it current. Returns its index.
    pub fn start_step(&self, execution_id: &str, name: &str) -> Option<usize> {
        let step = {
            let mut executions = self.executions.lock();
            let state = executions.get_mut(execution_id)?;
            let index = state.steps.len();
            let step = ExecutionStep {
                index,
                name: name.to_string(),
                status: ExecutionStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                duration_ms: None,
                output: Vec::new(),
                error: None,
            };
            state.steps.push(step.clone());
            state.current_step = Some(index);
            state.status = ExecutionStatus::Running;
            step
        };
        debug!(execution = execution_id, step = name, "step started");
        let index = step.index;
        self.events.emit(SkillEvent::StepStarted {
            execution_id: execution_id.to_string(),
            step,
        });
        Some(index)
    }

    /// Close a step and recompute progress from the completed share.
    pub fn complete_step(&self, execution_id: &str, index: usize, success: bool) {
        let (step, progress) = {
            let mut executions = self.executions.lock();
            let Some(state) = executions.get_mut(execution_id) else {
                return;
            };
            let Some(step) = state.steps.get_mut(index) else {
                return;
            };
            step.finish(if success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            });
            let step = step.clone();
            let done = state
                .steps
                .iter()
                .filter(|s| s.status == ExecutionStatus::Completed)
                .count();
            #[allow(clippy::cast_precision_loss)]
            let progress = done as f64 / state.steps.len() as f64 * 100.0;
            (step, progress)
        };
        self.events.emit(SkillEvent::StepCompleted {
            execution_id: execution_id.to_string(),
            step,
        });
        self.update_progress(execution_id, progress);
    }

    pub fn fail_step(&self, execution_id: &str, index: usize, message: &str) {
        let step = {
            let mut executions = self.executions.lock();
            let Some(step) = executions
                .get_mut(execution_id)
                .and_then(|state| state.steps.get_mut(index))
            else {
                return;
            };
            step.finish(ExecutionStatus::Failed);
            step.error = Some(ExecutionError::new(message, None));
            step.clone()
        };
        debug!(execution = execution_id, step = %step.name, error = message, "step failed");
        self.events.emit(SkillEvent::StepFailed {
            execution_id: execution_id.to_string(),
            step,
        });
    }

    pub fn set_metadata(&self, execution_id: &str, key: &str, value: Value) {
        if let Some(state) = self.executions.lock().get_mut(execution_id) {
            state.metadata.insert(key.to_string(), value);
        }
    }

    #[must_use]
    pub fn execution(&self, execution_id: &str) -> Option<ExecutionState> {
        self.executions.lock().get(execution_id).cloned()
    }

    #[must_use]
    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.executions.lock().get(execution_id).map(|s| s.status)
    }

    /// Every execution, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<ExecutionState> {
        self.filtered(|_| true)
    }

    #[must_use]
    pub fn active(&self) -> Vec<ExecutionState> {
        self.filtered(|s| s.status.is_active())
    }

    #[must_use]
    pub fn completed(&self) -> Vec<ExecutionState> {
        self.filtered(|s| s.status == ExecutionStatus::Completed)
    }

    #[must_use]
    pub fn failed(&self) -> Vec<ExecutionState> {
        self.filtered(|s| s.status == ExecutionStatus::Failed)
    }

    fn filtered(&self, keep: impl Fn(&ExecutionState) -> bool) -> Vec<ExecutionState> {
        let mut states: Vec<ExecutionState> = self
            .executions
            .lock()
            .values()
            .filter(|s| keep(s))
            .cloned()
            .collect();
        states.sort_by_key(|s| s.sequence);
        states
    }

    pub fn clear_history(&self) {
        self.executions.lock().clear();
    }

    pub fn delete(&self, execution_id: &str) -> bool {
        self.executions.lock().remove(execution_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.executions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn output(&self, execution_id: &str) -> Vec<OutputLine> {
        self.executions
            .lock()
            .get(execution_id)
            .map(|s| s.output.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stdout(&self, execution_id: &str) -> String {
        self.stream(execution_id, OutputStream::Stdout)
    }

    #[must_use]
    pub fn stderr(&self, execution_id: &str) -> String {
        self.stream(execution_id, OutputStream::Stderr)
    }

    fn stream(&self, execution_id: &str, stream: OutputStream) -> String {
        self.executions.lock().get(execution_id).map_or_else(String::new, |state| {
            state
                .output
                .iter()
                .filter(|line| line.stream == stream)
                .map(|line| line.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    /// Human-readable multi-line report.
    #[must_use]
    pub fn summary(&self, execution_id: &str) -> String {
        let Some(state) = self.execution(execution_id) else {
            return "Execution not found".to_string();
        };
        let mut out = format!(
            "Execution: {}\nStatus: {}\nDuration: {}ms\nProgress: {:.0}%",
            state.script_name,
            state.status,
            state.duration_ms.unwrap_or(0),
            state.progress
        );
        if let Some(code) = state.exit_code {
            let _ = write!(out, "\nExit Code: {code}");
        }
        if let Some(error) = &state.error {
            let _ = write!(out, "\nError: {}", error.message);
        }
        if !state.steps.is_empty() {
            out.push_str("\n\nSteps:");
            for step in &state.steps {
                let _ = write!(out, "\n  {}. {} - {}", step.index + 1, step.name, step.status);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain_names;

    fn tracker() -> ExecutionTracker {
        ExecutionTracker::new(EventBus::new())
    }

    #[test]
    fn ids_are_sequential_and_listing_is_ordered() {
        let tracker = tracker();
        let first = tracker.start_execution("build", "npm", &[], BTreeMap::new());
        let second = tracker.start_execution("test", "npm", &[], BTreeMap::new());
        assert!(first.starts_with("exec-1-"));
        assert!(second.starts_with("exec-2-"));
        let names: Vec<_> = tracker.all().into_iter().map(|s| s.script_name).collect();
        assert_eq!(names, vec!["build", "test"]);
        assert_eq!(tracker.active().len(), 2);
    }

    #[test]
    fn level_detection() {
        assert_eq!(LogLevel::detect("ERROR: boom"), Some(LogLevel::Error));
        assert_eq!(LogLevel::detect("✗ lint"), Some(LogLevel::Error));
        assert_eq!(LogLevel::detect("Warning: deprecated"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::detect("[debug] x"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::detect("✓ passed"), Some(LogLevel::Info));
        assert_eq!(LogLevel::detect("plain"), None);
    }

    #[test]
    fn output_lines_attach_to_current_step() {
        let tracker = tracker();
        let id = tracker.start_execution("build", "sh", &[], BTreeMap::new());
        tracker.add_output(&id, OutputStream::Stdout, "before steps");
        let step = tracker.start_step(&id, "Executing script").unwrap();
        tracker.add_output_lines(&id, OutputStream::Stdout, "one\n\n  \ntwo\n");
        tracker.add_output(&id, OutputStream::Stderr, "error: bad");

        let state = tracker.execution(&id).unwrap();
        assert_eq!(state.output.len(), 4);
        assert_eq!(state.output[3].line_number, 4);
        assert_eq!(state.steps[step].output.len(), 3);
        assert_eq!(tracker.stdout(&id), "before steps\none\ntwo");
        assert_eq!(tracker.stderr(&id), "error: bad");
    }

    #[test]
    fn steps_drive_progress_and_status() {
        let tracker = tracker();
        let rx = tracker.events().subscribe();
        let id = tracker.start_execution("deploy", "sh", &[], BTreeMap::new());

        let first = tracker.start_step(&id, "Checking permissions").unwrap();
        assert_eq!(tracker.status(&id), Some(ExecutionStatus::Running));
        tracker.complete_step(&id, first, true);
        let second = tracker.start_step(&id, "Executing script").unwrap();
        tracker.fail_step(&id, second, "exit 1");

        let state = tracker.execution(&id).unwrap();
        assert!((state.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(state.steps[1].status, ExecutionStatus::Failed);
        assert_eq!(state.steps[1].error.as_ref().unwrap().message, "exit 1");

        tracker.set_exit_code(&id, 1);
        let state = tracker.execution(&id).unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.finished_at.is_some());
        assert_eq!(tracker.failed().len(), 1);

        assert_eq!(
            drain_names(&rx),
            vec![
                "execution:started",
                "execution:step:started",
                "execution:step:completed",
                "execution:progress",
                "execution:step:started",
                "execution:step:failed",
                "execution:status",
            ]
        );
    }

    #[test]
    fn progress_is_clamped() {
        let tracker = tracker();
        let id = tracker.start_execution("x", "sh", &[], BTreeMap::new());
        tracker.update_progress(&id, 150.0);
        assert!((tracker.execution(&id).unwrap().progress - 100.0).abs() < f64::EPSILON);
        tracker.update_progress(&id, -3.0);
        assert!(tracker.execution(&id).unwrap().progress.abs() < f64::EPSILON);
    }

    #[test]
    fn summary_and_bookkeeping() {
        let tracker = tracker();
        let id = tracker.start_execution("lint", "npm", &["run".to_string()], BTreeMap::new());
        let step = tracker.start_step(&id, "Executing script").unwrap();
        tracker.complete_step(&id, step, true);
        tracker.set_metadata(&id, "checkpoint_id", Value::from("checkpoint-1-0"));
        tracker.set_exit_code(&id, 0);

        let summary = tracker.summary(&id);
        assert!(summary.contains("Execution: lint"));
        assert!(summary.contains("Status: completed"));
        assert!(summary.contains("Exit Code: 0"));
        assert!(summary.contains("1. Executing script - completed"));
        assert_eq!(
            tracker.execution(&id).unwrap().metadata_str("checkpoint_id"),
            Some("checkpoint-1-0")
        );

        assert_eq!(tracker.summary("missing"), "Execution not found");
        assert!(tracker.delete(&id));
        assert!(tracker.is_empty());
    }

    #[test]
    fn set_error_marks_failed() {
        let tracker = tracker();
        let id = tracker.start_execution("x", "sh", &[], BTreeMap::new());
        tracker.set_error(&id, "boom", Some("spawn_failed".to_string()));
        let state = tracker.execution(&id).unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.error.unwrap().code.as_deref(), Some("spawn_failed"));
        tracker.clear_history();
        assert_eq!(tracker.len(), 0);
    }
}
