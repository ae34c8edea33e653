//! Event fan-out for lifecycle notifications.
//!
//! Components emit [`SkillEvent`]s on a shared [`EventBus`]. Presentation
//! layers subscribe and receive every event emitted after subscription via a
//! crossbeam channel. Event names returned by [`SkillEvent::name`] are part
//! of the public contract.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::skill::SkillStatus;
use crate::execution::tracker::{ExecutionError, ExecutionStatus, ExecutionStep, OutputLine};
use crate::sandbox::limiter::ResourceViolation;

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: SkillEvent,
}

impl EventEnvelope {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.event.name()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkillEvent {
    // registry
    RegistrySkillAdded {
        name: String,
        version: String,
        status: SkillStatus,
    },
    RegistrySkillUpdated {
        name: String,
        old_version: String,
        new_version: String,
        old_status: SkillStatus,
        new_status: SkillStatus,
    },
    RegistrySkillRemoved {
        name: String,
        version: String,
    },
    RegistryAddFailed {
        name: String,
        reason: String,
    },
    RegistryUpdateFailed {
        name: String,
        reason: String,
    },
    RegistryRemoveFailed {
        name: String,
        reason: String,
    },
    RegistryCleared {
        count: usize,
    },
    RegistryImported {
        count: usize,
    },

    // graph
    GraphSkillAdded {
        name: String,
        dependencies: Vec<String>,
    },
    GraphSkillRemoved {
        name: String,
    },
    GraphCircularDependencies {
        cycles: Vec<Vec<String>>,
    },
    GraphSortFailed {
        reason: String,
        processed: usize,
        total: usize,
    },
    GraphSorted {
        skills: Vec<String>,
    },
    GraphResolutionFailed {
        skill: String,
        missing: Vec<String>,
    },
    GraphCleared,

    // chain
    ChainBuilt {
        skill: String,
        step_count: usize,
        estimated_duration_secs: u64,
    },
    ChainBuildFailed {
        skill: String,
        errors: Vec<String>,
    },

    // activator
    SkillActivated {
        name: String,
        dependency_count: usize,
        warnings: Vec<String>,
    },
    SkillDeactivated {
        name: String,
    },
    ActivationFailed {
        name: String,
        reason: String,
        errors: Vec<String>,
    },
    NoMatches {
        input: String,
    },
    MultipleMatches {
        input: String,
        match_count: usize,
    },
    AlreadyActive {
        name: String,
    },
    NotActive {
        name: String,
    },
    DeactivationBlocked {
        name: String,
        dependents: Vec<String>,
    },
    AllDeactivated {
        count: usize,
    },
    MaxLimitUpdated {
        limit: usize,
    },

    // resource limiter
    Violation(ResourceViolation),
    Timeout {
        elapsed_ms: u64,
        limit_ms: u64,
    },

    // execution tracker
    ExecutionStarted {
        execution_id: String,
        script_name: String,
    },
    ExecutionStatusChanged {
        execution_id: String,
        status: ExecutionStatus,
    },
    ExecutionOutput {
        execution_id: String,
        line: OutputLine,
    },
    ExecutionErrored {
        execution_id: String,
        error: ExecutionError,
    },
    ExecutionProgress {
        execution_id: String,
        progress: f64,
    },
    StepStarted {
        execution_id: String,
        step: ExecutionStep,
    },
    StepCompleted {
        execution_id: String,
        step: ExecutionStep,
    },
    StepFailed {
        execution_id: String,
        step: ExecutionStep,
    },
}

impl SkillEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RegistrySkillAdded { .. } => "registry:skill-added",
            Self::RegistrySkillUpdated { .. } => "registry:skill-updated",
            Self::RegistrySkillRemoved { .. } => "registry:skill-removed",
            Self::RegistryAddFailed { .. } => "registry:add-failed",
            Self::RegistryUpdateFailed { .. } => "registry:update-failed",
            Self::RegistryRemoveFailed { .. } => "registry:remove-failed",
            Self::RegistryCleared { .. } => "registry:cleared",
            Self::RegistryImported { .. } => "registry:imported",
            Self::GraphSkillAdded { .. } => "graph:skill-added",
            Self::GraphSkillRemoved { .. } => "graph:skill-removed",
            Self::GraphCircularDependencies { .. } => "graph:circular-dependencies",
            Self::GraphSortFailed { .. } => "graph:sort-failed",
            Self::GraphSorted { .. } => "graph:sorted",
            Self::GraphResolutionFailed { .. } => "graph:resolution-failed",
            Self::GraphCleared => "graph:cleared",
            Self::ChainBuilt { .. } => "chain:built",
            Self::ChainBuildFailed { .. } => "chain:build-failed",
            Self::SkillActivated { .. } => "activator:skill-activated",
            Self::SkillDeactivated { .. } => "activator:skill-deactivated",
            Self::ActivationFailed { .. } => "activator:activation-failed",
            Self::NoMatches { .. } => "activator:no-matches",
            Self::MultipleMatches { .. } => "activator:multiple-matches",
            Self::AlreadyActive { .. } => "activator:already-active",
            Self::NotActive { .. } => "activator:not-active",
            Self::DeactivationBlocked { .. } => "activator:deactivation-blocked",
            Self::AllDeactivated { .. } => "activator:all-deactivated",
            Self::MaxLimitUpdated { .. } => "activator:max-limit-updated",
            Self::Violation(_) => "violation",
            Self::Timeout { .. } => "timeout",
            Self::ExecutionStarted { .. } => "execution:started",
            Self::ExecutionStatusChanged { .. } => "execution:status",
            Self::ExecutionOutput { .. } => "execution:output",
            Self::ExecutionErrored { .. } => "execution:error",
            Self::ExecutionProgress { .. } => "execution:progress",
            Self::StepStarted { .. } => "execution:step:started",
            Self::StepCompleted { .. } => "execution:step:completed",
            Self::StepFailed { .. } => "execution:step:failed",
        }
    }
}

/// Cloneable broadcast handle. Clones share the same subscriber list.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EventEnvelope>>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: SkillEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Drain everything currently queued on a receiver. Test and CLI helper.
#[must_use]
pub fn drain(rx: &Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    rx.try_iter().collect()
}

/// Names of everything currently queued on a receiver.
#[must_use]
pub fn drain_names(rx: &Receiver<EventEnvelope>) -> Vec<&'static str> {
    rx.try_iter().map(|envelope| envelope.name()).collect()
}
