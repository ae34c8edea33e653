//! Execution plans built from resolved dependency sets.
//!
//! A [`SkillChain`] is built once per request and then mutated in place as
//! its steps execute. Steps run strictly in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::resolver::{DependencyResolution, DependencyResolver};
use crate::core::skill::Skill;
use crate::error::{Result, SkillError};
use crate::events::{EventBus, SkillEvent};
use crate::sandbox::permissions::Permission;

const BASE_STEP_SECS: u64 = 30;
const PER_CAPABILITY_SECS: u64 = 10;
const PER_SCRIPT_SECS: u64 = 20;
const PER_DEPENDENCY_SECS: u64 = 5;

pub const CYCLE_FAILURE: &str = "Cannot build chain: circular dependencies detected";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    #[default]
    Ready,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub name: String,
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    /// 1-based position in the chain.
    pub step_number: usize,
    pub skill: String,
    pub action: String,
    pub inputs: Vec<StepInput>,
    pub outputs: Vec<StepOutput>,
    pub estimated_duration_secs: u64,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainStep {
    fn from_skill(step_number: usize, skill: &Skill) -> Self {
        Self {
            step_number,
            skill: skill.name().to_string(),
            action: skill.metadata.description.clone(),
            inputs: step_inputs(skill),
            outputs: step_outputs(skill),
            estimated_duration_secs: estimate_duration(skill),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillChain {
    /// Target skill, or a comma-joined list for multi-skill chains.
    pub skill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub steps: Vec<ChainStep>,
    pub permissions: Vec<Permission>,
    pub estimated_duration_secs: u64,
    pub status: ChainStatus,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl SkillChain {
    fn failed(skill: &str, task: Option<String>, errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            skill: skill.to_string(),
            task,
            steps: Vec::new(),
            permissions: Vec::new(),
            estimated_duration_secs: 0,
            status: ChainStatus::Failed,
            errors,
            warnings,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == ChainStatus::Ready
    }

    #[must_use]
    pub fn skill_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.skill.as_str()).collect()
    }

    #[must_use]
    pub fn step(&self, step_number: usize) -> Option<&ChainStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    #[must_use]
    pub fn next_pending(&self) -> Option<&ChainStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Pending)
    }

    fn step_mut(&mut self, step_number: usize) -> Result<&mut ChainStep> {
        self.steps
            .iter_mut()
            .find(|s| s.step_number == step_number)
            .ok_or_else(|| SkillError::NotFound(format!("chain step {step_number}")))
    }

    /// Mark a pending step running. Every earlier step must be finished.
    pub fn start_step(&mut self, step_number: usize) -> Result<()> {
        if self.status == ChainStatus::Failed || self.status == ChainStatus::Completed {
            return Err(SkillError::InvalidState(format!(
                "chain for {} is already finished",
                self.skill
            )));
        }
        if self
            .steps
            .iter()
            .any(|s| s.step_number < step_number && matches!(s.status, StepStatus::Pending | StepStatus::Running))
        {
            return Err(SkillError::InvalidState(format!(
                "step {step_number} cannot start before earlier steps finish"
            )));
        }
        let step = self.step_mut(step_number)?;
        if step.status != StepStatus::Pending {
            return Err(SkillError::InvalidState(format!(
                "step {step_number} is not pending"
            )));
        }
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        self.status = ChainStatus::Running;
        Ok(())
    }

    pub fn complete_step(&mut self, step_number: usize) -> Result<()> {
        let step = self.step_mut(step_number)?;
        if step.status != StepStatus::Running {
            return Err(SkillError::InvalidState(format!(
                "step {step_number} is not running"
            )));
        }
        step.status = StepStatus::Completed;
        step.finished_at = Some(Utc::now());
        if self.steps.iter().all(|s| s.status == StepStatus::Completed) {
            self.status = ChainStatus::Completed;
        }
        Ok(())
    }

    /// Fail a running step; all remaining pending steps are skipped.
    pub fn fail_step(&mut self, step_number: usize, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        let step = self.step_mut(step_number)?;
        if step.status != StepStatus::Running {
            return Err(SkillError::InvalidState(format!(
                "step {step_number} is not running"
            )));
        }
        step.status = StepStatus::Failed;
        step.finished_at = Some(Utc::now());
        step.error = Some(error.clone());
        self.errors.push(format!("Step {step_number}: {error}"));
        self.skip_remaining();
        self.status = ChainStatus::Failed;
        Ok(())
    }

    /// Skip every pending step. Returns how many were skipped.
    pub fn skip_remaining(&mut self) -> usize {
        let mut skipped = 0;
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
                skipped += 1;
            }
        }
        skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ChainBuilder<'a> {
    resolver: DependencyResolver<'a>,
    events: EventBus,
}

impl<'a> ChainBuilder<'a> {
    #[must_use]
    pub const fn new(resolver: DependencyResolver<'a>, events: EventBus) -> Self {
        Self { resolver, events }
    }

    pub fn build_chain(&self, name: &str) -> SkillChain {
        let resolution = self.resolver.resolve(name);
        self.build_from_resolution(name, None, &resolution)
    }

    /// One chain over the union of several targets.
    pub fn build_multi_skill_chain(&self, names: &[String], task: Option<&str>) -> SkillChain {
        let label = names.join(",");
        let resolution = self.resolver.resolve_multiple(names);
        self.build_from_resolution(&label, task.map(str::to_string), &resolution)
    }

    fn build_from_resolution(
        &self,
        label: &str,
        task: Option<String>,
        resolution: &DependencyResolution,
    ) -> SkillChain {
        let warnings = resolution.warning_messages();

        if !resolution.success {
            let mut errors = resolution.error_messages();
            if !resolution.circular.is_empty() {
                errors.insert(0, CYCLE_FAILURE.to_string());
            }
            return self.fail(label, task, errors, warnings);
        }
        let Some(order) = resolution.execution_order.as_ref() else {
            return self.fail(label, task, vec![CYCLE_FAILURE.to_string()], warnings);
        };

        let registry = self.resolver.registry();
        let mut steps = Vec::with_capacity(order.len());
        let mut permissions: Vec<Permission> = Vec::new();
        for name in order {
            let Some(skill) = registry.get(name) else {
                return self.fail(
                    label,
                    task,
                    vec![format!("Skill '{name}' disappeared from registry during chain build")],
                    warnings,
                );
            };
            for permission in &skill.metadata.config.permissions {
                if !permissions.contains(permission) {
                    permissions.push(permission.clone());
                }
            }
            steps.push(ChainStep::from_skill(steps.len() + 1, &skill));
        }

        let estimated_duration_secs = steps.iter().map(|s| s.estimated_duration_secs).sum();
        let chain = SkillChain {
            skill: label.to_string(),
            task,
            steps,
            permissions,
            estimated_duration_secs,
            status: ChainStatus::Ready,
            errors: Vec::new(),
            warnings,
            created_at: Utc::now(),
        };

        info!(
            skill = %label,
            steps = chain.steps.len(),
            estimated_secs = estimated_duration_secs,
            "chain built"
        );
        self.events.emit(SkillEvent::ChainBuilt {
            skill: label.to_string(),
            step_count: chain.steps.len(),
            estimated_duration_secs,
        });
        chain
    }

    fn fail(
        &self,
        label: &str,
        task: Option<String>,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> SkillChain {
        debug!(skill = %label, errors = ?errors, "chain build failed");
        self.events.emit(SkillEvent::ChainBuildFailed {
            skill: label.to_string(),
            errors: errors.clone(),
        });
        SkillChain::failed(label, task, errors, warnings)
    }
}

/// Structural checks over a built chain.
#[must_use]
pub fn validate_chain(chain: &SkillChain) -> ChainValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if chain.steps.is_empty() {
        errors.push("Chain has no steps".to_string());
    }

    let mut provided: Vec<&str> = Vec::new();
    for step in &chain.steps {
        for input in &step.inputs {
            if input.required && input.default.is_none() && !provided.contains(&input.name.as_str()) {
                warnings.push(format!(
                    "Step {}: Required input '{}' may not be provided",
                    step.step_number, input.name
                ));
            }
        }
        provided.extend(step.outputs.iter().map(|o| o.name.as_str()));
    }

    ChainValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn step_inputs(skill: &Skill) -> Vec<StepInput> {
    let files = skill.metadata.integration.reads_from.iter().map(|path| StepInput {
        name: path.clone(),
        input_type: "file".to_string(),
        required: true,
        default: None,
        description: format!("Read from {path}"),
    });
    let params = skill
        .metadata
        .capabilities
        .iter()
        .flat_map(|cap| cap.parameters.iter())
        .map(|param| StepInput {
            name: param.name.clone(),
            input_type: param.param_type.as_str().to_string(),
            required: param.required,
            default: param.default.clone(),
            description: param.description.clone(),
        });
    files.chain(params).collect()
}

fn step_outputs(skill: &Skill) -> Vec<StepOutput> {
    let mut outputs: Vec<StepOutput> = skill
        .metadata
        .integration
        .writes_to
        .iter()
        .map(|path| StepOutput {
            name: path.clone(),
            output_type: "file".to_string(),
            description: format!("Write to {path}"),
        })
        .collect();
    outputs.push(StepOutput {
        name: "result".to_string(),
        output_type: "object".to_string(),
        description: format!("Result of {}", skill.name()),
    });
    outputs
}

/// Rough planning heuristic, in seconds.
#[must_use]
pub fn estimate_duration(skill: &Skill) -> u64 {
    let meta = &skill.metadata;
    let count = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
    BASE_STEP_SECS
        + PER_CAPABILITY_SECS * count(meta.capabilities.len())
        + PER_SCRIPT_SECS * count(meta.npm_scripts.len())
        + PER_DEPENDENCY_SECS * count(meta.dependencies.skills.len() + meta.dependencies.packages.len())
}
