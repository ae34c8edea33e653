//! Skill activation lifecycle.
//!
//! The activator owns the set of active skills. Activating a skill first
//! activates its dependencies; deactivating a skill first deactivates every
//! active skill that depends on it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::chain::{ChainBuilder, SkillChain};
use crate::core::registry::SkillRegistry;
use crate::core::resolver::{DependencyResolution, DependencyResolver};
use crate::core::skill::Skill;
use crate::error::{Result, SkillError};
use crate::events::{EventBus, SkillEvent};

pub const DEFAULT_MAX_ACTIVE_SKILLS: usize = 10;
const MOST_ACTIVATED_LIMIT: usize = 5;

/// Selection collaborator for free-text activation.
pub trait SkillMatcher {
    /// Candidate skill names, best match first.
    fn find_matches(&self, input: &str) -> Vec<String>;
}

/// Matches skills whose name or one of whose triggers occurs in the input,
/// case-insensitively. Longer hits rank first.
pub struct TriggerMatcher<'a> {
    registry: &'a SkillRegistry,
}

impl<'a> TriggerMatcher<'a> {
    #[must_use]
    pub const fn new(registry: &'a SkillRegistry) -> Self {
        Self { registry }
    }
}

impl SkillMatcher for TriggerMatcher<'_> {
    fn find_matches(&self, input: &str) -> Vec<String> {
        let input = input.to_lowercase();
        self.registry
            .all()
            .iter()
            .filter_map(|skill| {
                std::iter::once(skill.name())
                    .chain(skill.metadata.triggers.iter().map(String::as_str))
                    .map(str::to_lowercase)
                    .filter(|needle| !needle.is_empty() && input.contains(needle.as_str()))
                    .map(|needle| needle.len())
                    .max()
                    .map(|score| (score, skill.name().to_string()))
            })
            .sorted_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, name)| name)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatorOptions {
    pub max_active_skills: usize,
    pub allow_reactivation: bool,
}

impl Default for ActivatorOptions {
    fn default() -> Self {
        Self {
            max_active_skills: DEFAULT_MAX_ACTIVE_SKILLS,
            allow_reactivation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSkill {
    pub skill: Skill,
    pub activated_at: DateTime<Utc>,
    pub resolution: DependencyResolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFailureReason {
    NotFound,
    AlreadyActive,
    MaxLimitReached,
    DependencyError,
}

impl ActivationFailureReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyActive => "already_active",
            Self::MaxLimitReached => "max_limit_reached",
            Self::DependencyError => "dependency_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationFailure {
    pub skill: String,
    pub reason: ActivationFailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ActivationFailure {
    fn new(skill: &str, reason: ActivationFailureReason, message: impl Into<String>) -> Self {
        Self {
            skill: skill.to_string(),
            reason,
            message: message.into(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResult {
    pub activated: Vec<String>,
    pub failed: Vec<ActivationFailure>,
    pub dependencies: Vec<String>,
    pub suggestions: Vec<String>,
    pub requires_user_selection: bool,
}

impl ActivationResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.requires_user_selection
    }

    fn merge(&mut self, other: Self) {
        for name in other.activated {
            if !self.activated.contains(&name) {
                self.activated.push(name);
            }
        }
        for name in other.dependencies {
            if !self.dependencies.contains(&name) {
                self.dependencies.push(name);
            }
        }
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HistoryAction {
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryEntry {
    skill: String,
    action: HistoryAction,
    at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivatorStats {
    pub total_active: usize,
    pub max_active: usize,
    pub total_activations: usize,
    pub total_deactivations: usize,
    pub average_active_duration_ms: f64,
    pub most_activated: Vec<(String, usize)>,
}

pub struct SkillActivator<'a> {
    resolver: DependencyResolver<'a>,
    events: EventBus,
    active: Vec<ActiveSkill>,
    history: Vec<HistoryEntry>,
    options: ActivatorOptions,
}

impl<'a> SkillActivator<'a> {
    #[must_use]
    pub fn new(resolver: DependencyResolver<'a>, events: EventBus) -> Self {
        Self::with_options(resolver, events, ActivatorOptions::default())
    }

    #[must_use]
    pub const fn with_options(
        resolver: DependencyResolver<'a>,
        events: EventBus,
        options: ActivatorOptions,
    ) -> Self {
        Self {
            resolver,
            events,
            active: Vec::new(),
            history: Vec::new(),
            options,
        }
    }

    /// Activate `name` and any of its dependencies that are not yet active.
    pub fn activate(&mut self, name: &str) -> ActivationResult {
        let mut newly_activated = Vec::new();
        let mut result = ActivationResult::default();

        match self.activate_inner(name, true, &mut newly_activated) {
            Ok(dependencies) => {
                result.activated = newly_activated;
                result.dependencies = dependencies;
            }
            Err(failure) => {
                // Dependencies activated by this call must not outlive the failure.
                for dep in newly_activated.iter().rev() {
                    debug!(skill = %dep, parent = %name, "rolling back dependency activation");
                    self.remove_active(dep);
                }
                if failure.reason == ActivationFailureReason::AlreadyActive {
                    self.events.emit(SkillEvent::AlreadyActive {
                        name: name.to_string(),
                    });
                }
                warn!(
                    skill = %name,
                    reason = failure.reason.as_str(),
                    message = %failure.message,
                    "activation failed"
                );
                self.events.emit(SkillEvent::ActivationFailed {
                    name: name.to_string(),
                    reason: failure.reason.as_str().to_string(),
                    errors: if failure.errors.is_empty() {
                        vec![failure.message.clone()]
                    } else {
                        failure.errors.clone()
                    },
                });
                result.failed.push(failure);
            }
        }
        result
    }

    fn activate_inner(
        &mut self,
        name: &str,
        top_level: bool,
        newly_activated: &mut Vec<String>,
    ) -> std::result::Result<Vec<String>, ActivationFailure> {
        let Some(skill) = self.resolver.registry().get(name) else {
            return Err(ActivationFailure::new(
                name,
                ActivationFailureReason::NotFound,
                format!("Skill '{name}' not found"),
            ));
        };

        if let Some(index) = self.active.iter().position(|a| a.skill.name() == name) {
            if top_level && self.options.allow_reactivation {
                // Keep the previous entry until the fresh activation succeeds.
                let previous = self.active.remove(index);
                return match self.activate_resolved(name, skill, newly_activated) {
                    Ok(dependencies) => {
                        self.record_deactivation(&previous);
                        Ok(dependencies)
                    }
                    Err(failure) => {
                        self.active.insert(index, previous);
                        Err(failure)
                    }
                };
            } else if top_level {
                return Err(ActivationFailure::new(
                    name,
                    ActivationFailureReason::AlreadyActive,
                    format!("Skill '{name}' is already active"),
                ));
            } else {
                return Ok(Vec::new());
            }
        }
        self.activate_resolved(name, skill, newly_activated)
    }

    /// Limit check, resolution and dependency activation for a skill that is
    /// not currently in the active set.
    fn activate_resolved(
        &mut self,
        name: &str,
        skill: Skill,
        newly_activated: &mut Vec<String>,
    ) -> std::result::Result<Vec<String>, ActivationFailure> {
        if self.active.len() >= self.options.max_active_skills {
            return Err(ActivationFailure::new(
                name,
                ActivationFailureReason::MaxLimitReached,
                format!(
                    "Maximum active skills limit ({}) reached",
                    self.options.max_active_skills
                ),
            ));
        }

        let resolution = self.resolver.resolve(name);
        if !resolution.success {
            let errors = resolution.error_messages();
            let mut failure = ActivationFailure::new(
                name,
                ActivationFailureReason::DependencyError,
                format!("Failed to resolve dependencies: {}", errors.join("; ")),
            );
            failure.errors = errors;
            return Err(failure);
        }

        let dependencies = resolution.dependencies().to_vec();
        for dep in &dependencies {
            if self.is_active(dep) {
                continue;
            }
            if let Err(inner) = self.activate_inner(dep, false, newly_activated) {
                let mut failure = ActivationFailure::new(
                    name,
                    ActivationFailureReason::DependencyError,
                    format!("Failed to activate dependency '{dep}': {}", inner.message),
                );
                failure.errors = if inner.errors.is_empty() {
                    vec![inner.message]
                } else {
                    inner.errors
                };
                return Err(failure);
            }
        }

        let warnings = resolution.warning_messages();
        self.active.push(ActiveSkill {
            skill,
            activated_at: Utc::now(),
            resolution,
        });
        self.history.push(HistoryEntry {
            skill: name.to_string(),
            action: HistoryAction::Activated,
            at: Utc::now(),
            active_ms: None,
        });
        newly_activated.push(name.to_string());

        info!(skill = %name, dependencies = dependencies.len(), "skill activated");
        self.events.emit(SkillEvent::SkillActivated {
            name: name.to_string(),
            dependency_count: dependencies.len(),
            warnings,
        });
        Ok(dependencies)
    }

    /// Activate several skills; names are deduplicated, first-seen order.
    pub fn activate_multiple(&mut self, names: &[String]) -> ActivationResult {
        let mut combined = ActivationResult::default();
        for name in names.iter().unique() {
            let result = self.activate(name);
            combined.merge(result);
        }
        combined
    }

    /// Activate from free text. A single match activates only when
    /// `auto_activate` is set; anything else asks the caller to choose.
    pub fn activate_by_keywords(
        &mut self,
        input: &str,
        matcher: &dyn SkillMatcher,
        auto_activate: bool,
    ) -> ActivationResult {
        let matches = matcher.find_matches(input);
        match matches.as_slice() {
            [] => {
                self.events.emit(SkillEvent::NoMatches {
                    input: input.to_string(),
                });
                ActivationResult::default()
            }
            [only] if auto_activate => {
                let only = only.clone();
                self.activate(&only)
            }
            _ => {
                if matches.len() > 1 {
                    self.events.emit(SkillEvent::MultipleMatches {
                        input: input.to_string(),
                        match_count: matches.len(),
                    });
                }
                ActivationResult {
                    suggestions: matches,
                    requires_user_selection: true,
                    ..ActivationResult::default()
                }
            }
        }
    }

    /// Deactivate `name`, cascading to active dependents first.
    pub fn deactivate(&mut self, name: &str) -> bool {
        if !self.is_active(name) {
            self.events.emit(SkillEvent::NotActive {
                name: name.to_string(),
            });
            return false;
        }

        let dependents: Vec<String> = self
            .active
            .iter()
            .filter(|a| a.skill.depends_on(name))
            .map(|a| a.skill.name().to_string())
            .collect();
        if !dependents.is_empty() {
            debug!(skill = %name, dependents = ?dependents, "cascading deactivation");
            self.events.emit(SkillEvent::DeactivationBlocked {
                name: name.to_string(),
                dependents: dependents.clone(),
            });
            for dependent in &dependents {
                self.deactivate(dependent);
            }
        }

        self.remove_active(name)
    }

    fn remove_active(&mut self, name: &str) -> bool {
        let Some(index) = self.active.iter().position(|a| a.skill.name() == name) else {
            return false;
        };
        let entry = self.active.remove(index);
        self.record_deactivation(&entry);
        true
    }

    fn record_deactivation(&mut self, entry: &ActiveSkill) {
        let name = entry.skill.name().to_string();
        let active_ms = (Utc::now() - entry.activated_at)
            .num_milliseconds()
            .max(0)
            .unsigned_abs();
        info!(skill = %name, active_ms, "skill deactivated");
        self.history.push(HistoryEntry {
            skill: name.clone(),
            action: HistoryAction::Deactivated,
            at: Utc::now(),
            active_ms: Some(active_ms),
        });
        self.events.emit(SkillEvent::SkillDeactivated { name });
    }

    /// Deactivate everything, newest first. Returns how many were active.
    pub fn deactivate_all(&mut self) -> usize {
        let mut count = 0;
        while let Some(last) = self.active.last() {
            let name = last.skill.name().to_string();
            if self.remove_active(&name) {
                count += 1;
            }
        }
        self.events.emit(SkillEvent::AllDeactivated { count });
        count
    }

    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|a| a.skill.name() == name)
    }

    #[must_use]
    pub fn active_skills(&self) -> Vec<String> {
        self.active.iter().map(|a| a.skill.name().to_string()).collect()
    }

    #[must_use]
    pub fn active_info(&self, name: &str) -> Option<&ActiveSkill> {
        self.active.iter().find(|a| a.skill.name() == name)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// One chain covering every active skill.
    #[must_use]
    pub fn build_chain_for_active(&self, task: Option<&str>) -> SkillChain {
        ChainBuilder::new(self.resolver, self.events.clone())
            .build_multi_skill_chain(&self.active_skills(), task)
    }

    #[must_use]
    pub fn build_chain_for(&self, name: &str) -> SkillChain {
        ChainBuilder::new(self.resolver, self.events.clone()).build_chain(name)
    }

    pub fn set_max_active_skills(&mut self, limit: usize) -> Result<()> {
        if limit < 1 {
            return Err(SkillError::ValidationFailed(
                "max active skills must be at least 1".to_string(),
            ));
        }
        self.options.max_active_skills = limit;
        self.events.emit(SkillEvent::MaxLimitUpdated { limit });
        Ok(())
    }

    #[must_use]
    pub const fn max_active_skills(&self) -> usize {
        self.options.max_active_skills
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> ActivatorStats {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut deactivations = 0usize;
        let mut durations: Vec<u64> = Vec::new();
        for entry in &self.history {
            match entry.action {
                HistoryAction::Activated => *counts.entry(entry.skill.as_str()).or_default() += 1,
                HistoryAction::Deactivated => {
                    deactivations += 1;
                    durations.extend(entry.active_ms);
                }
            }
        }

        let average_active_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let total_activations = counts.values().sum();
        let most_activated = counts
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .take(MOST_ACTIVATED_LIMIT)
            .map(|(name, count)| (name.to_string(), count))
            .collect();

        ActivatorStats {
            total_active: self.active.len(),
            max_active: self.options.max_active_skills,
            total_activations,
            total_deactivations: deactivations,
            average_active_duration_ms,
            most_activated,
        }
    }
}
