//! Dependency resolution against the registry.
//!
//! Resolution never fails with `Err`: every problem is reported inside the
//! returned [`DependencyResolution`] so callers can inspect partial results.

use std::collections::HashSet;
use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::graph::{CircularDependency, DependencyGraph};
use crate::core::registry::SkillRegistry;
use crate::core::skill::{Skill, SkillStatus};

/// External presence checks for non-skill dependencies.
pub trait PresenceCheck: Send + Sync {
    fn is_package_available(&self, package: &PackageSpec) -> bool;
    fn is_api_available(&self, api: &str) -> bool;
}

/// Treats every package and API as present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumePresent;

impl PresenceCheck for AssumePresent {
    fn is_package_available(&self, _package: &PackageSpec) -> bool {
        true
    }

    fn is_api_available(&self, _api: &str) -> bool {
        true
    }
}

/// Packages are present when `<root>/<name>` exists under any package root;
/// APIs are present when listed.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentPresence {
    pub package_roots: Vec<PathBuf>,
    pub available_apis: HashSet<String>,
}

impl EnvironmentPresence {
    #[must_use]
    pub fn new(package_roots: Vec<PathBuf>, available_apis: impl IntoIterator<Item = String>) -> Self {
        Self {
            package_roots,
            available_apis: available_apis.into_iter().collect(),
        }
    }
}

impl PresenceCheck for EnvironmentPresence {
    fn is_package_available(&self, package: &PackageSpec) -> bool {
        self.package_roots
            .iter()
            .any(|root| root.join(&package.name).is_dir())
    }

    fn is_api_available(&self, api: &str) -> bool {
        self.available_apis.contains(api)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
}

impl PackageSpec {
    /// Parse `name`, `name@version`, `@scope/name` or `@scope/name@version`.
    /// A missing version reads as `latest`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let split_at = if let Some(rest) = raw.strip_prefix('@') {
            rest.find('@').map(|idx| idx + 1)
        } else {
            raw.find('@')
        };
        match split_at {
            Some(idx) if idx + 1 < raw.len() => Self {
                name: raw[..idx].to_string(),
                version: raw[idx + 1..].to_string(),
            },
            Some(idx) => Self {
                name: raw[..idx].to_string(),
                version: "latest".to_string(),
            },
            None => Self {
                name: raw.to_string(),
                version: "latest".to_string(),
            },
        }
    }
}

impl std::fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionErrorKind {
    SkillNotFound,
    CircularDependency,
    MissingSkill,
    MissingPackage,
    MissingApi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionError {
    pub kind: ResolutionErrorKind,
    pub message: String,
    /// Skill whose declaration produced the error.
    pub skill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionWarningKind {
    DependencyError,
    OptionalApiUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionWarning {
    pub kind: ResolutionWarningKind,
    pub message: String,
    pub skill: String,
    pub dependency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyResolution {
    pub skill: String,
    /// Skill names in dependency-first order; the target itself comes last.
    pub resolved: Vec<String>,
    pub packages: Vec<PackageSpec>,
    pub apis: Vec<String>,
    pub missing: Vec<String>,
    pub errors: Vec<ResolutionError>,
    pub warnings: Vec<ResolutionWarning>,
    pub circular: Vec<CircularDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_order: Option<Vec<String>>,
    pub success: bool,
}

impl DependencyResolution {
    fn empty(skill: &str) -> Self {
        Self {
            skill: skill.to_string(),
            resolved: Vec::new(),
            packages: Vec::new(),
            apis: Vec::new(),
            missing: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            circular: Vec::new(),
            execution_order: None,
            success: false,
        }
    }

    fn finish(mut self) -> Self {
        self.success = self.missing.is_empty() && self.errors.is_empty();
        if !self.success {
            self.execution_order = None;
        }
        self
    }

    /// Resolved dependencies, excluding the target itself.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        match self.resolved.split_last() {
            Some((last, rest)) if *last == self.skill => rest,
            _ => &self.resolved,
        }
    }

    #[must_use]
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    #[must_use]
    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.message.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolverStats {
    pub total_skills: usize,
    pub skills_with_dependencies: usize,
    pub average_dependencies: f64,
    pub max_dependencies: usize,
}

#[derive(Clone, Copy)]
pub struct DependencyResolver<'a> {
    graph: &'a DependencyGraph,
    registry: &'a SkillRegistry,
    presence: &'a dyn PresenceCheck,
}

impl<'a> DependencyResolver<'a> {
    #[must_use]
    pub fn new(graph: &'a DependencyGraph, registry: &'a SkillRegistry) -> Self {
        Self {
            graph,
            registry,
            presence: &AssumePresent,
        }
    }

    #[must_use]
    pub fn with_presence(
        graph: &'a DependencyGraph,
        registry: &'a SkillRegistry,
        presence: &'a dyn PresenceCheck,
    ) -> Self {
        Self {
            graph,
            registry,
            presence,
        }
    }

    #[must_use]
    pub const fn graph(&self) -> &'a DependencyGraph {
        self.graph
    }

    #[must_use]
    pub const fn registry(&self) -> &'a SkillRegistry {
        self.registry
    }

    pub fn resolve(&self, name: &str) -> DependencyResolution {
        let mut resolution = DependencyResolution::empty(name);

        let Some(target) = self.registry.get(name) else {
            resolution.missing.push(name.to_string());
            resolution.errors.push(ResolutionError {
                kind: ResolutionErrorKind::SkillNotFound,
                message: format!("Skill '{name}' not found in registry"),
                skill: name.to_string(),
                dependency: None,
                cycle: None,
            });
            return resolution.finish();
        };

        let skills = self.walk(&target, &mut resolution);
        resolution.resolved = skills.iter().map(|s| s.name().to_string()).collect();

        self.check_cycles(name, &mut resolution);
        self.check_external(&skills, &mut resolution);

        if resolution.errors.is_empty() && resolution.missing.is_empty() {
            match self.graph.topological_sort(&resolution.resolved) {
                Some(order) => resolution.execution_order = Some(order),
                None => resolution.errors.push(ResolutionError {
                    kind: ResolutionErrorKind::CircularDependency,
                    message: "Cannot determine execution order: dependency graph contains cycles"
                        .to_string(),
                    skill: name.to_string(),
                    dependency: None,
                    cycle: None,
                }),
            }
        }

        let resolution = resolution.finish();
        debug!(
            skill = %name,
            resolved = resolution.resolved.len(),
            errors = resolution.errors.len(),
            warnings = resolution.warnings.len(),
            success = resolution.success,
            "dependencies resolved"
        );
        resolution
    }

    /// Depth-first walk over declared skill dependencies. Returns the target
    /// and every reachable registered dependency, dependencies first.
    fn walk(&self, target: &Skill, resolution: &mut DependencyResolution) -> Vec<Skill> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut ordered: Vec<Skill> = Vec::new();
        let mut stack: Vec<(Skill, usize)> = vec![(target.clone(), 0)];
        visited.insert(target.name().to_string());

        while let Some((skill, index)) = stack.last_mut() {
            let Some(dep_name) = skill.skill_dependencies().get(*index).cloned() else {
                if let Some((done, _)) = stack.pop() {
                    ordered.push(done);
                }
                continue;
            };
            *index += 1;
            let owner = skill.name().to_string();

            if !visited.insert(dep_name.clone()) {
                continue;
            }
            match self.registry.get(&dep_name) {
                None => {
                    resolution.missing.push(dep_name.clone());
                    resolution.errors.push(ResolutionError {
                        kind: ResolutionErrorKind::MissingSkill,
                        message: format!("Missing skill dependency '{dep_name}' required by '{owner}'"),
                        skill: owner,
                        dependency: Some(dep_name),
                        cycle: None,
                    });
                }
                Some(dep) => {
                    if dep.status == SkillStatus::Error {
                        resolution.warnings.push(ResolutionWarning {
                            kind: ResolutionWarningKind::DependencyError,
                            message: format!(
                                "Dependency '{dep_name}' of '{owner}' is in error state"
                            ),
                            skill: owner,
                            dependency: dep_name,
                        });
                    }
                    stack.push((dep, 0));
                }
            }
        }
        ordered
    }

    fn check_cycles(&self, name: &str, resolution: &mut DependencyResolution) {
        let involved: HashSet<&str> = resolution.resolved.iter().map(String::as_str).collect();
        for cycle in self.graph.detect_cycles() {
            let touches_target = cycle.contains(name);
            let reachable = cycle.cycle.iter().any(|node| involved.contains(node.as_str()));
            if !touches_target && !reachable {
                continue;
            }
            resolution.errors.push(ResolutionError {
                kind: ResolutionErrorKind::CircularDependency,
                message: cycle.message.clone(),
                skill: name.to_string(),
                dependency: None,
                cycle: Some(cycle.cycle.clone()),
            });
            resolution.circular.push(cycle);
        }
    }

    fn check_external(&self, skills: &[Skill], resolution: &mut DependencyResolution) {
        let mut seen_packages = HashSet::new();
        let mut seen_apis = HashSet::new();

        for skill in skills {
            let owner = skill.name();
            for raw in &skill.metadata.dependencies.packages {
                if !seen_packages.insert(raw.clone()) {
                    continue;
                }
                let package = PackageSpec::parse(raw);
                if self.presence.is_package_available(&package) {
                    resolution.packages.push(package);
                } else {
                    resolution.missing.push(raw.clone());
                    resolution.errors.push(ResolutionError {
                        kind: ResolutionErrorKind::MissingPackage,
                        message: format!("Missing package dependency '{raw}' required by '{owner}'"),
                        skill: owner.to_string(),
                        dependency: Some(raw.clone()),
                        cycle: None,
                    });
                }
            }

            for raw in &skill.metadata.dependencies.apis {
                let (api, optional) = raw
                    .strip_suffix('?')
                    .map_or((raw.as_str(), false), |api| (api, true));
                if !seen_apis.insert(api.to_string()) {
                    continue;
                }
                if self.presence.is_api_available(api) {
                    resolution.apis.push(api.to_string());
                } else if optional {
                    resolution.warnings.push(ResolutionWarning {
                        kind: ResolutionWarningKind::OptionalApiUnavailable,
                        message: format!("Optional API '{api}' used by '{owner}' is unavailable"),
                        skill: owner.to_string(),
                        dependency: api.to_string(),
                    });
                } else {
                    resolution.missing.push(api.to_string());
                    resolution.errors.push(ResolutionError {
                        kind: ResolutionErrorKind::MissingApi,
                        message: format!("Missing API dependency '{api}' required by '{owner}'"),
                        skill: owner.to_string(),
                        dependency: Some(api.to_string()),
                        cycle: None,
                    });
                }
            }
        }
    }

    /// Union of individual resolutions, first-seen order preserved.
    pub fn resolve_multiple(&self, names: &[String]) -> DependencyResolution {
        let mut combined = DependencyResolution::empty(&names.join(","));
        for name in names {
            let single = self.resolve(name);
            combined.resolved.extend(single.resolved);
            combined.packages.extend(single.packages);
            combined.apis.extend(single.apis);
            combined.missing.extend(single.missing);
            combined.errors.extend(single.errors);
            combined.warnings.extend(single.warnings);
            combined.circular.extend(single.circular);
        }
        combined.resolved = combined.resolved.into_iter().unique().collect();
        combined.packages = combined.packages.into_iter().unique().collect();
        combined.apis = combined.apis.into_iter().unique().collect();
        combined.missing = combined.missing.into_iter().unique().collect();
        dedupe(&mut combined.errors);
        dedupe(&mut combined.warnings);
        dedupe(&mut combined.circular);

        if combined.errors.is_empty() && combined.missing.is_empty() {
            combined.execution_order = self.graph.topological_sort(&combined.resolved);
            if combined.execution_order.is_none() {
                combined.errors.push(ResolutionError {
                    kind: ResolutionErrorKind::CircularDependency,
                    message: "Cannot determine execution order: dependency graph contains cycles"
                        .to_string(),
                    skill: combined.skill.clone(),
                    dependency: None,
                    cycle: None,
                });
            }
        }
        combined.finish()
    }

    #[must_use]
    pub fn can_resolve(&self, name: &str) -> bool {
        self.resolve(name).success
    }

    #[must_use]
    pub fn missing_dependencies(&self, name: &str) -> Vec<String> {
        self.resolve(name).missing
    }

    #[must_use]
    pub fn execution_order(&self, name: &str) -> Option<Vec<String>> {
        self.resolve(name).execution_order
    }

    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        let graph = self.graph.stats();
        ResolverStats {
            total_skills: self.registry.len(),
            skills_with_dependencies: graph.skills_with_dependencies,
            average_dependencies: graph.average_dependencies,
            max_dependencies: graph.max_dependencies,
        }
    }
}

fn dedupe<T: PartialEq>(items: &mut Vec<T>) {
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if !kept.contains(&item) {
            kept.push(item);
        }
    }
    *items = kept;
}
