//! Skill dependency graph.
//!
//! Edges point from a skill to each skill it depends on. A reverse index
//! (dependency -> dependents) is kept alongside so removal and dependent
//! lookups stay proportional to node degree. Every node referenced by an
//! edge owns an adjacency entry in both directions, even when the skill
//! itself was never added.
//!
//! Traversals are iterative so deep dependency chains cannot exhaust the
//! stack.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::skill::Skill;
use crate::events::{EventBus, SkillEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircularDependency {
    /// Path from the first repeated node back to itself, e.g. `[a, b, c, a]`.
    pub cycle: Vec<String>,
    pub severity: CycleSeverity,
    pub message: String,
}

impl CircularDependency {
    fn from_path(cycle: Vec<String>) -> Self {
        let message = format!("Circular dependency detected: {}", cycle.join(" -> "));
        Self {
            cycle,
            severity: CycleSeverity::Error,
            message,
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.cycle.iter().any(|node| node == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphResolution {
    pub skill: String,
    pub resolved: Vec<String>,
    pub missing: Vec<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_skills: usize,
    pub total_dependencies: usize,
    pub skills_with_dependencies: usize,
    pub max_dependencies: usize,
    pub average_dependencies: f64,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
    // Every known node in first-seen order; drives deterministic traversal.
    nodes: Vec<String>,
    // Nodes that were added as skills (as opposed to only referenced).
    declared: HashSet<String>,
    events: EventBus,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_events(events: EventBus) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_skills<'a>(skills: impl IntoIterator<Item = &'a Skill>, events: EventBus) -> Self {
        let mut graph = Self::with_events(events);
        for skill in skills {
            graph.add_skill(skill);
        }
        graph
    }

    fn ensure_node(&mut self, name: &str) {
        if !self.forward.contains_key(name) {
            self.forward.insert(name.to_string(), Vec::new());
            self.reverse.insert(name.to_string(), Vec::new());
            self.nodes.push(name.to_string());
        }
    }

    /// Add a skill and its declared skill dependencies. Re-adding a skill
    /// replaces its previous outgoing edges.
    pub fn add_skill(&mut self, skill: &Skill) {
        let name = skill.name().to_string();
        self.ensure_node(&name);
        self.detach_outgoing(&name);

        let mut added = Vec::new();
        for dep in skill.skill_dependencies() {
            if added.contains(dep) {
                continue;
            }
            self.ensure_node(dep);
            if let Some(deps) = self.forward.get_mut(&name) {
                deps.push(dep.clone());
            }
            if let Some(dependents) = self.reverse.get_mut(dep) {
                if !dependents.contains(&name) {
                    dependents.push(name.clone());
                }
            }
            added.push(dep.clone());
        }
        self.declared.insert(name.clone());

        debug!(skill = %name, deps = added.len(), "graph node added");
        self.events.emit(SkillEvent::GraphSkillAdded {
            name,
            dependencies: added,
        });
    }

    fn detach_outgoing(&mut self, name: &str) {
        let old = self
            .forward
            .get_mut(name)
            .map(std::mem::take)
            .unwrap_or_default();
        for dep in old {
            if let Some(dependents) = self.reverse.get_mut(&dep) {
                dependents.retain(|dependent| dependent != name);
            }
            self.prune_if_orphaned(&dep);
        }
    }

    fn prune_if_orphaned(&mut self, name: &str) {
        let orphaned = !self.declared.contains(name)
            && self.reverse.get(name).is_none_or(Vec::is_empty)
            && self.forward.get(name).is_none_or(Vec::is_empty);
        if orphaned {
            self.forward.remove(name);
            self.reverse.remove(name);
            self.nodes.retain(|node| node != name);
        }
    }

    /// Remove a skill and its outgoing edges. When other skills still depend
    /// on it, the node stays behind as an undeclared dependency so their
    /// edges remain intact.
    pub fn remove_skill(&mut self, name: &str) {
        if !self.forward.contains_key(name) {
            return;
        }
        self.detach_outgoing(name);
        self.declared.remove(name);
        self.prune_if_orphaned(name);

        debug!(skill = %name, "graph node removed");
        self.events.emit(SkillEvent::GraphSkillRemoved {
            name: name.to_string(),
        });
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.forward.get(name).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn dependents(&self, name: &str) -> &[String] {
        self.reverse.get(name).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn has_dependencies(&self, name: &str) -> bool {
        !self.dependencies(name).is_empty()
    }

    #[must_use]
    pub fn has_dependents(&self, name: &str) -> bool {
        !self.dependents(name).is_empty()
    }

    /// Transitive dependencies of `name`, each listed once, every dependency
    /// appearing before anything that was discovered through it.
    #[must_use]
    pub fn all_dependencies(&self, name: &str) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut result = Vec::new();
        let mut stack: Vec<(&str, usize)> = vec![(name, 0)];
        visited.insert(name);

        while let Some(frame) = stack.last_mut() {
            let (node, index) = *frame;
            let deps = self.dependencies(node);
            if index < deps.len() {
                frame.1 += 1;
                let dep = deps[index].as_str();
                if visited.insert(dep) {
                    stack.push((dep, 0));
                }
            } else {
                stack.pop();
                if !stack.is_empty() {
                    result.push(node.to_string());
                }
            }
        }
        result
    }

    /// Find every cycle reachable from any node. Each back edge found during
    /// the walk yields one cycle, reported as the stack slice from the
    /// repeated node, closed by repeating it.
    pub fn detect_cycles(&self) -> Vec<CircularDependency> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut cycles = Vec::new();

        for root in &self.nodes {
            let root = root.as_str();
            if visited.contains(root) {
                continue;
            }
            let mut on_stack: HashSet<&str> = HashSet::new();
            let mut path: Vec<&str> = vec![root];
            let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
            visited.insert(root);
            on_stack.insert(root);

            while let Some(frame) = stack.last_mut() {
                let (node, index) = *frame;
                let deps = self.dependencies(node);
                if index >= deps.len() {
                    on_stack.remove(node);
                    path.pop();
                    stack.pop();
                    continue;
                }
                frame.1 += 1;
                let dep = deps[index].as_str();
                if visited.insert(dep) {
                    on_stack.insert(dep);
                    path.push(dep);
                    stack.push((dep, 0));
                } else if on_stack.contains(dep) {
                    if let Some(start) = path.iter().position(|entry| *entry == dep) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|entry| (*entry).to_string()).collect();
                        cycle.push(dep.to_string());
                        cycles.push(CircularDependency::from_path(cycle));
                    }
                }
            }
        }

        if !cycles.is_empty() {
            warn!(count = cycles.len(), "circular dependencies detected");
            self.events.emit(SkillEvent::GraphCircularDependencies {
                cycles: cycles.iter().map(|c| c.cycle.clone()).collect(),
            });
        }
        cycles
    }

    /// Order `skills` so every dependency precedes its dependents.
    ///
    /// Returns `None` when the graph contains any cycle, or when the induced
    /// subgraph cannot be fully ordered.
    pub fn topological_sort(&self, skills: &[String]) -> Option<Vec<String>> {
        let cycles = self.detect_cycles();
        if !cycles.is_empty() {
            self.events.emit(SkillEvent::GraphSortFailed {
                reason: "Circular dependencies detected".to_string(),
                processed: 0,
                total: skills.len(),
            });
            return None;
        }

        let mut subset: Vec<&str> = Vec::with_capacity(skills.len());
        let mut members: HashSet<&str> = HashSet::new();
        for skill in skills {
            if members.insert(skill.as_str()) {
                subset.push(skill.as_str());
            }
        }

        // Edges run dependent -> dependency, so in-degree counts dependents.
        let mut in_degree: HashMap<&str, usize> = subset.iter().map(|s| (*s, 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for skill in &subset {
            let targets = edges.entry(*skill).or_default();
            for dep in self.dependencies(skill) {
                if members.contains(dep.as_str()) && !targets.contains(&dep.as_str()) {
                    targets.push(dep.as_str());
                    if let Some(degree) = in_degree.get_mut(dep.as_str()) {
                        *degree += 1;
                    }
                }
            }
        }

        let mut queue: VecDeque<&str> = subset
            .iter()
            .copied()
            .filter(|skill| in_degree.get(skill).copied() == Some(0))
            .collect();
        let mut order: Vec<String> = Vec::with_capacity(subset.len());

        while let Some(skill) = queue.pop_front() {
            order.push(skill.to_string());
            for dep in edges.get(skill).map_or(&[][..], Vec::as_slice) {
                if let Some(degree) = in_degree.get_mut(dep) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dep);
                    }
                }
            }
        }

        if order.len() != subset.len() {
            self.events.emit(SkillEvent::GraphSortFailed {
                reason: "Not all skills could be sorted".to_string(),
                processed: order.len(),
                total: subset.len(),
            });
            return None;
        }

        // Kahn emits dependents first here; flip so dependencies lead.
        order.reverse();
        self.events.emit(SkillEvent::GraphSorted {
            skills: order.clone(),
        });
        Some(order)
    }

    /// Split the transitive dependencies of `name` by availability.
    pub fn resolve_dependencies(&self, name: &str, available: &HashSet<String>) -> GraphResolution {
        let (resolved, missing): (Vec<String>, Vec<String>) = self
            .all_dependencies(name)
            .into_iter()
            .partition(|dep| available.contains(dep));
        let success = missing.is_empty();
        if !success {
            self.events.emit(SkillEvent::GraphResolutionFailed {
                skill: name.to_string(),
                missing: missing.clone(),
            });
        }
        GraphResolution {
            skill: name.to_string(),
            resolved,
            missing,
            success,
        }
    }

    /// Dependencies-first order for `name` and everything it needs, or `None`
    /// when a dependency is unavailable or the graph is cyclic.
    pub fn execution_order(&self, name: &str, available: &HashSet<String>) -> Option<Vec<String>> {
        let resolution = self.resolve_dependencies(name, available);
        if !resolution.success {
            return None;
        }
        let mut skills = resolution.resolved;
        skills.push(name.to_string());
        self.topological_sort(&skills)
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.nodes.clear();
        self.declared.clear();
        self.events.emit(SkillEvent::GraphCleared);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.declared.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total_skills: self.declared.len(),
            ..GraphStats::default()
        };
        for name in &self.declared {
            let count = self.dependencies(name).len();
            stats.total_dependencies += count;
            if count > 0 {
                stats.skills_with_dependencies += 1;
            }
            stats.max_dependencies = stats.max_dependencies.max(count);
        }
        if stats.skills_with_dependencies > 0 {
            stats.average_dependencies =
                stats.total_dependencies as f64 / stats.skills_with_dependencies as f64;
        }
        stats
    }
}
