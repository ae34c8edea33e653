//! In-memory skill registry.
//!
//! Mutations (`add`, `update`, `remove`, `clear`, `import`) are async and
//! pass through a fair [`tokio::sync::Mutex`] gate, so they complete in the
//! order they were issued and never interleave. Reads are synchronous and see
//! the state left by the last completed mutation.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::skill::{Skill, SkillStatus};
use crate::error::{Result, SkillError};
use crate::events::{EventBus, SkillEvent};

pub const EXPORT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
    pub authors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub skills: Vec<Skill>,
}

impl RegistryExport {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SkillError::NotFound(format!("registry export {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            SkillError::Serialization(format!("parse registry export {}: {err}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let payload = serde_json::to_string_pretty(self)?;
        std::fs::write(path, payload)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Entries {
    skills: HashMap<String, Skill>,
    // Insertion order, so listings are stable.
    order: Vec<String>,
}

impl Entries {
    fn insert(&mut self, skill: Skill) {
        let name = skill.name().to_string();
        if self.skills.insert(name.clone(), skill).is_none() {
            self.order.push(name);
        }
    }

    fn remove(&mut self, name: &str) -> Option<Skill> {
        let removed = self.skills.remove(name)?;
        self.order.retain(|entry| entry != name);
        Some(removed)
    }

    fn clear(&mut self) {
        self.skills.clear();
        self.order.clear();
    }

    fn iter(&self) -> impl Iterator<Item = &Skill> {
        self.order.iter().filter_map(|name| self.skills.get(name))
    }
}

#[derive(Debug, Default)]
pub struct SkillRegistry {
    entries: RwLock<Entries>,
    gate: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl SkillRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_events(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            gate: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Build a registry from an already-loaded skill set without going
    /// through the async gate. Later skills with a duplicate name are ignored.
    #[must_use]
    pub fn from_skills(skills: impl IntoIterator<Item = Skill>, events: EventBus) -> Self {
        let registry = Self::with_events(events);
        {
            let mut entries = registry.entries.write();
            for skill in skills {
                if !entries.skills.contains_key(skill.name()) {
                    entries.insert(skill);
                }
            }
        }
        registry
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Returns false (and emits `registry:add-failed`) when the name is taken.
    pub async fn add(&self, skill: Skill) -> bool {
        let _turn = self.gate.lock().await;
        let name = skill.name().to_string();
        let mut entries = self.entries.write();
        if entries.skills.contains_key(&name) {
            drop(entries);
            debug!(skill = %name, "add rejected: already registered");
            self.events.emit(SkillEvent::RegistryAddFailed {
                name,
                reason: "Skill already exists".to_string(),
            });
            return false;
        }
        let version = skill.metadata.version.clone();
        let status = skill.status;
        entries.insert(skill);
        drop(entries);
        debug!(skill = %name, %version, "skill registered");
        self.events.emit(SkillEvent::RegistrySkillAdded {
            name,
            version,
            status,
        });
        true
    }

    /// Returns false (and emits `registry:update-failed`) when the skill is unknown.
    pub async fn update(&self, skill: Skill) -> bool {
        let _turn = self.gate.lock().await;
        let name = skill.name().to_string();
        let mut entries = self.entries.write();
        let Some(old) = entries.skills.get(&name) else {
            drop(entries);
            self.events.emit(SkillEvent::RegistryUpdateFailed {
                name,
                reason: "Skill not found".to_string(),
            });
            return false;
        };
        let old_version = old.metadata.version.clone();
        let old_status = old.status;
        let new_version = skill.metadata.version.clone();
        let new_status = skill.status;
        entries.insert(skill);
        drop(entries);
        self.events.emit(SkillEvent::RegistrySkillUpdated {
            name,
            old_version,
            new_version,
            old_status,
            new_status,
        });
        true
    }

    /// Returns false (and emits `registry:remove-failed`) when the skill is unknown.
    pub async fn remove(&self, name: &str) -> bool {
        let _turn = self.gate.lock().await;
        let removed = self.entries.write().remove(name);
        match removed {
            Some(skill) => {
                self.events.emit(SkillEvent::RegistrySkillRemoved {
                    name: name.to_string(),
                    version: skill.metadata.version,
                });
                true
            }
            None => {
                self.events.emit(SkillEvent::RegistryRemoveFailed {
                    name: name.to_string(),
                    reason: "Skill not found".to_string(),
                });
                false
            }
        }
    }

    /// Mark a skill's status in place. Returns false when the skill is unknown.
    pub async fn set_status(&self, name: &str, status: SkillStatus) -> bool {
        let _turn = self.gate.lock().await;
        let mut entries = self.entries.write();
        let Some(skill) = entries.skills.get_mut(name) else {
            return false;
        };
        let old_status = skill.status;
        skill.status = status;
        let version = skill.metadata.version.clone();
        drop(entries);
        self.events.emit(SkillEvent::RegistrySkillUpdated {
            name: name.to_string(),
            old_version: version.clone(),
            new_version: version,
            old_status,
            new_status: status,
        });
        true
    }

    pub async fn clear(&self) {
        let _turn = self.gate.lock().await;
        let count = {
            let mut entries = self.entries.write();
            let count = entries.skills.len();
            entries.clear();
            count
        };
        info!(count, "registry cleared");
        self.events.emit(SkillEvent::RegistryCleared { count });
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Skill> {
        self.entries.read().skills.get(name).cloned()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.entries.read().skills.contains_key(name)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Skill> {
        self.entries.read().iter().cloned().collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.read().order.clone()
    }

    #[must_use]
    pub fn by_status(&self, status: SkillStatus) -> Vec<Skill> {
        self.filter(|skill| skill.status == status)
    }

    #[must_use]
    pub fn by_author(&self, author: &str) -> Vec<Skill> {
        self.filter(|skill| skill.metadata.author.as_deref() == Some(author))
    }

    /// Case-insensitive substring match on name and description.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<Skill> {
        let query = query.to_lowercase();
        self.filter(|skill| {
            skill.metadata.name.to_lowercase().contains(&query)
                || skill.metadata.description.to_lowercase().contains(&query)
        })
    }

    #[must_use]
    pub fn filter<F>(&self, predicate: F) -> Vec<Skill>
    where
        F: Fn(&Skill) -> bool,
    {
        self.entries
            .read()
            .iter()
            .filter(|skill| predicate(skill))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().skills.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.read();
        let mut stats = RegistryStats::default();
        let mut authors = BTreeSet::new();
        for skill in entries.iter() {
            stats.total += 1;
            match skill.status {
                SkillStatus::Active => stats.active += 1,
                SkillStatus::Inactive => stats.inactive += 1,
                SkillStatus::Error => stats.error += 1,
            }
            if let Some(author) = skill.metadata.author.as_deref() {
                if !author.is_empty() {
                    authors.insert(author);
                }
            }
        }
        stats.authors = authors.len();
        stats
    }

    #[must_use]
    pub fn export(&self) -> RegistryExport {
        RegistryExport {
            version: EXPORT_VERSION.to_string(),
            exported_at: Utc::now(),
            skills: self.all(),
        }
    }

    /// Replace the registry content with an export.
    pub async fn import(&self, data: RegistryExport) {
        let _turn = self.gate.lock().await;
        let count = data.skills.len();
        {
            let mut entries = self.entries.write();
            entries.clear();
            for skill in data.skills {
                entries.insert(skill);
            }
        }
        info!(count, version = %data.version, "registry imported");
        self.events.emit(SkillEvent::RegistryImported { count });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::drain_names;

    fn skill(name: &str) -> Skill {
        Skill::new(name, "1.0.0", format!("{name} description"))
    }

    #[tokio::test]
    async fn add_rejects_duplicates() {
        let registry = SkillRegistry::new();
        let rx = registry.events().subscribe();

        assert!(registry.add(skill("alpha")).await);
        assert!(!registry.add(skill("alpha")).await);

        assert_eq!(registry.len(), 1);
        assert_eq!(
            drain_names(&rx),
            vec!["registry:skill-added", "registry:add-failed"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_change_never_reverts_a_concurrent_update() {
        for round in 0..50 {
            let registry = Arc::new(SkillRegistry::new());
            registry.add(skill("alpha")).await;

            let status_task = {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.set_status("alpha", SkillStatus::Active).await })
            };
            let update_task = {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .update(Skill::new("alpha", "2.0.0", "alpha description"))
                        .await
                })
            };
            assert!(status_task.await.unwrap());
            assert!(update_task.await.unwrap());

            let stored = registry.get("alpha").unwrap();
            assert_eq!(stored.metadata.version, "2.0.0", "round {round}");
        }
    }

    #[tokio::test]
    async fn set_status_emits_update_in_place() {
        let registry = SkillRegistry::new();
        registry.add(skill("alpha")).await;
        let rx = registry.events().subscribe();

        assert!(registry.set_status("alpha", SkillStatus::Error).await);
        assert!(!registry.set_status("ghost", SkillStatus::Error).await);
        assert_eq!(registry.get("alpha").unwrap().status, SkillStatus::Error);
        assert_eq!(drain_names(&rx), vec!["registry:skill-updated"]);
    }

    #[tokio::test]
    async fn update_and_remove_require_existing_skill() {
        let registry = SkillRegistry::new();
        assert!(!registry.update(skill("ghost")).await);
        assert!(!registry.remove("ghost").await);

        registry.add(skill("alpha")).await;
        let mut changed = skill("alpha");
        changed.metadata.version = "2.0.0".to_string();
        assert!(registry.update(changed).await);
        assert_eq!(registry.get("alpha").unwrap().metadata.version, "2.0.0");

        assert!(registry.remove("alpha").await);
        assert!(!registry.has("alpha"));
    }

    #[tokio::test]
    async fn queries_follow_insertion_order() {
        let registry = SkillRegistry::new();
        for name in ["charlie", "alpha", "bravo"] {
            registry.add(skill(name)).await;
        }
        assert_eq!(registry.names(), vec!["charlie", "alpha", "bravo"]);

        registry.remove("alpha").await;
        registry.add(skill("alpha")).await;
        assert_eq!(registry.names(), vec!["charlie", "bravo", "alpha"]);
    }

    #[tokio::test]
    async fn search_matches_name_and_description() {
        let registry = SkillRegistry::new();
        registry.add(skill("formatter")).await;
        registry
            .add(Skill::new("linter", "1.0.0", "Checks FORMAT rules"))
            .await;
        registry.add(skill("deployer")).await;

        let hits: Vec<String> = registry
            .search("format")
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(hits, vec!["formatter", "linter"]);
    }

    #[tokio::test]
    async fn stats_count_statuses_and_distinct_authors() {
        let registry = SkillRegistry::new();
        registry
            .add(skill("a").with_status(SkillStatus::Active).with_author("ann"))
            .await;
        registry
            .add(skill("b").with_status(SkillStatus::Error).with_author("ann"))
            .await;
        registry.add(skill("c").with_author("bob")).await;
        registry.add(skill("d")).await;

        let stats = registry.stats();
        assert_eq!(
            stats,
            RegistryStats {
                total: 4,
                active: 1,
                inactive: 2,
                error: 1,
                authors: 2,
            }
        );
        assert_eq!(registry.by_author("ann").len(), 2);
        assert_eq!(registry.by_status(SkillStatus::Inactive).len(), 2);
    }

    #[tokio::test]
    async fn export_import_replaces_content() {
        let source = SkillRegistry::new();
        source.add(skill("alpha")).await;
        source.add(skill("beta")).await;
        let export = source.export();
        assert_eq!(export.version, EXPORT_VERSION);

        let target = SkillRegistry::new();
        target.add(skill("stale")).await;
        let rx = target.events().subscribe();
        target.import(export).await;

        assert_eq!(target.names(), vec!["alpha", "beta"]);
        assert_eq!(drain_names(&rx), vec!["registry:imported"]);
    }

    #[tokio::test]
    async fn export_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/registry.json");
        let registry = SkillRegistry::new();
        registry.add(skill("alpha").with_skill_dependencies(["beta"])).await;
        registry.export().save(&path).unwrap();

        let loaded = RegistryExport::load(&path).unwrap();
        assert_eq!(loaded.skills.len(), 1);
        assert_eq!(loaded.skills[0].skill_dependencies(), ["beta".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutations_never_interleave() {
        let registry = Arc::new(SkillRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let name = format!("skill-{}", i % 8);
                registry.add(skill(&name)).await
            }));
        }
        let mut added = 0;
        for handle in handles {
            if handle.await.unwrap() {
                added += 1;
            }
        }
        assert_eq!(added, 8);
        assert_eq!(registry.len(), 8);
    }

    #[tokio::test]
    async fn mutations_complete_in_issue_order() {
        let registry = Arc::new(SkillRegistry::new());
        let rx = registry.events().subscribe();

        // Hold the gate so both operations queue up behind it.
        let guard = registry.gate.lock().await;
        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.add(skill("queued")).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.remove("queued").await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        assert!(first.await.unwrap());
        assert!(second.await.unwrap());
        assert_eq!(
            drain_names(&rx),
            vec!["registry:skill-added", "registry:skill-removed"]
        );
    }
}
