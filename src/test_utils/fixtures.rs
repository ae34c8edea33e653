use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::core::registry::{RegistryExport, SkillRegistry};
use crate::core::skill::Skill;
use crate::events::EventBus;

/// Skill with the given skill dependencies and nothing else declared.
#[must_use]
pub fn skill(name: &str, deps: &[&str]) -> Skill {
    Skill::new(name, "1.0.0", format!("{name} skill")).with_skill_dependencies(deps.iter().copied())
}

/// `app -> (left, right) -> base`
#[must_use]
pub fn diamond_skills() -> Vec<Skill> {
    vec![
        skill("app", &["left", "right"]),
        skill("left", &["base"]),
        skill("right", &["base"]),
        skill("base", &[]),
    ]
}

/// `s0 <- s1 <- ... <- s{len-1}`, each skill depending on the previous one.
#[must_use]
pub fn chain_skills(len: usize) -> Vec<Skill> {
    (0..len)
        .map(|i| {
            let deps: Vec<String> = if i == 0 { Vec::new() } else { vec![format!("s{}", i - 1)] };
            Skill::new(format!("s{i}"), "1.0.0", format!("step {i}"))
                .with_skill_dependencies(deps)
        })
        .collect()
}

/// Isolated workspace directory for executor and CLI tests.
pub struct WorkspaceFixture {
    pub temp_dir: TempDir,
    pub root: PathBuf,
}

impl Default for WorkspaceFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceFixture {
    #[must_use]
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        // Temp dirs can sit behind symlinks (macOS /var).
        let root = temp_dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp dir");
        Self { temp_dir, root }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn create_file(&self, relative_path: &str, content: &str) -> PathBuf {
        let full_path = self.root.join(relative_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        std::fs::write(&full_path, content).expect("Failed to write file");
        full_path
    }

    #[must_use]
    pub fn read_file(&self, relative_path: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(relative_path)).ok()
    }

    /// Write `skills` as a registry export under `.skillforge/registry.json`.
    pub fn write_registry(&self, skills: Vec<Skill>) -> PathBuf {
        let registry = SkillRegistry::from_skills(skills, EventBus::new());
        let path = self.root.join(".skillforge/registry.json");
        registry
            .export()
            .save(&path)
            .expect("Failed to save registry export");
        path
    }

    /// Write `.skillforge/config.toml`.
    pub fn write_config(&self, content: &str) -> PathBuf {
        self.create_file(".skillforge/config.toml", content)
    }

    #[must_use]
    pub fn load_registry(&self) -> RegistryExport {
        RegistryExport::load(&self.root.join(".skillforge/registry.json"))
            .expect("Failed to load registry export")
    }
}
