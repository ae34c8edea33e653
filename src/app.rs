use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cli::{Cli, OutputMode};
use crate::config::Config;
use crate::core::graph::DependencyGraph;
use crate::core::registry::{RegistryExport, SkillRegistry};
use crate::core::resolver::EnvironmentPresence;
use crate::error::Result;
use crate::events::EventBus;

pub const PROJECT_DIR: &str = ".skillforge";

pub struct AppContext {
    pub project_root: PathBuf,
    pub registry_path: PathBuf,
    pub config: Config,
    pub registry: SkillRegistry,
    pub events: EventBus,
    pub output_mode: OutputMode,
    pub verbosity: u8,
}

impl AppContext {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let project_root = find_project_root(&cwd);
        let config = Config::load(cli.config.as_deref(), &project_root)?;
        let registry_path = cli
            .registry
            .clone()
            .unwrap_or_else(|| project_root.join(PROJECT_DIR).join("registry.json"));

        let events = EventBus::new();
        let registry = if registry_path.exists() {
            let export = RegistryExport::load(&registry_path)?;
            debug!(path = %registry_path.display(), skills = export.skills.len(), "registry loaded");
            SkillRegistry::from_skills(export.skills, events.clone())
        } else {
            debug!(path = %registry_path.display(), "no registry file, starting empty");
            SkillRegistry::with_events(events.clone())
        };

        Ok(Self {
            project_root,
            registry_path,
            config,
            registry,
            events,
            output_mode: cli.output_mode(),
            verbosity: cli.verbose,
        })
    }

    #[must_use]
    pub const fn robot(&self) -> bool {
        matches!(self.output_mode, OutputMode::Robot)
    }

    /// Dependency graph over every registered skill.
    #[must_use]
    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::from_skills(&self.registry.all(), self.events.clone())
    }

    #[must_use]
    pub fn presence(&self) -> EnvironmentPresence {
        self.config.presence()
    }
}

/// Nearest ancestor holding a `.skillforge` directory, else `start`.
fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_DIR).is_dir())
        .unwrap_or(start)
        .to_path_buf()
}
