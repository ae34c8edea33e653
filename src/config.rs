use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::activator::ActivatorOptions;
use crate::core::resolver::EnvironmentPresence;
use crate::error::{Result, SkillError};
use crate::execution::executor::ExecutionOptions;
use crate::execution::rollback::CheckpointOptions;
use crate::sandbox::permissions::PermissionPolicy;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
}

impl Config {
    /// Defaults, then the global and project files (or only the explicit
    /// file), then `SKILLFORGE_*` environment overrides.
    pub fn load(explicit_path: Option<&Path>, project_root: &Path) -> Result<Self> {
        let mut config = Self::default();

        let explicit = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("SKILLFORGE_CONFIG").ok().map(PathBuf::from));

        if let Some(path) = explicit {
            match Self::load_patch(&path)? {
                Some(patch) => config.merge_patch(patch),
                None => {
                    return Err(SkillError::MissingConfig(format!(
                        "config file {} not found",
                        path.display()
                    )));
                }
            }
        } else {
            if let Some(global) = Self::load_global()? {
                config.merge_patch(global);
            }
            if let Some(project) = Self::load_project(project_root)? {
                config.merge_patch(project);
            }
        }

        config.apply_env_overrides()?;
        if config.security.workspace_root.is_none() {
            config.security.workspace_root = Some(project_root.to_path_buf());
        }
        config.validate()?;

        Ok(config)
    }

    /// Parse a full TOML document over the defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let patch: ConfigPatch =
            toml::from_str(raw).map_err(|err| SkillError::Config(format!("parse config: {err}")))?;
        let mut config = Self::default();
        config.merge_patch(patch);
        Ok(config)
    }

    fn load_global() -> Result<Option<ConfigPatch>> {
        let Some(dir) = dirs::config_dir() else {
            return Ok(None);
        };
        Self::load_patch(&dir.join("skillforge/config.toml"))
    }

    fn load_project(project_root: &Path) -> Result<Option<ConfigPatch>> {
        Self::load_patch(&project_root.join(".skillforge/config.toml"))
    }

    fn load_patch(path: &Path) -> Result<Option<ConfigPatch>> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|err| SkillError::Config(format!("read config {}: {err}", path.display())))?;
        let patch = toml::from_str(&raw)
            .map_err(|err| SkillError::Config(format!("parse config {}: {err}", path.display())))?;
        Ok(Some(patch))
    }

    fn merge_patch(&mut self, patch: ConfigPatch) {
        if let Some(patch) = patch.activation {
            self.activation.merge(patch);
        }
        if let Some(patch) = patch.security {
            self.security.merge(patch);
        }
        if let Some(patch) = patch.execution {
            self.execution.merge(patch);
        }
        if let Some(patch) = patch.checkpoint {
            self.checkpoint.merge(patch);
        }
        if let Some(patch) = patch.presence {
            self.presence.merge(patch);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SKILLFORGE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let env = EnvSource(&lookup);

        if let Some(value) = env.parse::<usize>("SKILLFORGE_MAX_ACTIVE_SKILLS")? {
            self.activation.max_active_skills = value;
        }

        if let Some(value) = env.flag("SKILLFORGE_ALLOW_NETWORK") {
            self.security.allow_network = value;
        }
        if let Some(value) = env.flag("SKILLFORGE_ALLOW_ENV_ACCESS") {
            self.security.allow_env_access = value;
        }
        if let Some(values) = env.list("SKILLFORGE_ALLOWED_COMMANDS") {
            self.security.allowed_commands = merge_unique(values, &self.security.allowed_commands);
        }
        if let Some(values) = env.list("SKILLFORGE_BLOCKED_COMMANDS") {
            self.security.blocked_commands = merge_unique(values, &self.security.blocked_commands);
        }
        if let Some(values) = env.list("SKILLFORGE_ALLOWED_DOMAINS") {
            self.security.allowed_domains = merge_unique(values, &self.security.allowed_domains);
        }

        if let Some(value) = env.parse::<u64>("SKILLFORGE_TIMEOUT_MS")? {
            self.execution.timeout = Duration::from_millis(value);
        }
        if let Some(value) = env.parse::<u64>("SKILLFORGE_MAX_MEMORY_MB")? {
            self.execution.max_memory_mb = value;
        }
        if let Some(value) = env.flag("SKILLFORGE_SANDBOX") {
            self.execution.sandbox = value;
        }
        if let Some(value) = env.flag("SKILLFORGE_AUTO_ROLLBACK") {
            self.execution.auto_rollback_on_error = value;
        }

        if let Some(values) = env.list("SKILLFORGE_CHECKPOINT_EXCLUDE") {
            self.checkpoint.exclude = merge_unique(values, &self.checkpoint.exclude);
        }
        if let Some(values) = env.list("SKILLFORGE_AVAILABLE_APIS") {
            self.presence.available_apis = merge_unique(values, &self.presence.available_apis);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.activation.max_active_skills == 0 {
            return Err(SkillError::Config(
                "activation.max_active_skills must be at least 1".to_string(),
            ));
        }
        if self.execution.timeout.is_zero() {
            return Err(SkillError::Config(
                "execution.timeout must be greater than 0".to_string(),
            ));
        }
        if self.execution.max_memory_mb == 0 {
            return Err(SkillError::Config(
                "execution.max_memory_mb must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn workspace_root(&self) -> PathBuf {
        self.security
            .workspace_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[must_use]
    pub const fn activator_options(&self) -> ActivatorOptions {
        ActivatorOptions {
            max_active_skills: self.activation.max_active_skills,
            allow_reactivation: self.activation.allow_reactivation,
        }
    }

    /// Workspace policy with the configured lists applied. Relative paths
    /// resolve against the workspace root.
    #[must_use]
    pub fn permission_policy(&self) -> PermissionPolicy {
        let root = self.workspace_root();
        let security = &self.security;
        let mut policy = PermissionPolicy::for_workspace(&root);
        if let Some(paths) = &security.allowed_read_paths {
            policy.allowed_read_paths = paths.iter().map(|p| root.join(p)).collect();
        }
        if let Some(paths) = &security.allowed_write_paths {
            policy.allowed_write_paths = paths.iter().map(|p| root.join(p)).collect();
        }
        if let Some(paths) = &security.blocked_paths {
            policy.blocked_paths = paths.iter().map(|p| root.join(p)).collect();
        }
        policy.allow_network = security.allow_network;
        policy.allowed_domains.clone_from(&security.allowed_domains);
        policy.blocked_domains.clone_from(&security.blocked_domains);
        policy.allowed_commands.clone_from(&security.allowed_commands);
        policy.blocked_commands.clone_from(&security.blocked_commands);
        policy.allow_env_access = security.allow_env_access;
        policy
    }

    #[must_use]
    pub fn execution_options(&self) -> ExecutionOptions {
        let execution = &self.execution;
        ExecutionOptions {
            timeout: Some(execution.timeout),
            sandbox: execution.sandbox,
            allow_network: self.security.allow_network,
            max_memory_mb: execution.max_memory_mb,
            max_cpu_percent: Some(execution.max_cpu_percent),
            max_processes: Some(execution.max_processes),
            max_file_size_mb: Some(execution.max_file_size_mb),
            create_checkpoint: execution.create_checkpoint,
            auto_rollback_on_error: execution.auto_rollback_on_error,
            enforce_limits: execution.enforce_limits,
            checkpoint: self.checkpoint_options(),
            kill_grace: execution.kill_grace,
            sample_interval: execution.sample_interval,
            ..ExecutionOptions::default()
        }
    }

    #[must_use]
    pub fn checkpoint_options(&self) -> CheckpointOptions {
        CheckpointOptions {
            include: self.checkpoint.include.clone(),
            exclude: self.checkpoint.exclude.clone(),
            max_file_size: self.checkpoint.max_file_size_mb.saturating_mul(MB),
            ..CheckpointOptions::default()
        }
    }

    #[must_use]
    pub fn presence(&self) -> EnvironmentPresence {
        let root = self.workspace_root();
        EnvironmentPresence::new(
            self.presence
                .package_roots
                .iter()
                .map(|p| root.join(p))
                .collect(),
            self.presence.available_apis.iter().cloned(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    #[serde(default)]
    pub max_active_skills: usize,
    #[serde(default)]
    pub allow_reactivation: bool,
    #[serde(default)]
    pub auto_activate_single_match: bool,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            max_active_skills: 10,
            allow_reactivation: false,
            auto_activate_single_match: false,
        }
    }
}

impl ActivationConfig {
    fn merge(&mut self, patch: ActivationPatch) {
        if let Some(value) = patch.max_active_skills {
            self.max_active_skills = value;
        }
        if let Some(value) = patch.allow_reactivation {
            self.allow_reactivation = value;
        }
        if let Some(value) = patch.auto_activate_single_match {
            self.auto_activate_single_match = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// `None` keeps the workspace default.
    #[serde(default)]
    pub allowed_read_paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub allowed_write_paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub blocked_paths: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub allow_env_access: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            allowed_read_paths: None,
            allowed_write_paths: None,
            blocked_paths: None,
            allow_network: false,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            allowed_commands: ["npm", "node", "tsx", "tsc"].map(String::from).to_vec(),
            blocked_commands: ["rm", "del", "format", "shutdown"].map(String::from).to_vec(),
            allow_env_access: false,
        }
    }
}

impl SecurityConfig {
    fn merge(&mut self, patch: SecurityPatch) {
        if let Some(value) = patch.workspace_root {
            self.workspace_root = Some(value);
        }
        if let Some(values) = patch.allowed_read_paths {
            self.allowed_read_paths = Some(values);
        }
        if let Some(values) = patch.allowed_write_paths {
            self.allowed_write_paths = Some(values);
        }
        if let Some(values) = patch.blocked_paths {
            self.blocked_paths = Some(values);
        }
        if let Some(value) = patch.allow_network {
            self.allow_network = value;
        }
        if let Some(values) = patch.allowed_domains {
            self.allowed_domains = merge_unique(values, &self.allowed_domains);
        }
        if let Some(values) = patch.blocked_domains {
            self.blocked_domains = merge_unique(values, &self.blocked_domains);
        }
        if let Some(values) = patch.allowed_commands {
            self.allowed_commands = values;
        }
        if let Some(values) = patch.blocked_commands {
            self.blocked_commands = merge_unique(values, &self.blocked_commands);
        }
        if let Some(value) = patch.allow_env_access {
            self.allow_env_access = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_processes: usize,
    pub max_file_size_mb: u64,
    pub sandbox: bool,
    pub create_checkpoint: bool,
    pub auto_rollback_on_error: bool,
    pub enforce_limits: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            sample_interval: Duration::from_secs(1),
            max_memory_mb: 512,
            max_cpu_percent: 80.0,
            max_processes: 5,
            max_file_size_mb: 10,
            sandbox: true,
            create_checkpoint: true,
            auto_rollback_on_error: false,
            enforce_limits: false,
        }
    }
}

impl ExecutionConfig {
    fn merge(&mut self, patch: ExecutionPatch) {
        if let Some(value) = patch.timeout {
            self.timeout = value;
        }
        if let Some(value) = patch.kill_grace {
            self.kill_grace = value;
        }
        if let Some(value) = patch.sample_interval {
            self.sample_interval = value;
        }
        if let Some(value) = patch.max_memory_mb {
            self.max_memory_mb = value;
        }
        if let Some(value) = patch.max_cpu_percent {
            self.max_cpu_percent = value;
        }
        if let Some(value) = patch.max_processes {
            self.max_processes = value;
        }
        if let Some(value) = patch.max_file_size_mb {
            self.max_file_size_mb = value;
        }
        if let Some(value) = patch.sandbox {
            self.sandbox = value;
        }
        if let Some(value) = patch.create_checkpoint {
            self.create_checkpoint = value;
        }
        if let Some(value) = patch.auto_rollback_on_error {
            self.auto_rollback_on_error = value;
        }
        if let Some(value) = patch.enforce_limits {
            self.enforce_limits = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub max_file_size_mb: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            max_file_size_mb: 10,
        }
    }
}

impl CheckpointConfig {
    fn merge(&mut self, patch: CheckpointPatch) {
        if let Some(values) = patch.include {
            self.include = values;
        }
        if let Some(values) = patch.exclude {
            self.exclude = merge_unique(values, &self.exclude);
        }
        if let Some(value) = patch.max_file_size_mb {
            self.max_file_size_mb = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub package_roots: Vec<PathBuf>,
    #[serde(default)]
    pub available_apis: Vec<String>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            package_roots: vec![PathBuf::from("node_modules")],
            available_apis: Vec::new(),
        }
    }
}

impl PresenceConfig {
    fn merge(&mut self, patch: PresencePatch) {
        if let Some(values) = patch.package_roots {
            self.package_roots = values;
        }
        if let Some(values) = patch.available_apis {
            self.available_apis = merge_unique(values, &self.available_apis);
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigPatch {
    pub activation: Option<ActivationPatch>,
    pub security: Option<SecurityPatch>,
    pub execution: Option<ExecutionPatch>,
    pub checkpoint: Option<CheckpointPatch>,
    pub presence: Option<PresencePatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ActivationPatch {
    pub max_active_skills: Option<usize>,
    pub allow_reactivation: Option<bool>,
    pub auto_activate_single_match: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SecurityPatch {
    pub workspace_root: Option<PathBuf>,
    pub allowed_read_paths: Option<Vec<PathBuf>>,
    pub allowed_write_paths: Option<Vec<PathBuf>>,
    pub blocked_paths: Option<Vec<PathBuf>>,
    pub allow_network: Option<bool>,
    pub allowed_domains: Option<Vec<String>>,
    pub blocked_domains: Option<Vec<String>>,
    pub allowed_commands: Option<Vec<String>>,
    pub blocked_commands: Option<Vec<String>>,
    pub allow_env_access: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ExecutionPatch {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub kill_grace: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub sample_interval: Option<Duration>,
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    pub max_processes: Option<usize>,
    pub max_file_size_mb: Option<u64>,
    pub sandbox: Option<bool>,
    pub create_checkpoint: Option<bool>,
    pub auto_rollback_on_error: Option<bool>,
    pub enforce_limits: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CheckpointPatch {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub max_file_size_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PresencePatch {
    pub package_roots: Option<Vec<PathBuf>>,
    pub available_apis: Option<Vec<String>>,
}

fn merge_unique(values: Vec<String>, existing: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in values.into_iter().chain(existing.iter().cloned()) {
        if seen.insert(value.clone()) {
            out.push(value);
        }
    }
    out
}

struct EnvSource<'a>(&'a dyn Fn(&str) -> Option<String>);

impl EnvSource<'_> {
    fn flag(&self, key: &str) -> Option<bool> {
        (self.0)(key).map(|value| {
            matches!(
                value.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            Some(value) => value.trim().parse::<T>().map(Some).map_err(|err| {
                SkillError::Config(format!("invalid {key} value {value}: {err}"))
            }),
            None => Ok(None),
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        (self.0)(key).map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }
}
