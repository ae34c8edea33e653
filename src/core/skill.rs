//! Skill data model.
//!
//! A [`Skill`] is the already-parsed form of a skill package descriptor.
//! Discovery and parsing live outside this crate; everything here consumes
//! the parsed value.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SkillError};
use crate::sandbox::permissions::Permission;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    Active,
    #[default]
    Inactive,
    Error,
}

impl SkillStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SkillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillDependencies {
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub apis: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(default)]
    pub parameters: Vec<CapabilityParameter>,
}

impl SkillCapability {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            script: None,
            usage: None,
            parameters: Vec::new(),
        }
    }
}

/// Files or stores a skill reads from and writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillIntegration {
    #[serde(default)]
    pub reads_from: Vec<String>,
    #[serde(default)]
    pub writes_to: Vec<String>,
    #[serde(default)]
    pub influences: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillConfig {
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub dependencies: SkillDependencies,
    #[serde(default)]
    pub capabilities: Vec<SkillCapability>,
    #[serde(default)]
    pub config: SkillConfig,
    #[serde(default)]
    pub npm_scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub integration: SkillIntegration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub metadata: SkillMetadata,
    #[serde(default)]
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub status: SkillStatus,
}

impl Skill {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            metadata: SkillMetadata {
                name: name.into(),
                version: version.into(),
                description: description.into(),
                author: None,
                license: None,
                triggers: Vec::new(),
                dependencies: SkillDependencies::default(),
                capabilities: Vec::new(),
                config: SkillConfig::default(),
                npm_scripts: BTreeMap::new(),
                integration: SkillIntegration::default(),
            },
            path: PathBuf::new(),
            last_modified: Utc::now(),
            status: SkillStatus::Inactive,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn skill_dependencies(&self) -> &[String] {
        &self.metadata.dependencies.skills
    }

    #[must_use]
    pub fn depends_on(&self, other: &str) -> bool {
        self.metadata.dependencies.skills.iter().any(|dep| dep == other)
    }

    #[must_use]
    pub fn with_skill_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.dependencies.skills = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.dependencies.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_apis<I, S>(mut self, apis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.dependencies.apis = apis.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: SkillCapability) -> Self {
        self.metadata.capabilities.push(capability);
        self
    }

    #[must_use]
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.metadata.config.permissions.push(permission);
        self
    }

    #[must_use]
    pub fn with_npm_script(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.metadata.npm_scripts.insert(name.into(), command.into());
        self
    }

    #[must_use]
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = Some(author.into());
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: SkillStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_integration(mut self, integration: SkillIntegration) -> Self {
        self.metadata.integration = integration;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.trim().is_empty() {
            return Err(SkillError::ValidationFailed(
                "skill name must be non-empty".to_string(),
            ));
        }
        if self.metadata.version.trim().is_empty() {
            return Err(SkillError::ValidationFailed(format!(
                "skill {} must declare a version",
                self.metadata.name
            )));
        }
        if self.depends_on(&self.metadata.name) {
            return Err(SkillError::ValidationFailed(format!(
                "skill {} cannot depend on itself",
                self.metadata.name
            )));
        }
        Ok(())
    }
}
