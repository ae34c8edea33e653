//! Error types for skillforge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SkillError {
    /// Stable machine-readable code for robot output.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::MissingConfig(_) => "missing_config",
            Self::ValidationFailed(_) => "validation_failed",
            Self::SkillNotFound(_) => "skill_not_found",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Sandbox(_) => "sandbox_error",
            Self::Spawn { .. } => "spawn_failed",
            Self::Checkpoint(_) => "checkpoint_error",
            Self::Execution(_) => "execution_failed",
            Self::InvalidState(_) => "invalid_state",
            Self::Serialization(_) | Self::Json(_) => "serialization_error",
            Self::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SkillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_displays_message_verbatim() {
        let err = SkillError::PermissionDenied(
            "Permission denied:\nsystem:exec: Command \"rm\" is blocked".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "Permission denied:\nsystem:exec: Command \"rm\" is blocked"
        );
        assert_eq!(err.code(), "permission_denied");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SkillError = io.into();
        assert!(matches!(err, SkillError::Io(_)));
        assert_eq!(err.code(), "io_error");
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn spawn_error_names_command() {
        let err = SkillError::Spawn {
            command: "nonexistent-tool".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().starts_with("Failed to spawn nonexistent-tool"));
        assert_eq!(err.code(), "spawn_failed");
    }
}
