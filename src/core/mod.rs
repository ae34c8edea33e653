//! Core skill types and dependency logic

pub mod activator;
pub mod chain;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod skill;

pub use activator::{
    ActivationFailure, ActivationFailureReason, ActivationResult, ActivatorOptions, ActiveSkill,
    SkillActivator, SkillMatcher, TriggerMatcher,
};
pub use chain::{ChainBuilder, ChainStatus, ChainStep, SkillChain, StepStatus, validate_chain};
pub use graph::{CircularDependency, DependencyGraph, GraphStats};
pub use registry::{RegistryExport, SkillRegistry};
pub use resolver::{
    AssumePresent, DependencyResolution, DependencyResolver, EnvironmentPresence, PackageSpec,
    PresenceCheck, ResolutionErrorKind,
};
pub use skill::{Skill, SkillStatus};
