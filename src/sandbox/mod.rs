//! Permission checks, resource ceilings and constrained subprocesses.

pub mod limiter;
pub mod permissions;
pub mod process;

pub use limiter::{ResourceKind, ResourceLimiter, ResourceLimits, ResourceViolation};
pub use permissions::{Permission, PermissionChecker, PermissionKind, PermissionPolicy};
pub use process::{RunOptions, Sandbox, SandboxConfig, SandboxCreator, SandboxOutput};
