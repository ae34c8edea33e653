//! Running scripts: checkpoints, tracking and the orchestrating executor.

pub mod executor;
pub mod rollback;
pub mod tracker;

pub use executor::{ExecutionOptions, ExecutionResult, Script, ScriptExecutor};
pub use rollback::{ChangeKind, Checkpoint, CheckpointOptions, FileChange, RollbackManager, RollbackResult};
pub use tracker::{ExecutionState, ExecutionStatus, ExecutionTracker, OutputLine, OutputStream};
