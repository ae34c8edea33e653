//! skillforge - skill orchestration engine.
//!
//! Resolves skill dependency graphs, plans ordered execution chains, tracks
//! activation, and runs scripts under permission checks, resource limits
//! and file checkpoints.

pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod execution;
pub mod sandbox;
pub mod security;
pub mod test_utils;

pub use error::{Result, SkillError};
