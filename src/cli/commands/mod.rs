//! CLI command implementations
//!
//! Each subcommand has its own module with an Args struct and a `run()`
//! function returning the process exit code.

use std::process::ExitCode;

use clap::Subcommand;

pub mod activate;
pub mod chain;
pub mod check;
pub mod config;
pub mod graph;
pub mod resolve;
pub mod run;

use crate::app::AppContext;
use crate::error::Result;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dependency graph statistics, cycles and ordering
    Graph(graph::GraphArgs),

    /// Resolve a skill's dependencies
    Resolve(resolve::ResolveArgs),

    /// Build an execution chain for one or more skills
    Chain(chain::ChainArgs),

    /// Activate skills with their dependencies
    Activate(activate::ActivateArgs),

    /// Check a permission against the configured policy
    Check(check::CheckArgs),

    /// Run a command through the sandboxed executor
    Run(run::RunArgs),

    /// Show the effective configuration
    Config(config::ConfigArgs),
}

/// Dispatch a command to its handler
pub fn run(ctx: &AppContext, command: &Commands) -> Result<ExitCode> {
    match command {
        Commands::Graph(args) => graph::run(ctx, args),
        Commands::Resolve(args) => resolve::run(ctx, args),
        Commands::Chain(args) => chain::run(ctx, args),
        Commands::Activate(args) => activate::run(ctx, args),
        Commands::Check(args) => check::run(ctx, args),
        Commands::Run(args) => run::run(ctx, args),
        Commands::Config(args) => config::run(ctx, args),
    }
}

/// Exit code for a yes/no outcome.
pub(crate) fn exit_for(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
