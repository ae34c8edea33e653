//! skillforge chain - plan an ordered execution chain.

use std::process::ExitCode;

use clap::Args;

use crate::app::AppContext;
use crate::cli::commands::exit_for;
use crate::cli::output::{HumanLayout, emit_human, emit_robot, robot_failed, robot_ok};
use crate::core::chain::{ChainBuilder, SkillChain, validate_chain};
use crate::core::resolver::DependencyResolver;
use crate::error::Result;

#[derive(Args, Debug)]
pub struct ChainArgs {
    /// Target skills
    #[arg(required = true)]
    pub skills: Vec<String>,

    /// Task description carried on the chain
    #[arg(long)]
    pub task: Option<String>,
}

pub fn run(ctx: &AppContext, args: &ChainArgs) -> Result<ExitCode> {
    let graph = ctx.graph();
    let presence = ctx.presence();
    let resolver = DependencyResolver::with_presence(&graph, &ctx.registry, &presence);
    let builder = ChainBuilder::new(resolver, ctx.events.clone());

    let chain = match (args.skills.as_slice(), args.task.as_deref()) {
        ([single], None) => builder.build_chain(single),
        (many, task) => builder.build_multi_skill_chain(many, task),
    };
    let validation = validate_chain(&chain);
    let ok = chain.is_ready() && validation.valid;

    if ctx.robot() {
        let mut warnings = chain.warnings.clone();
        warnings.extend(validation.warnings.iter().cloned());
        let response = if ok {
            robot_ok(&chain)
        } else {
            let mut errors = chain.errors.clone();
            errors.extend(validation.errors.iter().cloned());
            robot_failed("chain_invalid", errors.join("; "), &chain)
        };
        emit_robot(&response.with_warnings(warnings))?;
        return Ok(exit_for(ok));
    }

    let mut layout = render(&chain);
    for error in &validation.errors {
        layout.fail(error);
    }
    for warning in &validation.warnings {
        layout.warn(warning);
    }
    emit_human(layout);
    Ok(exit_for(ok))
}

fn render(chain: &SkillChain) -> HumanLayout {
    let mut layout = HumanLayout::new();
    layout.title(&format!("Chain for {}", chain.skill));
    if let Some(task) = &chain.task {
        layout.kv("Task", task);
    }
    layout
        .kv("Steps", &chain.steps.len().to_string())
        .kv("Estimated", &format!("{}s", chain.estimated_duration_secs))
        .blank();

    for step in &chain.steps {
        let action = if step.action.is_empty() {
            String::new()
        } else {
            format!(" - {}", step.action)
        };
        layout.push_line(format!("{:>3}. {}{action}", step.step_number, step.skill));
    }

    if !chain.permissions.is_empty() {
        layout.blank().section("Permissions");
        for permission in &chain.permissions {
            let marker = if permission.required { "" } else { " (optional)" };
            layout.bullet(&format!("{} {}{marker}", permission.kind, permission.scope));
        }
    }

    if !chain.errors.is_empty() || !chain.warnings.is_empty() {
        layout.blank();
    }
    for error in &chain.errors {
        layout.fail(error);
    }
    for warning in &chain.warnings {
        layout.warn(warning);
    }
    layout
}
