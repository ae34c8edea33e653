//! skillforge resolve - resolve a skill's dependency closure.

use std::process::ExitCode;

use clap::Args;

use crate::app::AppContext;
use crate::cli::commands::exit_for;
use crate::cli::output::{HumanLayout, emit_human, emit_robot, robot_failed, robot_ok};
use crate::core::resolver::{DependencyResolution, DependencyResolver};
use crate::error::Result;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Skill names; several are resolved as one combined closure
    #[arg(required = true)]
    pub skills: Vec<String>,
}

pub fn run(ctx: &AppContext, args: &ResolveArgs) -> Result<ExitCode> {
    let graph = ctx.graph();
    let presence = ctx.presence();
    let resolver = DependencyResolver::with_presence(&graph, &ctx.registry, &presence);
    let resolution = match args.skills.as_slice() {
        [single] => resolver.resolve(single),
        many => resolver.resolve_multiple(many),
    };

    if ctx.robot() {
        let warnings = resolution.warning_messages();
        if resolution.success {
            emit_robot(&robot_ok(&resolution).with_warnings(warnings))?;
        } else {
            let message = resolution.error_messages().join("; ");
            emit_robot(
                &robot_failed("resolution_failed", message, &resolution).with_warnings(warnings),
            )?;
        }
        return Ok(exit_for(resolution.success));
    }

    emit_human(render(&resolution));
    Ok(exit_for(resolution.success))
}

fn render(resolution: &DependencyResolution) -> HumanLayout {
    let mut layout = HumanLayout::new();
    layout.title(&format!("Resolution for {}", resolution.skill));

    if resolution.success {
        layout.ok("Resolved");
    } else {
        layout.fail("Unresolved");
    }

    if !resolution.resolved.is_empty() {
        layout.blank().section("Skills (dependency first)");
        for (i, name) in resolution.resolved.iter().enumerate() {
            layout.push_line(format!("{:>3}. {name}", i + 1));
        }
    }
    if !resolution.packages.is_empty() {
        layout.blank().section("Packages");
        for package in &resolution.packages {
            layout.bullet(&package.to_string());
        }
    }
    if !resolution.apis.is_empty() {
        layout.blank().section("APIs");
        for api in &resolution.apis {
            layout.bullet(api);
        }
    }
    if !resolution.missing.is_empty() {
        layout.blank().section("Missing");
        for name in &resolution.missing {
            layout.fail(name);
        }
    }
    if !resolution.errors.is_empty() {
        layout.blank().section("Errors");
        for error in &resolution.errors {
            layout.fail(&error.message);
        }
    }
    for warning in &resolution.warnings {
        layout.warn(&warning.message);
    }
    layout
}
