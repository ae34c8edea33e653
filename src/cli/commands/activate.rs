//! skillforge activate - activate skills and report the active set.

use std::process::ExitCode;

use clap::Args;
use serde::Serialize;

use crate::app::AppContext;
use crate::cli::commands::exit_for;
use crate::cli::output::{HumanLayout, emit_human, emit_robot, robot_failed, robot_ok};
use crate::core::activator::{ActivationResult, SkillActivator, TriggerMatcher};
use crate::core::chain::SkillChain;
use crate::core::resolver::DependencyResolver;
use crate::error::{Result, SkillError};

#[derive(Args, Debug)]
pub struct ActivateArgs {
    /// Skills to activate
    pub skills: Vec<String>,

    /// Pick skills from free text by name or trigger
    #[arg(long = "match", value_name = "TEXT", conflicts_with = "skills")]
    pub match_text: Option<String>,

    /// Activate a single match without asking
    #[arg(long, requires = "match_text")]
    pub auto: bool,

    /// Also plan a chain over the resulting active set
    #[arg(long)]
    pub chain: bool,
}

#[derive(Serialize)]
struct ActivationReport<'a> {
    result: &'a ActivationResult,
    active: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain: Option<SkillChain>,
}

pub fn run(ctx: &AppContext, args: &ActivateArgs) -> Result<ExitCode> {
    if args.skills.is_empty() && args.match_text.is_none() {
        return Err(SkillError::ValidationFailed(
            "name at least one skill or pass --match".to_string(),
        ));
    }

    let graph = ctx.graph();
    let presence = ctx.presence();
    let resolver = DependencyResolver::with_presence(&graph, &ctx.registry, &presence);
    let mut activator =
        SkillActivator::with_options(resolver, ctx.events.clone(), ctx.config.activator_options());

    let result = match &args.match_text {
        Some(text) => {
            let matcher = TriggerMatcher::new(&ctx.registry);
            activator.activate_by_keywords(text, &matcher, args.auto || ctx.config.activation.auto_activate_single_match)
        }
        None => activator.activate_multiple(&args.skills),
    };
    let chain = (args.chain && activator.active_count() > 0)
        .then(|| activator.build_chain_for_active(None));
    let ok = result.success();

    if ctx.robot() {
        let report = ActivationReport {
            result: &result,
            active: activator.active_skills(),
            chain,
        };
        if ok {
            emit_robot(&robot_ok(report))?;
        } else if result.requires_user_selection {
            emit_robot(&robot_failed(
                "selection_required",
                "several skills match; name one explicitly",
                report,
            ))?;
        } else {
            let message = result
                .failed
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            emit_robot(&robot_failed("activation_failed", message, report))?;
        }
        return Ok(exit_for(ok));
    }

    let mut layout = HumanLayout::new();
    layout.title("Activation");
    for name in &result.activated {
        layout.ok(&format!("Activated {name}"));
    }
    for failure in &result.failed {
        layout.fail(&format!("{}: {}", failure.skill, failure.message));
        for error in &failure.errors {
            layout.bullet(error);
        }
    }
    if !result.suggestions.is_empty() {
        layout.warn("Several skills match; name one explicitly:");
        for name in &result.suggestions {
            layout.bullet(name);
        }
    } else if args.match_text.is_some() && result.activated.is_empty() && result.failed.is_empty() {
        layout.warn("No skills match");
    }

    layout
        .blank()
        .kv("Active", &activator.active_skills().join(", "))
        .kv(
            "Limit",
            &format!("{}/{}", activator.active_count(), activator.max_active_skills()),
        );

    if let Some(chain) = &chain {
        layout.blank().section("Chain");
        for step in &chain.steps {
            layout.push_line(format!("{:>3}. {}", step.step_number, step.skill));
        }
    }

    emit_human(layout);
    Ok(exit_for(ok))
}
