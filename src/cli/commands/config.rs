//! skillforge config - show the effective configuration.

use std::process::ExitCode;

use clap::Args;

use crate::app::AppContext;
use crate::cli::output::{emit_robot, robot_ok};
use crate::error::{Result, SkillError};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print the derived permission policy instead
    #[arg(long)]
    pub policy: bool,
}

pub fn run(ctx: &AppContext, args: &ConfigArgs) -> Result<ExitCode> {
    if ctx.robot() {
        if args.policy {
            emit_robot(&robot_ok(ctx.config.permission_policy()))?;
        } else {
            emit_robot(&robot_ok(&ctx.config))?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let rendered = if args.policy {
        toml::to_string_pretty(&ctx.config.permission_policy())
    } else {
        toml::to_string_pretty(&ctx.config)
    }
    .map_err(|err| SkillError::Serialization(format!("render config: {err}")))?;
    println!("{rendered}");
    Ok(ExitCode::SUCCESS)
}
