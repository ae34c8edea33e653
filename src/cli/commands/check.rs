//! skillforge check - evaluate one permission against the configured policy.

use std::process::ExitCode;

use clap::Args;

use crate::app::AppContext;
use crate::cli::commands::exit_for;
use crate::cli::output::{HumanLayout, emit_human, emit_robot, robot_failed, robot_ok};
use crate::error::{Result, SkillError};
use crate::sandbox::permissions::{Permission, PermissionChecker, PermissionKind};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Permission type, e.g. filesystem:read or system:exec
    pub kind: String,

    /// Path, URL or command line to check
    pub scope: String,
}

pub fn run(ctx: &AppContext, args: &CheckArgs) -> Result<ExitCode> {
    let kind: PermissionKind = args.kind.parse().map_err(SkillError::ValidationFailed)?;
    let checker = PermissionChecker::new(ctx.config.permission_policy());
    let result = checker.check(&Permission::new(kind, &args.scope, "requested from the command line"));

    if ctx.robot() {
        if result.granted {
            emit_robot(&robot_ok(&result))?;
        } else {
            let reason = result.denial_reason.clone().unwrap_or_default();
            emit_robot(&robot_failed("permission_denied", reason, &result))?;
        }
        return Ok(exit_for(result.granted));
    }

    let mut layout = HumanLayout::new();
    let label = format!("{kind} {}", args.scope);
    if result.granted {
        layout.ok(&format!("Granted: {label}"));
    } else {
        layout.fail(&format!("Denied: {label}"));
        if let Some(reason) = &result.denial_reason {
            layout.kv("Reason", reason);
        }
        if let Some(fix) = &result.suggested_fix {
            layout.kv("Fix", fix);
        }
    }
    emit_human(layout);
    Ok(exit_for(result.granted))
}
