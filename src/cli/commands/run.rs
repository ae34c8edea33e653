//! skillforge run - execute a command through the sandboxed executor.
//!
//! The command line itself is checked as a `system:exec` permission, so the
//! program must appear in the configured allowed commands. Ctrl-C cancels
//! the run and terminates the child.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use tracing::{info, warn};

use crate::app::AppContext;
use crate::cli::output::{HumanLayout, emit_human, emit_robot, robot_failed, robot_ok};
use crate::error::Result;
use crate::execution::executor::{ExecutionOptions, ExecutionResult, Script, ScriptExecutor};
use crate::execution::tracker::ExecutionStatus;
use crate::sandbox::permissions::{Permission, PermissionChecker, PermissionKind};

/// Exit code reported when the run hit its timeout.
const TIMEOUT_EXIT: u8 = 124;
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Working directory (defaults to the workspace root)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Name recorded for the run (defaults to the program name)
    #[arg(long)]
    pub name: Option<String>,

    /// Kill the run after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Inherit the parent environment instead of the whitelist
    #[arg(long)]
    pub no_sandbox: bool,

    /// Skip the pre-run checkpoint
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Restore the checkpoint when the run fails
    #[arg(long)]
    pub auto_rollback: bool,

    /// Terminate the run on memory or time violations
    #[arg(long)]
    pub enforce_limits: bool,

    /// Extra permission to request, as type=scope (repeatable)
    #[arg(long = "permission", value_name = "TYPE=SCOPE", value_parser = parse_permission)]
    pub permissions: Vec<Permission>,

    /// Environment variable for the child, as KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Program to run
    pub command: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn run(ctx: &AppContext, args: &RunArgs) -> Result<ExitCode> {
    let workspace = ctx.config.workspace_root();
    let working_dir = args.cwd.as_ref().map_or_else(
        || workspace.clone(),
        |dir| if dir.is_absolute() { dir.clone() } else { workspace.join(dir) },
    );

    let script = build_script(args, working_dir);
    let options = build_options(ctx, args);
    let executor = ScriptExecutor::new(
        PermissionChecker::new(ctx.config.permission_policy()),
        ctx.events.clone(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(execute_until_interrupted(&executor, &script, &options));
    runtime.block_on(executor.shutdown());
    let result = result?;

    if ctx.robot() {
        if result.success {
            emit_robot(&robot_ok(&result))?;
        } else {
            let code = if result.timed_out { "timeout" } else { "execution_failed" };
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| format!("Script finished with status {}", result.status));
            emit_robot(&robot_failed(code, message, &result))?;
        }
    } else {
        emit_human(render(&result));
    }

    Ok(exit_code(&result))
}

fn build_script(args: &RunArgs, working_dir: PathBuf) -> Script {
    let name = args.name.clone().unwrap_or_else(|| program_label(&args.command));
    let command_line = std::iter::once(args.command.as_str())
        .chain(args.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");

    let mut script = Script::new(name, &args.command, working_dir)
        .with_args(args.args.iter().cloned())
        .with_permission(Permission::new(
            PermissionKind::SystemExec,
            command_line,
            "run the requested command",
        ));
    for permission in &args.permissions {
        script = script.with_permission(permission.clone());
    }
    script
}

fn build_options(ctx: &AppContext, args: &RunArgs) -> ExecutionOptions {
    let mut options = ctx.config.execution_options();
    if let Some(ms) = args.timeout_ms {
        options.timeout = Some(Duration::from_millis(ms));
    }
    if args.no_sandbox {
        options.sandbox = false;
    }
    if args.no_checkpoint {
        options.create_checkpoint = false;
    }
    if args.auto_rollback {
        options.auto_rollback_on_error = true;
    }
    if args.enforce_limits {
        options.enforce_limits = true;
    }
    options.env.extend(args.env.iter().cloned());
    options
}

async fn execute_until_interrupted(
    executor: &ScriptExecutor,
    script: &Script,
    options: &ExecutionOptions,
) -> Result<ExecutionResult> {
    let run = executor.execute(script, options);
    tokio::pin!(run);
    loop {
        tokio::select! {
            result = &mut run => return result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "cannot listen for ctrl-c");
                    return run.await;
                }
                for state in executor.tracker().active() {
                    info!(execution_id = %state.execution_id, "interrupt received, cancelling");
                    if let Err(err) = executor.cancel(&state.execution_id) {
                        warn!(execution_id = %state.execution_id, error = %err, "cancel failed");
                    }
                }
            }
        }
    }
}

fn render(result: &ExecutionResult) -> HumanLayout {
    let mut layout = HumanLayout::new();
    let headline = format!(
        "{} ({}) {} in {}ms",
        result.script.name,
        result.execution_id,
        result.status,
        result.duration.as_millis()
    );
    if result.success {
        layout.ok(&headline);
    } else {
        layout.fail(&headline);
    }
    layout.kv("Exit code", &result.exit_code.to_string());
    if let Some(error) = &result.error {
        layout.kv("Error", error);
    }
    if let Some(checkpoint) = &result.checkpoint_id {
        layout.kv("Checkpoint", checkpoint);
    }
    if result.rolled_back {
        layout.warn("Changes were rolled back");
    }

    if !result.changes.is_empty() {
        layout.blank().section("Changed files");
        for change in &result.changes {
            layout.bullet(&format!("{:?} {}", change.operation, change.path.display()));
        }
    }
    if !result.resource_violations.is_empty() {
        layout.blank().section("Resource violations");
        for violation in &result.resource_violations {
            layout.warn(&violation.message);
        }
    }

    for (label, text) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            continue;
        }
        layout.blank().section(label);
        for line in &lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..] {
            layout.push_line(*line);
        }
    }
    layout
}

fn exit_code(result: &ExecutionResult) -> ExitCode {
    if result.success {
        return ExitCode::SUCCESS;
    }
    if result.timed_out || result.status == ExecutionStatus::Timeout {
        return ExitCode::from(TIMEOUT_EXIT);
    }
    u8::try_from(result.exit_code)
        .ok()
        .filter(|code| *code != 0)
        .map_or(ExitCode::FAILURE, ExitCode::from)
}

fn program_label(command: &str) -> String {
    std::path::Path::new(command)
        .file_name()
        .map_or_else(|| command.to_string(), |name| name.to_string_lossy().into_owned())
}

fn parse_permission(raw: &str) -> std::result::Result<Permission, String> {
    let (kind, scope) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=SCOPE, got '{raw}'"))?;
    let kind: PermissionKind = kind.trim().parse()?;
    Ok(Permission::new(kind, scope.trim(), "requested from the command line"))
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}
