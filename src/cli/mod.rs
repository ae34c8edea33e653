//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

pub mod commands;
pub mod output;

pub use commands::Commands;
pub use output::OutputMode;

#[derive(Parser, Debug)]
#[command(
    name = "skillforge",
    version,
    about = "Resolve skill dependencies, plan chains and run scripts in a sandbox"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true, env = "SKILLFORGE_ROBOT")]
    pub robot: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence all logging
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Use only this config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Registry export to load skills from
    #[arg(long, global = true, env = "SKILLFORGE_REGISTRY")]
    pub registry: Option<PathBuf>,
}

impl Cli {
    #[must_use]
    pub const fn output_mode(&self) -> OutputMode {
        if self.robot {
            OutputMode::Robot
        } else {
            OutputMode::Human
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["skillforge", "graph", "--robot", "-vv"]).unwrap();
        assert!(cli.robot);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.output_mode(), OutputMode::Robot));
    }

    #[test]
    fn run_collects_trailing_arguments() {
        let cli = Cli::try_parse_from([
            "skillforge",
            "run",
            "--no-checkpoint",
            "sh",
            "-c",
            "echo hi",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.no_checkpoint);
        assert_eq!(args.command, "sh");
        assert_eq!(args.args, vec!["-c", "echo hi"]);
    }
}
