//! skillforge graph - dependency graph statistics, cycles and ordering.

use std::process::ExitCode;

use clap::Args;
use serde::Serialize;
use tracing::debug;

use crate::app::AppContext;
use crate::cli::commands::exit_for;
use crate::cli::output::{HumanLayout, emit_human, emit_robot, robot_ok};
use crate::core::graph::{CircularDependency, GraphStats};
use crate::error::Result;

#[derive(Args, Debug)]
pub struct GraphArgs {
    /// Print a dependency-first order over these skills
    #[arg(long, num_args = 1..)]
    pub order: Vec<String>,

    /// Max cycles to display
    #[arg(long, default_value = "10")]
    pub limit: usize,
}

#[derive(Serialize)]
struct GraphReport {
    stats: GraphStats,
    cycles: Vec<CircularDependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order: Option<Option<Vec<String>>>,
}

pub fn run(ctx: &AppContext, args: &GraphArgs) -> Result<ExitCode> {
    let graph = ctx.graph();
    let stats = graph.stats();
    let cycles = graph.detect_cycles();
    let order = (!args.order.is_empty()).then(|| graph.topological_sort(&args.order));
    debug!(nodes = stats.total_skills, cycles = cycles.len(), "graph analysed");

    let sortable = !matches!(order, Some(None));
    if ctx.robot() {
        emit_robot(&robot_ok(GraphReport {
            stats,
            cycles,
            order,
        }))?;
        return Ok(exit_for(sortable));
    }

    let mut layout = HumanLayout::new();
    layout
        .title("Dependency graph")
        .kv("Skills", &stats.total_skills.to_string())
        .kv("Dependencies", &stats.total_dependencies.to_string())
        .kv("With dependencies", &stats.skills_with_dependencies.to_string())
        .kv("Max dependencies", &stats.max_dependencies.to_string())
        .kv("Average", &format!("{:.2}", stats.average_dependencies))
        .blank();

    if cycles.is_empty() {
        layout.ok("No circular dependencies");
    } else {
        layout.section(&format!("Cycles ({})", cycles.len()));
        for cycle in cycles.iter().take(args.limit) {
            layout.fail(&cycle.cycle.join(" -> "));
        }
    }

    match order {
        Some(Some(order)) => {
            layout.blank().section("Execution order");
            for (i, name) in order.iter().enumerate() {
                layout.push_line(format!("{:>3}. {name}", i + 1));
            }
        }
        Some(None) => {
            layout
                .blank()
                .fail("Cannot order the requested skills: the graph contains a cycle");
        }
        None => {}
    }

    emit_human(layout);
    Ok(exit_for(sortable))
}
