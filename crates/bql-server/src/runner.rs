//! Script runner for `bql run`

use std::path::Path;

use anyhow::Context;
use bql_engine::Engine;
use tracing::{error, info};

/// Summary of a script run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub failed: usize,
}

/// Execute every statement of `script`, printing results to stdout.
///
/// Relative file paths inside the script resolve against the script's
/// directory. Without `keep_going` the first failing statement stops the run.
pub fn run_script(engine: &mut Engine, script: &Path, keep_going: bool) -> anyhow::Result<RunSummary> {
    let text = std::fs::read_to_string(script)
        .with_context(|| format!("reading script {}", script.display()))?;
    if let Some(dir) = script.parent().filter(|d| !d.as_os_str().is_empty()) {
        engine.set_base_dir(dir);
    }

    let statements = bql_ast::parse_script(&text)
        .with_context(|| format!("parsing script {}", script.display()))?;
    info!(script = %script.display(), statements = statements.len(), "Running script");

    let mut summary = RunSummary::default();
    for stmt in &statements {
        println!("bql> {stmt};");
        match engine.execute(stmt) {
            Ok(result) => {
                summary.executed += 1;
                println!("{}", result.render());
            }
            Err(e) => {
                summary.failed += 1;
                error!(statement = stmt.kind(), error = %e, "Statement failed");
                eprintln!("error: {e}");
                if !keep_going {
                    break;
                }
            }
        }
    }
    Ok(summary)
}
