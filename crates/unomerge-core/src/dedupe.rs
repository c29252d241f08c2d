use crate::error::Error;
use crate::run::RunContext;
use crate::taxonomy::DEDUPE_SUBTREES;
use std::fs;
use std::io::Write;
use std::process::Command;
use tracing::{info, warn};

/// Invoke the hardlink dedupe tool over the content subtrees.
///
/// The tool's only contract: file contents must not change, only inode
/// identity among identical files may be collapsed. Its output is captured
/// to three log files — full report, per-action trace (stderr), and the
/// trailing space-savings summary.
pub fn run_dedupe(ctx: &RunContext) -> Result<(), Error> {
    let subtrees: Vec<_> = DEDUPE_SUBTREES
        .iter()
        .map(|s| ctx.dest_root().join(s))
        .filter(|p| p.is_dir())
        .collect();
    if subtrees.is_empty() {
        warn!("No dedupe subtrees present under {}", ctx.dest_root().display());
        return Ok(());
    }

    let mut command = Command::new(&ctx.config.dedupe_tool);
    command.args(&ctx.config.dedupe_args);
    command.args(&subtrees);

    if ctx.dry_run {
        info!("Dry run: would invoke {:?}", command);
        let mut report = fs::File::create(ctx.dedupe_log_path("report"))?;
        writeln!(report, "dry_run: {:?}", command)?;
        return Ok(());
    }

    ctx.set_action(&format!("dedupe: running {}", ctx.config.dedupe_tool));
    info!("Invoking {:?}", command);
    let output = command.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::MissingTool(ctx.config.dedupe_tool.clone())
        } else {
            Error::Io(e)
        }
    })?;

    fs::write(ctx.dedupe_log_path("report"), &output.stdout)?;
    fs::write(ctx.dedupe_log_path("actions"), &output.stderr)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let summary: Vec<&str> = stdout.lines().rev().take(20).collect();
    let mut summary_file = fs::File::create(ctx.dedupe_log_path("summary"))?;
    for line in summary.into_iter().rev() {
        writeln!(summary_file, "{line}")?;
    }

    if !output.status.success() {
        return Err(Error::Other(format!(
            "{} exited with {}",
            ctx.config.dedupe_tool, output.status
        )));
    }
    info!("Dedupe complete over {} subtrees", subtrees.len());
    Ok(())
}
