use crate::error::Error;
use crate::run::RunContext;
use std::env;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment inventory before anything touches the volumes.
///
/// Fatal findings: the dedupe tool absent from `PATH`, or a mutating run
/// without root. Everything observed is written to the preflight dump in
/// the run directory.
pub fn run_preflight(ctx: &RunContext) -> Result<(), Error> {
    ctx.set_action("preflight: inventory");

    let tool_path = find_in_path(&ctx.config.dedupe_tool)
        .ok_or_else(|| Error::MissingTool(ctx.config.dedupe_tool.clone()))?;

    let euid = rustix::process::geteuid();
    if !euid.is_root() && !ctx.dry_run {
        return Err(Error::NotPrivileged(format!(
            "mutating phases need root, running as uid {}",
            euid.as_raw()
        )));
    }

    for (label, root) in [
        ("UNOE", ctx.unoe_root()),
        ("DOSE", ctx.dose_root()),
        ("UNO", ctx.dest_root()),
    ] {
        if !root.is_dir() {
            return Err(Error::Other(format!(
                "{} volume root missing: {}",
                label,
                root.display()
            )));
        }
    }

    let mut dump = fs::File::create(ctx.preflight_path())?;
    writeln!(dump, "run_id={}", ctx.run_id)?;
    writeln!(dump, "dry_run={}", ctx.dry_run)?;
    writeln!(dump, "euid={}", euid.as_raw())?;
    writeln!(dump, "dedupe_tool={}", tool_path.display())?;
    for (key, root) in [
        ("unoe", ctx.unoe_root()),
        ("dose", ctx.dose_root()),
        ("dest", ctx.dest_root()),
    ] {
        writeln!(dump, "{}_root={}", key, root.display())?;
        writeln!(dump, "{}_root_exists={}", key, root.is_dir())?;
        match rustix::fs::stat(root) {
            Ok(stat) => writeln!(dump, "{}_root_device={}", key, stat.st_dev)?,
            Err(e) => writeln!(dump, "{}_root_device=unavailable ({})", key, e)?,
        }
    }
    if let Ok(stat) = rustix::fs::statvfs(ctx.dest_root()) {
        writeln!(dump, "dest_free_bytes={}", stat.f_bavail * stat.f_frsize)?;
        writeln!(dump, "dest_total_bytes={}", stat.f_blocks * stat.f_frsize)?;
    }

    info!("Preflight passed, dump at {}", ctx.preflight_path().display());
    Ok(())
}

/// Search `PATH` for an executable, like the shell would.
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = Path::new(tool);
        return is_executable(path).then(|| path.to_path_buf());
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_ubiquitous_tool() {
        assert!(find_in_path("sh").is_some());
    }

    #[test]
    fn rejects_a_nonexistent_tool() {
        assert!(find_in_path("definitely-not-a-real-tool-7f3a").is_none());
    }

    #[test]
    fn absolute_candidates_bypass_path_search() {
        assert!(find_in_path("/bin/sh").is_some());
        assert!(find_in_path("/bin/definitely-not-here").is_none());
    }
}
