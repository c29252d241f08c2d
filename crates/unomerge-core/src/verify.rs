use crate::error::Error;
use crate::run::RunContext;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::info;

/// Counts and byte total of the destination at one point in time. Bytes
/// follow `du`-style accounting of real blocks, so hardlink deduplication
/// shows up as a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSnapshot {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

pub fn snapshot(root: &Path) -> Result<DestinationSnapshot, Error> {
    let mut snap = DestinationSnapshot {
        files: 0,
        dirs: 0,
        bytes: 0,
    };
    walk(root, &mut snap)?;
    Ok(snap)
}

fn walk(dir: &Path, snap: &mut DestinationSnapshot) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            snap.dirs += 1;
            walk(&entry.path(), snap)?;
        } else if file_type.is_file() {
            let md = entry.metadata()?;
            snap.files += 1;
            snap.bytes += md.blocks() * 512;
        }
    }
    Ok(())
}

/// Record the destination snapshot for the given stage (`pre` or `post`).
pub fn write_snapshot(ctx: &RunContext, stage: &str) -> Result<DestinationSnapshot, Error> {
    ctx.set_action(&format!("verify: counting destination ({stage})"));
    let snap = snapshot(ctx.dest_root())?;
    let mut file = fs::File::create(ctx.counts_path(stage))?;
    writeln!(file, "files={}", snap.files)?;
    writeln!(file, "dirs={}", snap.dirs)?;
    writeln!(file, "bytes={}", snap.bytes)?;
    info!(
        "{}-dedupe snapshot: {} files, {} dirs, {} bytes",
        stage, snap.files, snap.dirs, snap.bytes
    );
    Ok(snap)
}
