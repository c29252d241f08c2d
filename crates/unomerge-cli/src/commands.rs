use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "unomerge")]
#[command(about = "Consolidate the UNOE and DOSE volumes onto UNO", long_about = None)]
pub struct Cli {
    /// Skip destructive operations in the copy/resolve/dedupe phases;
    /// detection and comparison passes still run
    #[arg(long)]
    pub dry_run: bool,

    /// Phase to run: preflight, prepare, copy-unoe, overlay-dose, resolve,
    /// verify-pre, dedupe, manifest, verify-post, or all
    #[arg(long, default_value = "all")]
    pub phase: String,

    /// Run identifier; defaults to the launch timestamp. Re-using an id
    /// continues into the existing run directory
    #[arg(long)]
    pub run_id: Option<String>,

    /// Run-directory location, overriding the default under the
    /// destination volume
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Run the lightweight CSV/syntax self-check and exit; touches no
    /// volume and needs no privilege
    #[arg(long)]
    pub self_test: bool,
}
