use crate::config::AppConfig;
use crate::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Everything a phase needs to know about the invocation it belongs to.
///
/// A run is identified by `run_id`; re-invoking any phase with the same id
/// continues into the existing run directory. The context also carries the
/// current-action label that gets surfaced when a phase dies.
pub struct RunContext {
    pub config: AppConfig,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub dry_run: bool,
    action: Mutex<String>,
}

/// Default run identifier: launch timestamp, `YYYY-MM-DD_HHMMSS`.
pub fn default_run_id() -> String {
    chrono::Utc::now().format("%Y-%m-%d_%H%M%S").to_string()
}

impl RunContext {
    pub fn new(
        config: AppConfig,
        run_id: Option<String>,
        log_dir: Option<PathBuf>,
        dry_run: bool,
    ) -> Self {
        let run_id = run_id.unwrap_or_else(default_run_id);
        let log_root = log_dir.unwrap_or_else(|| config.log_root());
        let run_dir = log_root.join(&run_id);
        RunContext {
            config,
            run_id,
            run_dir,
            dry_run,
            action: Mutex::new(String::from("idle")),
        }
    }

    /// Create the run directory if it does not exist yet. Idempotent.
    pub fn ensure_run_dir(&self) -> Result<(), Error> {
        if !self.run_dir.exists() {
            fs::create_dir_all(&self.run_dir)?;
            info!("Created run directory {}", self.run_dir.display());
        }
        Ok(())
    }

    /// Update the current-action label. Called at phase boundaries and at
    /// entry to long-running steps.
    pub fn set_action(&self, label: &str) {
        if let Ok(mut action) = self.action.lock() {
            *action = label.to_string();
        }
    }

    pub fn action(&self) -> String {
        self.action
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|_| String::from("unknown"))
    }

    pub fn dest_root(&self) -> &Path {
        Path::new(&self.config.dest_root)
    }

    pub fn unoe_root(&self) -> &Path {
        Path::new(&self.config.unoe_root)
    }

    pub fn dose_root(&self) -> &Path {
        Path::new(&self.config.dose_root)
    }

    // Persisted-artifact locations, all under the run directory.

    pub fn preflight_path(&self) -> PathBuf {
        self.run_dir.join("preflight.txt")
    }

    pub fn copy_log_path(&self, origin: &str) -> PathBuf {
        self.run_dir.join(format!("copy_{}.log", origin.to_lowercase()))
    }

    pub fn compare_log_path(&self, origin: &str) -> PathBuf {
        self.run_dir
            .join(format!("compare_{}.log", origin.to_lowercase()))
    }

    pub fn candidates_path(&self) -> PathBuf {
        self.run_dir.join("collision_candidates.csv")
    }

    pub fn resolutions_path(&self) -> PathBuf {
        self.run_dir.join("collision_resolutions.csv")
    }

    pub fn collision_actions_path(&self) -> PathBuf {
        self.run_dir.join("collision_actions.log")
    }

    pub fn provenance_path(&self) -> PathBuf {
        self.run_dir.join("provenance.csv")
    }

    pub fn counts_path(&self, stage: &str) -> PathBuf {
        self.run_dir.join(format!("counts_{}_dedupe.txt", stage))
    }

    pub fn sample_paths_path(&self) -> PathBuf {
        self.run_dir.join("hash_sample_paths.txt")
    }

    pub fn sample_csv_path(&self, stage: &str) -> PathBuf {
        self.run_dir.join(format!("hash_sample_{}.csv", stage))
    }

    pub fn dedupe_log_path(&self, kind: &str) -> PathBuf {
        self.run_dir.join(format!("dedupe_{}.log", kind))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join("create_time_manifest.csv")
    }

    pub fn manifest_missing_path(&self) -> PathBuf {
        self.run_dir.join("create_time_missing.csv")
    }

    pub fn instructions_path(&self) -> PathBuf {
        self.run_dir.join("WINDOWS_APPLY_INSTRUCTIONS.txt")
    }
}
