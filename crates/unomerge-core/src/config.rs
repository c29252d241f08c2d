use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;
use std::path::PathBuf;

/// Runtime configuration for the consolidation pipeline.
///
/// Loaded from an optional `Config.toml` next to the binary; every field has
/// a hard default so the tool runs with no file present. The volume roots
/// are fixed for the lifetime of a run — they are read here once and passed
/// to each component through `RunContext`, never held as globals.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// First (authoritative-seed) source volume.
    #[serde(default = "default_unoe_root")]
    pub unoe_root: String,

    /// Second (overlay) source volume.
    #[serde(default = "default_dose_root")]
    pub dose_root: String,

    /// Destination volume root. Every write the pipeline performs lands
    /// under this path.
    #[serde(default = "default_dest_root")]
    pub dest_root: String,

    /// Overrides the default run-directory location
    /// (`<dest_root>/90_System_Artifacts/Consolidation_Logs`).
    #[serde(default)]
    pub log_root: Option<String>,

    /// Destination ownership policy (tom:sambashare on the target host).
    #[serde(default = "default_owner_uid")]
    pub owner_uid: u32,
    #[serde(default = "default_owner_gid")]
    pub owner_gid: u32,

    /// Extra glob patterns excluded from copying, on top of the two
    /// always-excluded Windows system directories.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Hardlink dedupe subprocess: tool name plus leading arguments. The
    /// destination subtrees are appended at invocation time.
    #[serde(default = "default_dedupe_tool")]
    pub dedupe_tool: String,
    #[serde(default = "default_dedupe_args")]
    pub dedupe_args: Vec<String>,
}

fn default_unoe_root() -> String {
    "/mnt/UNOE".to_string()
}

fn default_dose_root() -> String {
    "/mnt/DOSE".to_string()
}

fn default_dest_root() -> String {
    "/srv/UNO".to_string()
}

fn default_owner_uid() -> u32 {
    1000
}

fn default_owner_gid() -> u32 {
    1002
}

fn default_dedupe_tool() -> String {
    "hardlink".to_string()
}

fn default_dedupe_args() -> Vec<String> {
    vec!["-v".to_string()]
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            unoe_root: default_unoe_root(),
            dose_root: default_dose_root(),
            dest_root: default_dest_root(),
            log_root: None,
            owner_uid: default_owner_uid(),
            owner_gid: default_owner_gid(),
            ignore_patterns: Vec::new(),
            dedupe_tool: default_dedupe_tool(),
            dedupe_args: default_dedupe_args(),
        }
    }
}

impl AppConfig {
    /// Directory the run directories live under, unless the CLI overrides it.
    pub fn log_root(&self) -> PathBuf {
        match &self.log_root {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(&self.dest_root)
                .join("90_System_Artifacts")
                .join("Consolidation_Logs"),
        }
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}
