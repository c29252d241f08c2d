pub mod collision;
pub mod config;
pub mod copy;
pub mod dedupe;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod pipeline;
pub mod preflight;
pub mod provenance;
pub mod run;
pub mod sampler;
pub mod selftest;
pub mod taxonomy;
pub mod verify;

pub use config::AppConfig;
pub use error::Error;
pub use pipeline::{Phase, PhaseReporter, Pipeline, SilentReporter};
pub use run::RunContext;
pub use taxonomy::Origin;
