use crate::collision;
use crate::copy::{self, CopyEngine, CopyMode};
use crate::dedupe;
use crate::error::Error;
use crate::manifest;
use crate::preflight;
use crate::provenance::ProvenanceStore;
use crate::run::RunContext;
use crate::sampler;
use crate::taxonomy::{Origin, TaxonomyMap, SKELETON};
use crate::verify;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info};

/// The nine pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preflight,
    Prepare,
    CopyUnoe,
    OverlayDose,
    Resolve,
    VerifyPre,
    Dedupe,
    Manifest,
    VerifyPost,
}

pub const ALL_PHASES: [Phase; 9] = [
    Phase::Preflight,
    Phase::Prepare,
    Phase::CopyUnoe,
    Phase::OverlayDose,
    Phase::Resolve,
    Phase::VerifyPre,
    Phase::Dedupe,
    Phase::Manifest,
    Phase::VerifyPost,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Prepare => "prepare",
            Phase::CopyUnoe => "copy-unoe",
            Phase::OverlayDose => "overlay-dose",
            Phase::Resolve => "resolve",
            Phase::VerifyPre => "verify-pre",
            Phase::Dedupe => "dedupe",
            Phase::Manifest => "manifest",
            Phase::VerifyPost => "verify-post",
        }
    }

    pub fn parse(name: &str) -> Option<Phase> {
        ALL_PHASES.iter().copied().find(|p| p.as_str() == name)
    }
}

/// Callbacks for phase progress.
///
/// The CLI implements this with colored console output; everything has a
/// default no-op so library users can ignore it.
pub trait PhaseReporter: Send + Sync {
    fn on_phase_start(&self, _phase: &str) {}
    fn on_phase_complete(&self, _phase: &str, _duration_secs: f64) {}
}

/// No-op reporter for silent operation.
pub struct SilentReporter;

impl PhaseReporter for SilentReporter {}

/// Sequences the phases over one run directory.
pub struct Pipeline<'a> {
    ctx: &'a RunContext,
    map: TaxonomyMap,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Pipeline {
            ctx,
            map: TaxonomyMap::standard(),
        }
    }

    /// Run every phase in order.
    pub fn run_all(&self, reporter: &dyn PhaseReporter) -> Result<(), Error> {
        for phase in ALL_PHASES {
            self.run_phase(phase, reporter)?;
        }
        Ok(())
    }

    /// Run a single phase. On failure the error carries the current-action
    /// label so the dying step is named.
    pub fn run_phase(&self, phase: Phase, reporter: &dyn PhaseReporter) -> Result<(), Error> {
        self.ctx.set_action(&format!("{}: starting", phase.as_str()));
        reporter.on_phase_start(phase.as_str());
        let start = Instant::now();

        let result = match phase {
            Phase::Preflight => self.preflight(),
            Phase::Prepare => self.prepare(),
            Phase::CopyUnoe => self.copy_volume(Origin::Unoe, CopyMode::Authoritative),
            Phase::OverlayDose => self.copy_volume(Origin::Dose, CopyMode::Overlay),
            Phase::Resolve => self.resolve(),
            Phase::VerifyPre => self.verify_stage("pre"),
            Phase::Dedupe => dedupe::run_dedupe(self.ctx),
            Phase::Manifest => manifest::build_manifest(self.ctx).map(|_| ()),
            Phase::VerifyPost => self.verify_post(),
        };

        match result {
            Ok(()) => {
                let duration = start.elapsed().as_secs_f64();
                info!("Phase {} complete in {:.2}s", phase.as_str(), duration);
                reporter.on_phase_complete(phase.as_str(), duration);
                Ok(())
            }
            Err(e) => {
                let label = self.ctx.action();
                error!(
                    "Phase {} failed at '{}' (run dir {})",
                    phase.as_str(),
                    label,
                    self.ctx.run_dir.display()
                );
                Err(e.at(&label))
            }
        }
    }

    fn preflight(&self) -> Result<(), Error> {
        self.ctx.ensure_run_dir()?;
        preflight::run_preflight(self.ctx)
    }

    fn prepare(&self) -> Result<(), Error> {
        self.ctx.set_action("prepare: destination skeleton");
        if self.ctx.dry_run {
            info!("Dry run: skipping destination skeleton creation");
            return Ok(());
        }
        for subpath in SKELETON {
            copy::ensure_dir(&self.ctx.dest_root().join(subpath), &self.ctx.config)?;
        }
        self.ctx.ensure_run_dir()?;
        Ok(())
    }

    fn copy_volume(&self, origin: Origin, mode: CopyMode) -> Result<(), Error> {
        self.ctx.ensure_run_dir()?;
        let store = ProvenanceStore::open(&self.ctx.provenance_path())?;
        let engine = CopyEngine::new(self.ctx, &store, origin, mode)?;
        engine.copy_volume(&self.map)?;
        self.ctx
            .set_action(&format!("copy {}: comparison pass", origin));
        copy::compare_volume(self.ctx, origin, mode, &self.map)?;
        Ok(())
    }

    fn resolve(&self) -> Result<(), Error> {
        self.ctx.ensure_run_dir()?;
        let store = ProvenanceStore::open(&self.ctx.provenance_path())?;
        collision::resolve_conflicts(self.ctx, &store, &self.map)?;
        Ok(())
    }

    fn verify_stage(&self, stage: &str) -> Result<(), Error> {
        self.ctx.ensure_run_dir()?;
        verify::write_snapshot(self.ctx, stage)?;
        sampler::hash_sample(self.ctx, stage)?;
        Ok(())
    }

    /// Post-dedupe verification also proves the sample hashes survived the
    /// dedupe untouched.
    fn verify_post(&self) -> Result<(), Error> {
        self.verify_stage("post")?;

        self.ctx.set_action("verify-post: comparing hash samples");
        let pre = sampler::read_sample(&self.ctx.sample_csv_path("pre"))?;
        let post = sampler::read_sample(&self.ctx.sample_csv_path("post"))?;
        let post_by_path: HashMap<&str, &str> = post
            .iter()
            .map(|row| (row.relative_path.as_str(), row.sha256.as_str()))
            .collect();

        let mut mismatches = 0usize;
        for row in &pre {
            match post_by_path.get(row.relative_path.as_str()) {
                Some(sha) if *sha == row.sha256 => {}
                Some(_) => {
                    error!("Content changed across dedupe: {}", row.relative_path);
                    mismatches += 1;
                }
                None => {
                    error!("Sampled file absent after dedupe: {}", row.relative_path);
                    mismatches += 1;
                }
            }
        }
        if mismatches > 0 {
            return Err(Error::Other(format!(
                "{mismatches} sampled files changed or vanished during dedupe"
            )));
        }
        info!("Hash sample stable across dedupe: {} files", pre.len());
        Ok(())
    }
}
