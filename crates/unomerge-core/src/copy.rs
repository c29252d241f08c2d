use crate::error::Error;
use crate::metadata;
use crate::provenance::ProvenanceStore;
use crate::run::RunContext;
use crate::taxonomy::{self, Origin, Route, TaxonomyMap};
use filetime::FileTime;
use glob::Pattern;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, error, info, warn};

pub const FILE_MODE: u32 = 0o660;
pub const DIR_MODE: u32 = 0o2775;

/// How the engine treats a destination file that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Seeding pass: the destination mirrors the source, replacing stale
    /// content.
    Authoritative,
    /// Layering pass: an existing destination file is never overwritten;
    /// the collision is deferred to the resolver.
    Overlay,
}

#[derive(Debug, Default, Clone)]
pub struct CopyStats {
    pub files_copied: usize,
    pub files_up_to_date: usize,
    pub files_skipped_existing: usize,
    pub files_excluded: usize,
    pub files_unreadable: usize,
    pub bytes_copied: u64,
}

/// Mirrors one source volume into the destination taxonomy.
///
/// The walk is a recursive descent, one `read_dir` per level: unreadable
/// entries are logged and skipped, write failures are fatal to the phase.
pub struct CopyEngine<'a> {
    ctx: &'a RunContext,
    store: &'a ProvenanceStore,
    origin: Origin,
    mode: CopyMode,
    ignore: Vec<Pattern>,
    log: BufWriter<File>,
    stats: CopyStats,
}

impl<'a> CopyEngine<'a> {
    pub fn new(
        ctx: &'a RunContext,
        store: &'a ProvenanceStore,
        origin: Origin,
        mode: CopyMode,
    ) -> Result<Self, Error> {
        let ignore = compile_ignore_patterns(&ctx.config.ignore_patterns);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.copy_log_path(origin.as_str()))?;
        Ok(CopyEngine {
            ctx,
            store,
            origin,
            mode,
            ignore,
            log: BufWriter::new(log_file),
            stats: CopyStats::default(),
        })
    }

    /// Copy the whole volume: every depth-1 directory through the taxonomy,
    /// plus loose top-level files.
    pub fn copy_volume(mut self, map: &TaxonomyMap) -> Result<CopyStats, Error> {
        let source_root = match self.origin {
            Origin::Unoe => self.ctx.unoe_root().to_path_buf(),
            Origin::Dose => self.ctx.dose_root().to_path_buf(),
        };
        info!(
            "{}: copying {} -> {} ({:?})",
            self.origin,
            source_root.display(),
            self.ctx.dest_root().display(),
            self.mode
        );

        for entry in sorted_entries(&source_root)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    self.note("unreadable", &path);
                    error!("Unreadable entry {}: {}", path.display(), e);
                    self.stats.files_unreadable += 1;
                    continue;
                }
            };

            let route = if file_type.is_dir() {
                map.classify_top_level_dir(self.origin, &name)
            } else if file_type.is_file() {
                map.classify_root_file(self.origin, &name)
            } else {
                // Symlinks and specials are not part of the consolidation.
                self.note("skipped_special", &path);
                continue;
            };

            match route {
                Route::Excluded => {
                    self.note("excluded", &path);
                    self.stats.files_excluded += 1;
                }
                Route::Bucket(subpath) | Route::Unmapped(subpath) => {
                    let dest = self.ctx.dest_root().join(subpath);
                    if file_type.is_dir() {
                        self.ctx.set_action(&format!(
                            "copy {}: mirroring {}",
                            self.origin,
                            path.display()
                        ));
                        self.mirror_tree(&path, &dest)?;
                    } else {
                        self.copy_file(&path, &dest)?;
                    }
                }
            }
        }

        self.log.flush()?;
        info!(
            "{}: copied {} files ({} bytes), {} up-to-date, {} deferred, {} excluded, {} unreadable",
            self.origin,
            self.stats.files_copied,
            self.stats.bytes_copied,
            self.stats.files_up_to_date,
            self.stats.files_skipped_existing,
            self.stats.files_excluded,
            self.stats.files_unreadable
        );
        Ok(self.stats)
    }

    fn mirror_tree(&mut self, source_dir: &Path, dest_dir: &Path) -> Result<(), Error> {
        if !self.ctx.dry_run {
            ensure_dir(dest_dir, &self.ctx.config)?;
        }

        let entries = match sorted_entries(source_dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.note("unreadable", source_dir);
                error!("Unreadable directory {}: {}", source_dir.display(), e);
                self.stats.files_unreadable += 1;
                return Ok(());
            }
        };

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if taxonomy::is_excluded_name(&name) {
                self.note("excluded", &path);
                self.stats.files_excluded += 1;
                continue;
            }
            if self.ignore.iter().any(|p| p.matches_path(&path)) {
                self.note("ignored", &path);
                self.stats.files_excluded += 1;
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    self.note("unreadable", &path);
                    error!("Unreadable entry {}: {}", path.display(), e);
                    self.stats.files_unreadable += 1;
                    continue;
                }
            };
            if file_type.is_dir() {
                self.mirror_tree(&path, &dest_dir.join(&name))?;
            } else if file_type.is_file() {
                self.copy_file(&path, &dest_dir.join(&name))?;
            } else {
                self.note("skipped_special", &path);
            }
        }
        Ok(())
    }

    /// Copy a single file according to the mode. Source read errors skip
    /// the file; destination write errors abort the phase.
    fn copy_file(&mut self, source: &Path, dest: &Path) -> Result<(), Error> {
        let src_meta = match metadata::read_side_meta(source) {
            Ok(m) => m,
            Err(e) => {
                self.note("unreadable", source);
                error!("Unreadable source file {}: {}", source.display(), e);
                self.stats.files_unreadable += 1;
                return Ok(());
            }
        };

        if dest.exists() {
            match self.mode {
                CopyMode::Overlay => {
                    // Deferred to the collision resolver.
                    self.note("skipped_existing", dest);
                    self.stats.files_skipped_existing += 1;
                    return Ok(());
                }
                CopyMode::Authoritative => {
                    let dest_sha = metadata::sha256_file(dest)?;
                    if dest_sha == src_meta.sha256 {
                        self.note("up_to_date", dest);
                        self.stats.files_up_to_date += 1;
                        self.record_provenance(source, dest, &src_meta)?;
                        return Ok(());
                    }
                }
            }
        }

        if self.ctx.dry_run {
            self.note("would_copy", dest);
            self.stats.files_copied += 1;
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            ensure_dir(parent, &self.ctx.config)?;
        }
        fs::copy(source, dest)?;
        restore_times_and_mode(source, dest, &self.ctx.config)?;

        self.note("copied", dest);
        self.stats.files_copied += 1;
        self.stats.bytes_copied += src_meta.size;
        self.record_provenance(source, dest, &src_meta)?;
        Ok(())
    }

    fn record_provenance(
        &mut self,
        source: &Path,
        dest: &Path,
        src_meta: &metadata::SideMeta,
    ) -> Result<(), Error> {
        let create_time = metadata::windows_create_time(source);
        self.store.append_verified(
            self.ctx.dest_root(),
            dest,
            self.origin,
            source,
            src_meta,
            &create_time,
        )?;
        Ok(())
    }

    fn note(&mut self, action: &str, path: &Path) {
        let _ = writeln!(self.log, "{}\t{}", action, path.display());
    }
}

/// Post-copy comparison pass: re-walk the volume in the same mode and list
/// every file the engine would still copy. A non-empty report is a soft
/// warning, not a failure.
pub fn compare_volume(
    ctx: &RunContext,
    origin: Origin,
    mode: CopyMode,
    map: &TaxonomyMap,
) -> Result<usize, Error> {
    let source_root = match origin {
        Origin::Unoe => ctx.unoe_root().to_path_buf(),
        Origin::Dose => ctx.dose_root().to_path_buf(),
    };
    let report_path = ctx.compare_log_path(origin.as_str());
    let mut report = BufWriter::new(File::create(&report_path)?);
    let ignore = compile_ignore_patterns(&ctx.config.ignore_patterns);
    let mut differences = 0usize;

    for entry in sorted_entries(&source_root)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        let route = if file_type.is_dir() {
            map.classify_top_level_dir(origin, &name)
        } else if file_type.is_file() {
            map.classify_root_file(origin, &name)
        } else {
            continue;
        };
        if let Route::Bucket(subpath) | Route::Unmapped(subpath) = route {
            let dest = ctx.dest_root().join(subpath);
            if file_type.is_dir() {
                compare_tree(&path, &dest, mode, &ignore, &mut report, &mut differences)?;
            } else {
                compare_file(&path, &dest, mode, &mut report, &mut differences)?;
            }
        }
    }

    report.flush()?;
    if differences > 0 {
        warn!(
            "{}: comparison pass found {} residual differences, see {}",
            origin,
            differences,
            report_path.display()
        );
    } else {
        debug!("{}: comparison pass clean", origin);
    }
    Ok(differences)
}

fn compare_tree(
    source_dir: &Path,
    dest_dir: &Path,
    mode: CopyMode,
    ignore: &[Pattern],
    report: &mut BufWriter<File>,
    differences: &mut usize,
) -> Result<(), Error> {
    let entries = match sorted_entries(source_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if taxonomy::is_excluded_name(&name) || ignore.iter().any(|p| p.matches_path(&path)) {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            compare_tree(&path, &dest_dir.join(&name), mode, ignore, report, differences)?;
        } else if file_type.is_file() {
            compare_file(&path, &dest_dir.join(&name), mode, report, differences)?;
        }
    }
    Ok(())
}

fn compare_file(
    source: &Path,
    dest: &Path,
    mode: CopyMode,
    report: &mut BufWriter<File>,
    differences: &mut usize,
) -> Result<(), Error> {
    if !dest.exists() {
        writeln!(report, "missing\t{}", dest.display())?;
        *differences += 1;
        return Ok(());
    }
    if mode == CopyMode::Overlay {
        // Existing destinations are the resolver's business in overlay mode.
        return Ok(());
    }
    let src_md = match fs::metadata(source) {
        Ok(md) => md,
        Err(_) => return Ok(()),
    };
    let dst_md = fs::metadata(dest)?;
    if src_md.len() != dst_md.len() {
        writeln!(report, "size\t{}", dest.display())?;
        *differences += 1;
    } else if metadata::mtime_unix(&src_md) != metadata::mtime_unix(&dst_md) {
        writeln!(report, "mtime\t{}", dest.display())?;
        *differences += 1;
    }
    Ok(())
}

/// Create a destination directory (and its parents) with the directory
/// policy: `rwxrwsr-x`, configured owner. Ownership failures degrade to a
/// warning so unprivileged runs stay usable.
pub fn ensure_dir(dir: &Path, config: &crate::config::AppConfig) -> Result<(), Error> {
    if dir.exists() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        ensure_dir(parent, config)?;
    }
    fs::create_dir(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))?;
    apply_ownership(dir, config);
    Ok(())
}

/// Restore the source mtime and apply the file mode/ownership policy to a
/// freshly written destination file.
pub fn restore_times_and_mode(
    source: &Path,
    dest: &Path,
    config: &crate::config::AppConfig,
) -> Result<(), Error> {
    let src_md = fs::metadata(source)?;
    let mtime = FileTime::from_last_modification_time(&src_md);
    filetime::set_file_mtime(dest, mtime)?;
    fs::set_permissions(dest, fs::Permissions::from_mode(FILE_MODE))?;
    apply_ownership(dest, config);
    Ok(())
}

fn apply_ownership(path: &Path, config: &crate::config::AppConfig) {
    let result =
        std::os::unix::fs::chown(path, Some(config.owner_uid), Some(config.owner_gid));
    if let Err(e) = result {
        warn!("chown {} failed: {}", path.display(), e);
    }
}

fn compile_ignore_patterns(globs: &[String]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|g| match Pattern::new(g) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", g, e);
                None
            }
        })
        .collect()
}

/// Deterministic directory listing: entries sorted by name.
pub fn sorted_entries(dir: &Path) -> std::io::Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}
