use crate::copy::{restore_times_and_mode, sorted_entries};
use crate::error::Error;
use crate::metadata::{self, SideMeta};
use crate::provenance::{self, ProvenanceStore};
use crate::run::RunContext;
use crate::taxonomy::{self, Origin, Route, TaxonomyMap};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub const COLLISION_HEADERS: [&str; 12] = [
    "dest_path",
    "classification",
    "chosen_action",
    "unoe_path",
    "unoe_size",
    "unoe_mtime_utc",
    "unoe_sha256",
    "dose_path",
    "dose_size",
    "dose_mtime_utc",
    "dose_sha256",
    "resulting_paths",
];

/// One row of the candidate or resolution table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollisionRow {
    pub dest_path: String,
    pub classification: String,
    pub chosen_action: String,
    pub unoe_path: String,
    pub unoe_size: u64,
    pub unoe_mtime_utc: String,
    pub unoe_sha256: String,
    pub dose_path: String,
    pub dose_size: u64,
    pub dose_mtime_utc: String,
    pub dose_sha256: String,
    pub resulting_paths: String,
}

/// A relative path present under both sources within one paired bucket.
#[derive(Debug, Clone)]
pub struct CollisionSite {
    pub dest_rel: PathBuf,
    pub unoe_src: PathBuf,
    pub dose_src: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct ResolveStats {
    pub sites: usize,
    pub identical: usize,
    pub conflicts: usize,
    pub replaced: usize,
    pub kept_both: usize,
    pub reused: usize,
    pub hash_failures: usize,
}

/// Find every collision site: for each shared destination bucket, the
/// intersection of relative paths contributed by both sources.
///
/// The per-bucket walks fan out with rayon into a concurrent map, then the
/// intersection is sorted so resolution order is stable across runs.
pub fn discover_collision_sites(
    ctx: &RunContext,
    map: &TaxonomyMap,
) -> Result<Vec<CollisionSite>, Error> {
    let mut buckets: HashMap<PathBuf, (Vec<PathBuf>, Vec<PathBuf>)> = HashMap::new();
    for (origin, root) in [
        (Origin::Unoe, ctx.unoe_root().to_path_buf()),
        (Origin::Dose, ctx.dose_root().to_path_buf()),
    ] {
        for entry in sorted_entries(&root)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Route::Bucket(subpath) = map.classify_top_level_dir(origin, &name) {
                let slot = buckets.entry(subpath).or_default();
                match origin {
                    Origin::Unoe => slot.0.push(entry.path()),
                    Origin::Dose => slot.1.push(entry.path()),
                }
            }
        }
    }

    let mut sites = Vec::new();
    for (bucket, (unoe_dirs, dose_dirs)) in &buckets {
        if unoe_dirs.is_empty() || dose_dirs.is_empty() {
            continue;
        }
        let unoe_files = collect_relative_files(unoe_dirs);
        let dose_files = collect_relative_files(dose_dirs);
        for item in unoe_files.iter() {
            if let Some(dose_src) = dose_files.get(item.key()) {
                sites.push(CollisionSite {
                    dest_rel: bucket.join(item.key()),
                    unoe_src: item.value().clone(),
                    dose_src: dose_src.clone(),
                });
            }
        }
    }
    sites.sort_by(|a, b| a.dest_rel.cmp(&b.dest_rel));
    debug!("Discovered {} collision sites", sites.len());
    Ok(sites)
}

/// Map of path-relative-to-bucket -> absolute source path. When several
/// source directories feed the same bucket, the first (sorted) contributor
/// of a relative path wins.
fn collect_relative_files(dirs: &[PathBuf]) -> DashMap<PathBuf, PathBuf> {
    let files = DashMap::new();
    for dir in dirs {
        walk_into(dir, dir, &files);
    }
    files
}

fn walk_into(root: &Path, dir: &Path, files: &DashMap<PathBuf, PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Unreadable directory {}: {}", dir.display(), e);
            return;
        }
    };
    entries.par_bridge().for_each(|entry| {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Unreadable entry under {}: {}", dir.display(), e);
                return;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if taxonomy::is_excluded_name(&name) {
            return;
        }
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => return,
        };
        if file_type.is_dir() {
            walk_into(root, &path, files);
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                files.entry(rel.to_path_buf()).or_insert(path);
            }
        }
    });
}

// --- suffix naming ---------------------------------------------------------

fn split_stem_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// True when the stem already ends in `__UNOE`, `__DOSE`, `__UNOE_<n>`, or
/// `__DOSE_<n>` — anchored strictly at end-of-stem.
pub fn is_suffixed_stem(stem: &str) -> bool {
    for tag in ["__UNOE", "__DOSE"] {
        if let Some(idx) = stem.rfind(tag) {
            let rest = &stem[idx + tag.len()..];
            if rest.is_empty() {
                return true;
            }
            if let Some(digits) = rest.strip_prefix('_') {
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    return true;
                }
            }
        }
    }
    false
}

/// Sibling path carrying the losing origin's label between stem and
/// extension. A path that already carries a suffix is a fixed point.
pub fn suffixed_path(path: &Path, origin: Origin) -> PathBuf {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return path.to_path_buf(),
    };
    let (stem, ext) = split_stem_ext(&name);
    if is_suffixed_stem(stem) {
        return path.to_path_buf();
    }
    path.with_file_name(format!("{}__{}{}", stem, origin.as_str(), ext))
}

fn numbered_suffix_path(path: &Path, origin: Origin, n: usize) -> PathBuf {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return path.to_path_buf(),
    };
    let (stem, ext) = split_stem_ext(&name);
    path.with_file_name(format!("{}__{}_{}{}", stem, origin.as_str(), n, ext))
}

/// Find the slot for the losing side's content: the first suffixed sibling
/// that either does not exist (needs a write) or already holds exactly the
/// expected content (re-run, nothing to do).
fn free_suffix_slot(
    canonical: &Path,
    origin: Origin,
    expected_sha: &str,
) -> Result<(PathBuf, bool), Error> {
    let base = suffixed_path(canonical, origin);
    if base == canonical {
        // Already-suffixed canonical names are never re-suffixed.
        return Ok((base, false));
    }
    if !base.exists() {
        return Ok((base, true));
    }
    if metadata::sha256_file(&base)? == expected_sha {
        return Ok((base, false));
    }
    for n in 2.. {
        let candidate = numbered_suffix_path(canonical, origin, n);
        if !candidate.exists() {
            return Ok((candidate, true));
        }
        if metadata::sha256_file(&candidate)? == expected_sha {
            return Ok((candidate, false));
        }
    }
    unreachable!()
}

/// First suffixed sibling that does not exist at all, for moving aside a
/// destination matching neither source.
fn first_vacant_slot(canonical: &Path, origin: Origin) -> PathBuf {
    let base = suffixed_path(canonical, origin);
    if base != canonical && !base.exists() {
        return base;
    }
    for n in 2.. {
        let candidate = numbered_suffix_path(canonical, origin, n);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

// --- resolution ------------------------------------------------------------

struct CollisionLog {
    candidates: PathBuf,
    resolutions: PathBuf,
    actions: BufWriter<File>,
    seen_candidates: Vec<CollisionRow>,
    seen_resolutions: Vec<CollisionRow>,
}

impl CollisionLog {
    fn open(ctx: &RunContext) -> Result<Self, Error> {
        let candidates = ctx.candidates_path();
        let resolutions = ctx.resolutions_path();
        provenance::init_table(&candidates, &COLLISION_HEADERS)?;
        provenance::init_table(&resolutions, &COLLISION_HEADERS)?;
        let seen_candidates = read_rows(&candidates)?;
        let seen_resolutions = read_rows(&resolutions)?;
        let actions = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(ctx.collision_actions_path())?,
        );
        Ok(CollisionLog {
            candidates,
            resolutions,
            actions,
            seen_candidates,
            seen_resolutions,
        })
    }

    /// Append a candidate row unless an identical one is already recorded.
    fn candidate(&mut self, row: &CollisionRow) -> Result<(), Error> {
        if self.seen_candidates.contains(row) {
            return Ok(());
        }
        provenance::append_record(&self.candidates, row)?;
        self.seen_candidates.push(row.clone());
        Ok(())
    }

    fn resolution(&mut self, row: &CollisionRow) -> Result<bool, Error> {
        if self.seen_resolutions.contains(row) {
            return Ok(false);
        }
        provenance::append_record(&self.resolutions, row)?;
        self.seen_resolutions.push(row.clone());
        let _ = writeln!(
            self.actions,
            "{}\t{}\t{}",
            row.chosen_action, row.dest_path, row.resulting_paths
        );
        Ok(true)
    }
}

/// Read collision rows back from a candidate or resolution table.
pub fn read_rows(path: &Path) -> Result<Vec<CollisionRow>, Error> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    provenance::check_headers(path, &mut reader, &COLLISION_HEADERS)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: CollisionRow = record?;
        rows.push(row);
    }
    Ok(rows)
}

/// Resolve every collision between the two sources.
///
/// Policy per conflicting site: newest by strictly-greater mtime, ties
/// broken by strictly-greater size (favoring DOSE), final tie to UNOE.
/// Newest strictly larger replaces; otherwise both variants are kept, the
/// loser under an origin-suffixed sibling name.
pub fn resolve_conflicts(
    ctx: &RunContext,
    store: &ProvenanceStore,
    map: &TaxonomyMap,
) -> Result<ResolveStats, Error> {
    let mut log = CollisionLog::open(ctx)?;
    let sites = discover_collision_sites(ctx, map)?;
    let mut stats = ResolveStats {
        sites: sites.len(),
        ..ResolveStats::default()
    };

    for site in &sites {
        ctx.set_action(&format!("resolve: {}", site.dest_rel.display()));
        let (unoe_meta, dose_meta) = match (
            metadata::read_side_meta(&site.unoe_src),
            metadata::read_side_meta(&site.dose_src),
        ) {
            (Ok(u), Ok(d)) => (u, d),
            (u, d) => {
                for (side, result) in [("UNOE", &u), ("DOSE", &d)] {
                    if let Err(e) = result {
                        error!(
                            "Hash failure on {} side of {}: {}",
                            side,
                            site.dest_rel.display(),
                            e
                        );
                    }
                }
                stats.hash_failures += 1;
                continue;
            }
        };

        if unoe_meta.sha256 == dose_meta.sha256 {
            stats.identical += 1;
            resolve_identical(ctx, store, &mut log, site, &unoe_meta, &dose_meta)?;
        } else {
            stats.conflicts += 1;
            resolve_conflict(ctx, store, &mut log, site, &unoe_meta, &dose_meta, &mut stats)?;
        }
    }

    log.actions.flush()?;
    info!(
        "Resolved {} collision sites: {} identical, {} conflicts ({} replaced, {} kept both), {} hash failures",
        stats.sites, stats.identical, stats.conflicts, stats.replaced, stats.kept_both,
        stats.hash_failures
    );
    Ok(stats)
}

fn base_row(site: &CollisionSite, unoe: &SideMeta, dose: &SideMeta) -> CollisionRow {
    CollisionRow {
        dest_path: site.dest_rel.to_string_lossy().into_owned(),
        classification: String::new(),
        chosen_action: String::new(),
        unoe_path: site.unoe_src.to_string_lossy().into_owned(),
        unoe_size: unoe.size,
        unoe_mtime_utc: unoe.mtime_utc.clone(),
        unoe_sha256: unoe.sha256.clone(),
        dose_path: site.dose_src.to_string_lossy().into_owned(),
        dose_size: dose.size,
        dose_mtime_utc: dose.mtime_utc.clone(),
        dose_sha256: dose.sha256.clone(),
        resulting_paths: String::new(),
    }
}

fn resolve_identical(
    ctx: &RunContext,
    store: &ProvenanceStore,
    log: &mut CollisionLog,
    site: &CollisionSite,
    unoe_meta: &SideMeta,
    dose_meta: &SideMeta,
) -> Result<(), Error> {
    let mut row = base_row(site, unoe_meta, dose_meta);
    row.classification = "identical".to_string();
    row.chosen_action = "no_action".to_string();
    row.resulting_paths = row.dest_path.clone();
    log.candidate(&row)?;

    // The seed copy recorded the UNOE attribution; the DOSE side is
    // attributed here, once the destination verifiably holds this content.
    let dest_abs = ctx.dest_root().join(&site.dest_rel);
    if !ctx.dry_run && dest_abs.exists() {
        let create_time = metadata::windows_create_time(&site.dose_src);
        store.append_verified(
            ctx.dest_root(),
            &dest_abs,
            Origin::Dose,
            &site.dose_src,
            dose_meta,
            &create_time,
        )?;
    }
    Ok(())
}

/// Pick the newest side of a conflict.
fn pick_newest(unoe: &SideMeta, dose: &SideMeta) -> Origin {
    if unoe.mtime_unix > dose.mtime_unix {
        Origin::Unoe
    } else if dose.mtime_unix > unoe.mtime_unix {
        Origin::Dose
    } else if dose.size > unoe.size {
        Origin::Dose
    } else if unoe.size > dose.size {
        Origin::Unoe
    } else {
        Origin::Unoe
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_conflict(
    ctx: &RunContext,
    store: &ProvenanceStore,
    log: &mut CollisionLog,
    site: &CollisionSite,
    unoe_meta: &SideMeta,
    dose_meta: &SideMeta,
    stats: &mut ResolveStats,
) -> Result<(), Error> {
    let mut pending = base_row(site, unoe_meta, dose_meta);
    pending.classification = "conflict".to_string();
    pending.chosen_action = "pending".to_string();
    log.candidate(&pending)?;

    let newest_origin = pick_newest(unoe_meta, dose_meta);
    let (newest_meta, newest_src, loser_meta, loser_src) = match newest_origin {
        Origin::Unoe => (unoe_meta, &site.unoe_src, dose_meta, &site.dose_src),
        Origin::Dose => (dose_meta, &site.dose_src, unoe_meta, &site.unoe_src),
    };
    let loser_origin = newest_origin.other();
    let dest_abs = ctx.dest_root().join(&site.dest_rel);

    let mut row = base_row(site, unoe_meta, dose_meta);
    row.classification = "conflict".to_string();

    if newest_meta.size > loser_meta.size {
        row.chosen_action = "replace_with_newest".to_string();
        row.resulting_paths = row.dest_path.clone();
        if !ctx.dry_run {
            replace_with(ctx, &dest_abs, newest_src, &newest_meta.sha256)?;
            let create_time = metadata::windows_create_time(newest_src);
            store.append_verified(
                ctx.dest_root(),
                &dest_abs,
                newest_origin,
                newest_src,
                newest_meta,
                &create_time,
            )?;
        }
        if log.resolution(&row)? {
            stats.replaced += 1;
        } else {
            stats.reused += 1;
        }
        return Ok(());
    }

    // Newest is not strictly larger: keep both variants.
    row.chosen_action = "keep_both".to_string();
    let loser_slot;
    if ctx.dry_run {
        loser_slot = suffixed_path(&dest_abs, loser_origin);
    } else {
        loser_slot = keep_both(ctx, &dest_abs, newest_src, newest_meta, loser_src, loser_meta, loser_origin)?;
        let newest_create = metadata::windows_create_time(newest_src);
        store.append_verified(
            ctx.dest_root(),
            &dest_abs,
            newest_origin,
            newest_src,
            newest_meta,
            &newest_create,
        )?;
        let loser_create = metadata::windows_create_time(loser_src);
        store.append_verified(
            ctx.dest_root(),
            &loser_slot,
            loser_origin,
            loser_src,
            loser_meta,
            &loser_create,
        )?;
    }
    let loser_rel = loser_slot
        .strip_prefix(ctx.dest_root())
        .unwrap_or(&loser_slot)
        .to_string_lossy()
        .into_owned();
    row.resulting_paths = format!("{};{}", row.dest_path, loser_rel);
    if log.resolution(&row)? {
        stats.kept_both += 1;
    } else {
        stats.reused += 1;
    }
    Ok(())
}

/// Make the canonical destination hold exactly the newest side's content.
fn replace_with(
    ctx: &RunContext,
    dest: &Path,
    newest_src: &Path,
    newest_sha: &str,
) -> Result<(), Error> {
    if dest.exists() {
        if metadata::sha256_file(dest)? == newest_sha {
            return Ok(());
        }
        fs::remove_file(dest)?;
    }
    if let Some(parent) = dest.parent() {
        crate::copy::ensure_dir(parent, &ctx.config)?;
    }
    fs::copy(newest_src, dest)?;
    restore_times_and_mode(newest_src, dest, &ctx.config)?;
    Ok(())
}

/// Keep-both: newest takes the canonical slot, the loser a suffixed
/// sibling. A destination matching neither source is moved aside to the
/// losing origin's first vacant suffixed slot first. Returns the loser's
/// final path.
fn keep_both(
    ctx: &RunContext,
    dest: &Path,
    newest_src: &Path,
    newest_meta: &SideMeta,
    loser_src: &Path,
    loser_meta: &SideMeta,
    loser_origin: Origin,
) -> Result<PathBuf, Error> {
    if dest.exists() {
        let dest_sha = metadata::sha256_file(dest)?;
        if dest_sha == loser_meta.sha256 {
            let (slot, needs_write) = free_suffix_slot(dest, loser_origin, &loser_meta.sha256)?;
            if needs_write {
                fs::rename(dest, &slot)?;
            } else {
                // The loser content is already preserved in its slot.
                fs::remove_file(dest)?;
            }
            fs::copy(newest_src, dest)?;
            restore_times_and_mode(newest_src, dest, &ctx.config)?;
            return Ok(slot);
        }
        if dest_sha != newest_meta.sha256 {
            let aside = first_vacant_slot(dest, loser_origin);
            fs::rename(dest, &aside)?;
            fs::copy(newest_src, dest)?;
            restore_times_and_mode(newest_src, dest, &ctx.config)?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            crate::copy::ensure_dir(parent, &ctx.config)?;
        }
        fs::copy(newest_src, dest)?;
        restore_times_and_mode(newest_src, dest, &ctx.config)?;
    }

    let (slot, needs_write) = free_suffix_slot(dest, loser_origin, &loser_meta.sha256)?;
    if needs_write {
        fs::copy(loser_src, &slot)?;
        restore_times_and_mode(loser_src, &slot, &ctx.config)?;
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_detection_anchors_at_end_of_stem() {
        assert!(is_suffixed_stem("photo__UNOE"));
        assert!(is_suffixed_stem("photo__DOSE"));
        assert!(is_suffixed_stem("photo__UNOE_2"));
        assert!(is_suffixed_stem("photo__DOSE_17"));
        assert!(!is_suffixed_stem("photo"));
        assert!(!is_suffixed_stem("photo__UNOEsomething"));
        assert!(!is_suffixed_stem("photo__UNOE_2x"));
        assert!(!is_suffixed_stem("photo__UNOE_"));
        assert!(!is_suffixed_stem("photo__unoe"));
    }

    #[test]
    fn suffixed_path_inserts_between_stem_and_extension() {
        assert_eq!(
            suffixed_path(Path::new("/d/Photos/p.jpg"), Origin::Unoe),
            PathBuf::from("/d/Photos/p__UNOE.jpg")
        );
        assert_eq!(
            suffixed_path(Path::new("/d/Photos/README"), Origin::Dose),
            PathBuf::from("/d/Photos/README__DOSE")
        );
    }

    #[test]
    fn suffixed_path_is_a_fixed_point() {
        for name in ["p__UNOE.jpg", "p__DOSE.jpg", "p__UNOE_2.jpg", "p__DOSE_9.jpg"] {
            let path = Path::new("/d").join(name);
            assert_eq!(suffixed_path(&path, Origin::Unoe), path);
            assert_eq!(suffixed_path(&path, Origin::Dose), path);
        }
    }

    #[test]
    fn dotfiles_keep_their_leading_dot() {
        assert_eq!(
            suffixed_path(Path::new("/d/.config"), Origin::Unoe),
            PathBuf::from("/d/.config__UNOE")
        );
    }

    fn meta(mtime: i64, size: u64, sha: &str) -> SideMeta {
        SideMeta {
            size,
            mtime_unix: mtime,
            mtime_utc: metadata::format_epoch_utc(mtime),
            sha256: sha.to_string(),
        }
    }

    #[test]
    fn newest_prefers_strictly_greater_mtime() {
        let older = meta(1_000, 100, "aa");
        let newer = meta(2_000, 50, "bb");
        assert_eq!(pick_newest(&older, &newer), Origin::Dose);
        assert_eq!(pick_newest(&newer, &older), Origin::Unoe);
    }

    #[test]
    fn mtime_tie_breaks_by_size_favoring_dose() {
        let small = meta(1_000, 10, "aa");
        let large = meta(1_000, 11, "bb");
        assert_eq!(pick_newest(&small, &large), Origin::Dose);
        assert_eq!(pick_newest(&large, &small), Origin::Unoe);
    }

    #[test]
    fn full_tie_goes_to_unoe() {
        let a = meta(1_000, 10, "aa");
        let b = meta(1_000, 10, "bb");
        assert_eq!(pick_newest(&a, &b), Origin::Unoe);
    }
}
