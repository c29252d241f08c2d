use crate::collision;
use crate::error::Error;
use crate::metadata;
use crate::provenance;
use crate::run::RunContext;
use crate::taxonomy::SAMPLER_BUCKETS;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::hash::Hasher as _;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const LARGEST_PER_BUCKET: usize = 50;
const RANDOM_PER_BUCKET: usize = 200;

pub const SAMPLE_HEADERS: [&str; 3] = ["relative_path", "sha256", "size_bytes"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleRow {
    pub relative_path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Deterministic PRNG seed for one `(run_id, bucket)` pair, via the
/// XxHash64 of both strings. Separate seeds per bucket keep the bucket
/// samples uncorrelated within a run.
fn bucket_seed(run_id: &str, bucket: &str) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(run_id.as_bytes());
    hasher.write(&[0x1f]);
    hasher.write(bucket.as_bytes());
    hasher.finish()
}

/// Build the sample path list, or reload it when a previous phase already
/// persisted one — the post-dedupe pass must re-hash exactly the same
/// files.
pub fn ensure_sample_list(ctx: &RunContext) -> Result<Vec<PathBuf>, Error> {
    let list_path = ctx.sample_paths_path();
    if list_path.exists() {
        let file = fs::File::open(&list_path)?;
        let mut paths = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.is_empty() {
                paths.push(PathBuf::from(line));
            }
        }
        info!("Reusing persisted sample list: {} paths", paths.len());
        return Ok(paths);
    }

    let paths = build_sample_list(ctx)?;
    let mut file = fs::File::create(&list_path)?;
    for path in &paths {
        writeln!(file, "{}", path.display())?;
    }
    info!("Persisted sample list: {} paths", paths.len());
    Ok(paths)
}

/// Select the sample: every conflict outcome from the resolution log first,
/// then per content-heavy bucket the largest files plus a seeded uniform
/// draw. Duplicates removed preserving first occurrence.
fn build_sample_list(ctx: &RunContext) -> Result<Vec<PathBuf>, Error> {
    fn push(path: PathBuf, seen: &mut HashSet<PathBuf>, sample: &mut Vec<PathBuf>) {
        if seen.insert(path.clone()) {
            sample.push(path);
        }
    }
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut sample: Vec<PathBuf> = Vec::new();

    for row in collision::read_rows(&ctx.resolutions_path())? {
        push(PathBuf::from(&row.dest_path), &mut seen, &mut sample);
        for part in row.resulting_paths.split(';') {
            if !part.is_empty() {
                push(PathBuf::from(part), &mut seen, &mut sample);
            }
        }
    }

    for bucket in SAMPLER_BUCKETS {
        let bucket_abs = ctx.dest_root().join(bucket);
        if !bucket_abs.is_dir() {
            continue;
        }
        let mut files = Vec::new();
        collect_files(ctx.dest_root(), &bucket_abs, &mut files);
        // Sorted candidate list so the draw depends only on the seed.
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut by_size = files.clone();
        by_size.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (rel, _) in by_size.into_iter().take(LARGEST_PER_BUCKET) {
            push(rel, &mut seen, &mut sample);
        }

        let mut rng = StdRng::seed_from_u64(bucket_seed(&ctx.run_id, bucket));
        let drawn: Vec<&(PathBuf, u64)> = files
            .choose_multiple(&mut rng, RANDOM_PER_BUCKET.min(files.len()))
            .collect();
        for (rel, _) in drawn {
            push(rel.clone(), &mut seen, &mut sample);
        }
    }

    Ok(sample)
}

fn collect_files(dest_root: &Path, dir: &Path, out: &mut Vec<(PathBuf, u64)>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Unreadable directory {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            collect_files(dest_root, &path, out);
        } else if file_type.is_file() {
            if let (Ok(rel), Ok(md)) = (path.strip_prefix(dest_root), entry.metadata()) {
                out.push((rel.to_path_buf(), md.len()));
            }
        }
    }
}

/// Hash every sampled path and write the `(relative_path, sha256,
/// size_bytes)` table for the given stage (`pre` or `post`).
pub fn hash_sample(ctx: &RunContext, stage: &str) -> Result<usize, Error> {
    let paths = ensure_sample_list(ctx)?;
    ctx.set_action(&format!("sample: hashing {} files ({})", paths.len(), stage));

    let rows: Vec<Option<SampleRow>> = paths
        .par_iter()
        .map(|rel| {
            let abs = ctx.dest_root().join(rel);
            let size = match fs::metadata(&abs) {
                Ok(md) => md.len(),
                Err(e) => {
                    warn!("Sampled file missing: {} ({})", abs.display(), e);
                    return None;
                }
            };
            match metadata::sha256_file(&abs) {
                Ok(sha256) => Some(SampleRow {
                    relative_path: rel.to_string_lossy().into_owned(),
                    sha256,
                    size_bytes: size,
                }),
                Err(e) => {
                    error!("Hash failure for sampled {}: {}", abs.display(), e);
                    None
                }
            }
        })
        .collect();

    let csv_path = ctx.sample_csv_path(stage);
    if csv_path.exists() {
        fs::remove_file(&csv_path)?;
    }
    provenance::init_table(&csv_path, &SAMPLE_HEADERS)?;
    let mut written = 0usize;
    for row in rows.into_iter().flatten() {
        provenance::append_record(&csv_path, &row)?;
        written += 1;
    }
    info!("{} sample: hashed {} of {} paths", stage, written, paths.len());
    Ok(written)
}

/// Read a sample table back, for the self-test and the post-dedupe
/// comparison.
pub fn read_sample(path: &Path) -> Result<Vec<SampleRow>, Error> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    provenance::check_headers(path, &mut reader, &SAMPLE_HEADERS)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: SampleRow = record?;
        rows.push(row);
    }
    Ok(rows)
}
