use crate::error::Error;
use crate::provenance::{self, ProvenanceRow};
use crate::run::RunContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use tracing::info;

pub const MANIFEST_HEADERS: [&str; 2] =
    ["dest_path_relative_to_share", "earliest_create_time_utc_iso8601"];
pub const MISSING_HEADERS: [&str; 2] = ["dest_path", "reason"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestRow {
    pub dest_path_relative_to_share: String,
    pub earliest_create_time_utc_iso8601: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingRow {
    pub dest_path: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct ManifestStats {
    pub entries: usize,
    pub missing: usize,
}

/// Build the creation-time manifest from the provenance store.
///
/// Content identity is the join key: rows are bucketed by SHA-256, the
/// earliest `ok` creation time per hash is chosen (lexicographic minimum of
/// the sortable ISO-8601 strings), and every destination sharing that hash
/// inherits it — so a destination whose own attribute failed to parse still
/// gets a time if any identical-content sibling carried one.
pub fn build_manifest(ctx: &RunContext) -> Result<ManifestStats, Error> {
    ctx.set_action("manifest: reading provenance");
    let rows = provenance::read_all(&ctx.provenance_path())?;

    // Earliest ok time per content hash.
    let mut earliest: HashMap<&str, &str> = HashMap::new();
    for row in &rows {
        if row.create_time_status == "ok" && !row.src_create_time_utc.is_empty() {
            earliest
                .entry(row.sha256.as_str())
                .and_modify(|t| {
                    if row.src_create_time_utc.as_str() < *t {
                        *t = row.src_create_time_utc.as_str();
                    }
                })
                .or_insert(row.src_create_time_utc.as_str());
        }
    }

    // Identity per destination: the latest appended row wins, matching the
    // append-only log where later attributions supersede earlier ones.
    let mut identity: BTreeMap<&str, &ProvenanceRow> = BTreeMap::new();
    for row in &rows {
        identity.insert(row.dest_path.as_str(), row);
    }

    ctx.set_action("manifest: writing tables");
    let manifest_path = ctx.manifest_path();
    let missing_path = ctx.manifest_missing_path();
    for path in [&manifest_path, &missing_path] {
        if path.exists() {
            fs::remove_file(path)?;
        }
    }
    provenance::init_table(&manifest_path, &MANIFEST_HEADERS)?;
    provenance::init_table(&missing_path, &MISSING_HEADERS)?;

    let mut stats = ManifestStats::default();
    for (dest_path, row) in &identity {
        if !ctx.dest_root().join(dest_path).exists() {
            record_missing(ctx, dest_path, "destination_missing", &mut stats)?;
            continue;
        }
        if row.sha256.is_empty() {
            record_missing(ctx, dest_path, "missing_identity_key", &mut stats)?;
            continue;
        }
        match earliest.get(row.sha256.as_str()) {
            Some(time) => {
                provenance::append_record(
                    &manifest_path,
                    &ManifestRow {
                        dest_path_relative_to_share: dest_path.to_string(),
                        earliest_create_time_utc_iso8601: time.to_string(),
                    },
                )?;
                stats.entries += 1;
            }
            None => record_missing(ctx, dest_path, "missing_creation_time", &mut stats)?,
        }
    }

    write_instructions(ctx)?;
    info!(
        "Creation-time manifest: {} entries, {} without a usable time",
        stats.entries, stats.missing
    );
    Ok(stats)
}

fn record_missing(
    ctx: &RunContext,
    dest_path: &str,
    reason: &str,
    stats: &mut ManifestStats,
) -> Result<(), Error> {
    provenance::append_record(
        &ctx.manifest_missing_path(),
        &MissingRow {
            dest_path: dest_path.to_string(),
            reason: reason.to_string(),
        },
    )?;
    stats.missing += 1;
    Ok(())
}

/// Read the manifest back (used by the post-build sanity pass and tests).
pub fn read_manifest(ctx: &RunContext) -> Result<Vec<ManifestRow>, Error> {
    let path = ctx.manifest_path();
    let mut reader = csv::ReaderBuilder::new().from_path(&path)?;
    provenance::check_headers(&path, &mut reader, &MANIFEST_HEADERS)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: ManifestRow = record?;
        rows.push(row);
    }
    Ok(rows)
}

fn write_instructions(ctx: &RunContext) -> Result<(), Error> {
    let mut file = fs::File::create(ctx.instructions_path())?;
    writeln!(file, "Applying creation times on the Windows side")?;
    writeln!(file, "=============================================")?;
    writeln!(file)?;
    writeln!(
        file,
        "1. Copy {} to the Windows host.",
        ctx.manifest_path()
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
    )?;
    writeln!(
        file,
        "2. Run the apply tool with the share root that maps this volume,"
    )?;
    writeln!(
        file,
        "   e.g.:  apply-create-times.exe --manifest create_time_manifest.csv --share-root X:\\"
    )?;
    writeln!(file)?;
    writeln!(
        file,
        "The tool resolves each relative path under the share root and sets"
    )?;
    writeln!(
        file,
        "the file creation time. A file already within 2 seconds of its"
    )?;
    writeln!(
        file,
        "manifest time is left untouched, so re-running is safe. Exit code 2"
    )?;
    writeln!(file, "means too many individual files failed; inspect its log.")?;
    writeln!(file)?;
    writeln!(
        file,
        "Entries without a recoverable creation time are listed in"
    )?;
    writeln!(
        file,
        "create_time_missing.csv with one of: destination_missing,"
    )?;
    writeln!(file, "missing_identity_key, missing_creation_time.")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::provenance::ProvenanceStore;
    use crate::run::RunContext;
    use tempfile::tempdir;

    fn test_ctx(dir: &std::path::Path) -> RunContext {
        let config = AppConfig {
            dest_root: dir.join("dest").to_string_lossy().into_owned(),
            log_root: Some(dir.join("logs").to_string_lossy().into_owned()),
            ..AppConfig::default()
        };
        let ctx = RunContext::new(config, Some("test-run".to_string()), None, false);
        ctx.ensure_run_dir().unwrap();
        std::fs::create_dir_all(ctx.dest_root()).unwrap();
        ctx
    }

    fn row(dest: &str, status: &str, time: &str, sha: &str) -> ProvenanceRow {
        ProvenanceRow {
            dest_path: dest.to_string(),
            origin: "UNOE".to_string(),
            source_path: format!("/mnt/UNOE/{dest}"),
            src_create_time_utc: time.to_string(),
            create_time_status: status.to_string(),
            src_mtime_utc: "2020-06-01T00:00:00Z".to_string(),
            size_bytes: 1,
            sha256: sha.to_string(),
        }
    }

    #[test]
    fn identical_content_shares_the_earliest_time() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        std::fs::write(ctx.dest_root().join("a.txt"), b"x").unwrap();
        std::fs::write(ctx.dest_root().join("b.txt"), b"x").unwrap();

        let store = ProvenanceStore::open(&ctx.provenance_path()).unwrap();
        store
            .append(&row("a.txt", "ok", "2015-03-02T10:11:12Z", "h1"))
            .unwrap();
        store.append(&row("b.txt", "parse_error", "", "h1")).unwrap();

        let stats = build_manifest(&ctx).unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.missing, 0);

        let manifest = read_manifest(&ctx).unwrap();
        assert!(manifest.iter().all(|m| m.earliest_create_time_utc_iso8601
            == "2015-03-02T10:11:12Z"));
    }

    #[test]
    fn earliest_time_is_the_minimum_across_duplicates() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        std::fs::write(ctx.dest_root().join("a.txt"), b"x").unwrap();

        let store = ProvenanceStore::open(&ctx.provenance_path()).unwrap();
        store
            .append(&row("a.txt", "ok", "2019-01-01T00:00:00Z", "h1"))
            .unwrap();
        store
            .append(&row("a.txt", "ok", "2015-03-02T10:11:12Z", "h1"))
            .unwrap();

        build_manifest(&ctx).unwrap();
        let manifest = read_manifest(&ctx).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(
            manifest[0].earliest_create_time_utc_iso8601,
            "2015-03-02T10:11:12Z"
        );
    }

    #[test]
    fn missing_reasons_are_annotated() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        std::fs::write(ctx.dest_root().join("no-time.txt"), b"x").unwrap();

        let store = ProvenanceStore::open(&ctx.provenance_path()).unwrap();
        store.append(&row("gone.txt", "ok", "2015-03-02T10:11:12Z", "h1")).unwrap();
        store.append(&row("no-time.txt", "missing", "", "h2")).unwrap();

        let stats = build_manifest(&ctx).unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.missing, 2);

        let content = std::fs::read_to_string(ctx.manifest_missing_path()).unwrap();
        assert!(content.contains("destination_missing"));
        assert!(content.contains("missing_creation_time"));
    }

    #[test]
    fn absent_provenance_is_fatal() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        assert!(matches!(
            build_manifest(&ctx),
            Err(Error::MissingProvenance(_))
        ));
    }
}
