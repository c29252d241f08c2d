use std::fs;
use std::path::Path;

use filetime::FileTime;
use tempfile::{tempdir, TempDir};

use unomerge_core::pipeline::{Phase, Pipeline, SilentReporter};
use unomerge_core::{collision, manifest, provenance, sampler};
use unomerge_core::{AppConfig, RunContext};

// 2022-01-01, 2023-06-01, and an arbitrary shared instant for mtime ties.
const OLD: i64 = 1_640_995_200;
const NEW: i64 = 1_685_577_600;
const TIE: i64 = 1_650_000_000;

fn write_with_mtime(path: &Path, content: &[u8], mtime: i64) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
    filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

/// Two source volumes exercising every collision outcome plus the
/// classifier fallbacks:
///
///   UNOE/AUDIO/x.mp3        == DOSE/AUDIO/x.mp3          (identical)
///   UNOE/Video/v.mp4        <  DOSE/Video/v.mp4          (newer+larger)
///   UNOE/Pictures/p.jpg     vs DOSE/Pictures/p.jpg       (newer but smaller)
///   UNOE/Games/tie.bin      vs DOSE/Games/tie.bin        (mtime tie, DOSE larger)
///   UNOE/Old_Archive/...                                  (unmapped)
///   UNOE/vacation.jpg, UNOE/notes.txt                     (loose root files)
///   DOSE/Music/track.flac                                 (overlay-only)
fn build_sources(tmp: &TempDir) {
    let unoe = tmp.path().join("UNOE");
    let dose = tmp.path().join("DOSE");

    write_with_mtime(&unoe.join("AUDIO/x.mp3"), b"same song bytes", OLD);
    write_with_mtime(&dose.join("AUDIO/x.mp3"), b"same song bytes", NEW);

    write_with_mtime(&unoe.join("Video/v.mp4"), b"unoe video", OLD);
    write_with_mtime(&dose.join("Video/v.mp4"), b"dose video xxl", NEW);

    write_with_mtime(&unoe.join("Pictures/p.jpg"), b"unoe jpeg bytes!", OLD);
    write_with_mtime(&dose.join("Pictures/p.jpg"), b"dose jpeg", NEW);

    write_with_mtime(&unoe.join("Games/tie.bin"), b"0123456789", TIE);
    write_with_mtime(&dose.join("Games/tie.bin"), b"abcdefghijk", TIE);

    write_with_mtime(&unoe.join("Old_Archive/doc.txt"), b"archived", OLD);
    write_with_mtime(&unoe.join("vacation.jpg"), b"jpegdata", OLD);
    write_with_mtime(&unoe.join("notes.txt"), b"notes", OLD);

    write_with_mtime(&dose.join("Music/track.flac"), b"flac", NEW);
}

fn build_ctx(tmp: &TempDir, run_id: &str, dry_run: bool) -> RunContext {
    fs::create_dir_all(tmp.path().join("UNO")).unwrap();
    let config = AppConfig {
        unoe_root: tmp.path().join("UNOE").to_string_lossy().into_owned(),
        dose_root: tmp.path().join("DOSE").to_string_lossy().into_owned(),
        dest_root: tmp.path().join("UNO").to_string_lossy().into_owned(),
        log_root: Some(tmp.path().join("logs").to_string_lossy().into_owned()),
        // `true` stands in for the hardlink tool: exits 0, changes nothing.
        dedupe_tool: "true".to_string(),
        dedupe_args: vec![],
        ..AppConfig::default()
    };
    RunContext::new(config, Some(run_id.to_string()), None, dry_run)
}

/// Every phase except preflight (which requires root).
fn run_merge(ctx: &RunContext) {
    let pipeline = Pipeline::new(ctx);
    for phase in [
        Phase::Prepare,
        Phase::CopyUnoe,
        Phase::OverlayDose,
        Phase::Resolve,
        Phase::VerifyPre,
        Phase::Dedupe,
        Phase::Manifest,
        Phase::VerifyPost,
    ] {
        pipeline.run_phase(phase, &SilentReporter).unwrap();
    }
}

fn dest_bytes(ctx: &RunContext, rel: &str) -> Vec<u8> {
    fs::read(ctx.dest_root().join(rel)).unwrap()
}

#[test]
fn test_full_merge_routes_and_resolves() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-main", false);
    run_merge(&ctx);

    // Identical duplicate: untouched canonical copy.
    assert_eq!(dest_bytes(&ctx, "02_Media/Audio/x.mp3"), b"same song bytes");

    // Newer and larger wins the canonical slot outright.
    assert_eq!(dest_bytes(&ctx, "02_Media/Video/v.mp4"), b"dose video xxl");

    // Newer but smaller keeps both variants.
    assert_eq!(dest_bytes(&ctx, "02_Media/Photos/p.jpg"), b"dose jpeg");
    assert_eq!(
        dest_bytes(&ctx, "02_Media/Photos/p__UNOE.jpg"),
        b"unoe jpeg bytes!"
    );

    // Equal mtimes: the strictly larger DOSE side is newest and replaces.
    assert_eq!(dest_bytes(&ctx, "05_Games/tie.bin"), b"abcdefghijk");

    // Classifier fallbacks.
    assert_eq!(
        dest_bytes(
            &ctx,
            "90_System_Artifacts/Unmapped_Folders/UNOE/Old_Archive/doc.txt"
        ),
        b"archived"
    );
    assert_eq!(
        dest_bytes(&ctx, "02_Media/Photos/_From_Root/UNOE/vacation.jpg"),
        b"jpegdata"
    );
    assert_eq!(
        dest_bytes(&ctx, "90_System_Artifacts/Loose_Files/UNOE/notes.txt"),
        b"notes"
    );

    // Overlay-only file lands through its own mapping.
    assert_eq!(dest_bytes(&ctx, "02_Media/Audio/track.flac"), b"flac");
}

#[test]
fn test_collision_tables_match_policy() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-tables", false);
    run_merge(&ctx);

    let candidates = collision::read_rows(&ctx.candidates_path()).unwrap();
    assert_eq!(candidates.len(), 4);
    let identical: Vec<_> = candidates
        .iter()
        .filter(|row| row.classification == "identical")
        .collect();
    assert_eq!(identical.len(), 1);
    assert_eq!(identical[0].dest_path, "02_Media/Audio/x.mp3");
    assert_eq!(identical[0].chosen_action, "no_action");
    assert!(candidates
        .iter()
        .filter(|row| row.classification == "conflict")
        .all(|row| row.chosen_action == "pending"));

    let resolutions = collision::read_rows(&ctx.resolutions_path()).unwrap();
    assert_eq!(resolutions.len(), 3);

    let by_dest = |dest: &str| {
        resolutions
            .iter()
            .find(|row| row.dest_path == dest)
            .unwrap_or_else(|| panic!("no resolution for {dest}"))
    };
    assert_eq!(by_dest("02_Media/Video/v.mp4").chosen_action, "replace_with_newest");
    assert_eq!(by_dest("05_Games/tie.bin").chosen_action, "replace_with_newest");

    let kept = by_dest("02_Media/Photos/p.jpg");
    assert_eq!(kept.chosen_action, "keep_both");
    assert_eq!(
        kept.resulting_paths,
        "02_Media/Photos/p.jpg;02_Media/Photos/p__UNOE.jpg"
    );
}

#[test]
fn test_provenance_attribution() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-prov", false);
    run_merge(&ctx);

    let rows = provenance::read_all(&ctx.provenance_path()).unwrap();

    // Identical duplicate: one row per origin.
    let audio: Vec<_> = rows
        .iter()
        .filter(|row| row.dest_path == "02_Media/Audio/x.mp3")
        .collect();
    let origins: Vec<_> = audio.iter().map(|row| row.origin.as_str()).collect();
    assert!(origins.contains(&"UNOE"));
    assert!(origins.contains(&"DOSE"));

    // Replaced destination: the latest attribution is the DOSE side.
    let video = rows
        .iter()
        .rev()
        .find(|row| row.dest_path == "02_Media/Video/v.mp4")
        .unwrap();
    assert_eq!(video.origin, "DOSE");

    // Keep-both: each resulting path is attributed to its own origin.
    let canonical = rows
        .iter()
        .rev()
        .find(|row| row.dest_path == "02_Media/Photos/p.jpg")
        .unwrap();
    assert_eq!(canonical.origin, "DOSE");
    let suffixed = rows
        .iter()
        .rev()
        .find(|row| row.dest_path == "02_Media/Photos/p__UNOE.jpg")
        .unwrap();
    assert_eq!(suffixed.origin, "UNOE");

    // The latest row per destination matches what is on disk.
    let mut latest: std::collections::HashMap<&str, &provenance::ProvenanceRow> =
        std::collections::HashMap::new();
    for row in &rows {
        latest.insert(row.dest_path.as_str(), row);
    }
    for (dest, row) in latest {
        let on_disk = unomerge_core::metadata::sha256_file(&ctx.dest_root().join(dest)).unwrap();
        assert_eq!(on_disk, row.sha256, "stale attribution for {dest}");
    }
}

#[test]
fn test_conflict_outcomes_are_sampled_and_stable() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-sample", false);
    run_merge(&ctx);

    let pre = sampler::read_sample(&ctx.sample_csv_path("pre")).unwrap();
    let post = sampler::read_sample(&ctx.sample_csv_path("post")).unwrap();
    let find = |rows: &[sampler::SampleRow], rel: &str| {
        rows.iter()
            .find(|row| row.relative_path == rel)
            .unwrap_or_else(|| panic!("{rel} not sampled"))
            .sha256
            .clone()
    };

    for row in collision::read_rows(&ctx.resolutions_path()).unwrap() {
        for rel in row.resulting_paths.split(';') {
            assert_eq!(find(&pre, rel), find(&post, rel), "sample drifted for {rel}");
        }
    }

    // The persisted sample list pins the post pass to the pre pass.
    assert!(ctx.sample_paths_path().exists());
}

#[test]
fn test_resolution_is_deterministic_across_environments() {
    let mut digests = Vec::new();
    for _ in 0..2 {
        let tmp = tempdir().unwrap();
        build_sources(&tmp);
        let ctx = build_ctx(&tmp, "e2e-det", false);
        run_merge(&ctx);
        let mut rows: Vec<(String, String, String, String)> =
            collision::read_rows(&ctx.resolutions_path())
                .unwrap()
                .into_iter()
                .map(|row| {
                    (
                        row.dest_path,
                        row.classification,
                        row.chosen_action,
                        row.resulting_paths,
                    )
                })
                .collect();
        rows.sort();
        digests.push(rows);
    }
    assert_eq!(digests[0], digests[1]);
}

#[test]
fn test_rerun_changes_nothing() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-rerun", false);
    run_merge(&ctx);

    let resolutions_before = collision::read_rows(&ctx.resolutions_path()).unwrap();
    run_merge(&ctx);
    let resolutions_after = collision::read_rows(&ctx.resolutions_path()).unwrap();
    assert_eq!(resolutions_before, resolutions_after);

    // No runaway suffixing: exactly the canonical and one suffixed variant.
    let photos: Vec<String> = fs::read_dir(ctx.dest_root().join("02_Media/Photos"))
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            entry.file_type().unwrap().is_file().then(|| {
                entry.file_name().to_string_lossy().into_owned()
            })
        })
        .collect();
    let mut photos = photos;
    photos.sort();
    assert_eq!(photos, vec!["p.jpg".to_string(), "p__UNOE.jpg".to_string()]);
}

#[test]
fn test_dry_run_decides_without_touching_anything() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-dry", true);
    let pipeline = Pipeline::new(&ctx);
    for phase in [Phase::Prepare, Phase::CopyUnoe, Phase::OverlayDose, Phase::Resolve] {
        pipeline.run_phase(phase, &SilentReporter).unwrap();
    }

    // The decisions were logged...
    let resolutions = collision::read_rows(&ctx.resolutions_path()).unwrap();
    assert_eq!(resolutions.len(), 3);
    assert!(resolutions
        .iter()
        .any(|row| row.chosen_action == "keep_both"));

    // ...but the destination stayed empty and no provenance was attributed.
    assert_eq!(fs::read_dir(ctx.dest_root()).unwrap().count(), 0);
    assert!(provenance::read_all(&ctx.provenance_path()).unwrap().is_empty());
}

#[test]
fn test_manifest_covers_every_attributed_destination() {
    let tmp = tempdir().unwrap();
    build_sources(&tmp);
    let ctx = build_ctx(&tmp, "e2e-manifest", false);
    run_merge(&ctx);

    let rows = provenance::read_all(&ctx.provenance_path()).unwrap();
    let unique_dests: std::collections::HashSet<&str> =
        rows.iter().map(|row| row.dest_path.as_str()).collect();

    let manifest_rows = manifest::read_manifest(&ctx).unwrap();
    let missing = fs::read_to_string(ctx.manifest_missing_path()).unwrap();
    let missing_rows = missing.lines().count().saturating_sub(1);
    assert_eq!(manifest_rows.len() + missing_rows, unique_dests.len());

    for row in &manifest_rows {
        assert!(
            !row.earliest_create_time_utc_iso8601.is_empty(),
            "empty time for {}",
            row.dest_path_relative_to_share
        );
    }
    assert!(ctx.instructions_path().exists());
}
