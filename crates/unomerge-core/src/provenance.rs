use crate::error::Error;
use crate::metadata::{self, CreateTime, SideMeta};
use crate::taxonomy::Origin;
use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const HEADERS: [&str; 8] = [
    "dest_path",
    "origin",
    "source_path",
    "src_create_time_utc",
    "create_time_status",
    "src_mtime_utc",
    "size_bytes",
    "sha256",
];

/// One attribution of a destination file to the source file it came from.
/// A destination may legitimately have several rows (one per contributing
/// origin); consumers dedupe by content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvenanceRow {
    pub dest_path: String,
    pub origin: String,
    pub source_path: String,
    pub src_create_time_utc: String,
    pub create_time_status: String,
    pub src_mtime_utc: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Append-only provenance log. Rows are never rewritten or deleted; each
/// append is a single flushed record.
pub struct ProvenanceStore {
    path: PathBuf,
}

impl ProvenanceStore {
    /// Open the store, creating the file with its header if absent. A file
    /// that already carries the expected header is reused as-is; anything
    /// else is refused rather than silently rewritten.
    pub fn open(path: &Path) -> Result<Self, Error> {
        init_table(path, &HEADERS)?;
        Ok(ProvenanceStore {
            path: path.to_path_buf(),
        })
    }

    pub fn append(&self, row: &ProvenanceRow) -> Result<(), Error> {
        append_record(&self.path, row)
    }

    /// Hash the destination file and append a row only when it matches the
    /// recorded source hash. A mismatch suppresses the row so the log never
    /// attributes content the source did not produce.
    pub fn append_verified(
        &self,
        dest_root: &Path,
        dest_abs: &Path,
        origin: Origin,
        source_abs: &Path,
        src_meta: &SideMeta,
        create_time: &CreateTime,
    ) -> Result<bool, Error> {
        let dest_sha = metadata::sha256_file(dest_abs)?;
        if dest_sha != src_meta.sha256 {
            warn!(
                "Provenance suppressed for {}: destination hash {} != source hash {}",
                dest_abs.display(),
                dest_sha,
                src_meta.sha256
            );
            return Ok(false);
        }
        let dest_path = dest_abs
            .strip_prefix(dest_root)
            .unwrap_or(dest_abs)
            .to_string_lossy()
            .into_owned();
        self.append(&ProvenanceRow {
            dest_path,
            origin: origin.as_str().to_string(),
            source_path: source_abs.to_string_lossy().into_owned(),
            src_create_time_utc: create_time.value.clone(),
            create_time_status: create_time.status.as_str().to_string(),
            src_mtime_utc: src_meta.mtime_utc.clone(),
            size_bytes: src_meta.size,
            sha256: src_meta.sha256.clone(),
        })?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every row back, validating the header first.
pub fn read_all(path: &Path) -> Result<Vec<ProvenanceRow>, Error> {
    if !path.exists() {
        return Err(Error::MissingProvenance(path.display().to_string()));
    }
    let mut reader = ReaderBuilder::new().from_path(path)?;
    check_headers(path, &mut reader, &HEADERS)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: ProvenanceRow = record?;
        rows.push(row);
    }
    Ok(rows)
}

/// Create `path` with the given header when absent; verify the header when
/// present. Shared by the provenance and collision tables.
pub(crate) fn init_table(path: &Path, headers: &[&str]) -> Result<(), Error> {
    if path.exists() {
        let mut reader = ReaderBuilder::new().from_path(path)?;
        check_headers(path, &mut reader, headers)?;
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create_new(true).write(true).open(path)?;
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .from_writer(file);
    writer.write_record(headers)?;
    writer.flush()?;
    Ok(())
}

/// Append one serializable record to an already-initialized table.
pub(crate) fn append_record<R: Serialize>(path: &Path, row: &R) -> Result<(), Error> {
    let bytes = render_record(row)?;
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

/// Render one record to CSV bytes with minimal quoting: fields are quoted
/// only when the format demands it. A record containing a field with
/// leading or trailing whitespace is written fully quoted instead, so
/// trimming readers cannot mangle it.
pub(crate) fn render_record<R: Serialize>(row: &R) -> Result<Vec<u8>, Error> {
    let plain = render_with(row, QuoteStyle::Necessary)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .from_reader(plain.as_slice());
    let mut record = csv::StringRecord::new();
    if reader.read_record(&mut record)? && record.iter().any(has_edge_whitespace) {
        return render_with(row, QuoteStyle::Always);
    }
    Ok(plain)
}

fn render_with<R: Serialize>(row: &R, style: QuoteStyle) -> Result<Vec<u8>, Error> {
    let mut writer = WriterBuilder::new()
        .quote_style(style)
        .has_headers(false)
        .from_writer(Vec::new());
    writer.serialize(row)?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| Error::Other(format!("CSV buffer error: {e}")))
}

fn has_edge_whitespace(field: &str) -> bool {
    field != field.trim()
}

pub(crate) fn check_headers<R: std::io::Read>(
    path: &Path,
    reader: &mut csv::Reader<R>,
    expected: &[&str],
) -> Result<(), Error> {
    let found = reader.headers()?;
    if found.iter().ne(expected.iter().copied()) {
        return Err(Error::InvalidHeaders {
            file: path.display().to_string(),
            found: found.iter().collect::<Vec<_>>().join(","),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_row(dest: &str) -> ProvenanceRow {
        ProvenanceRow {
            dest_path: dest.to_string(),
            origin: "UNOE".to_string(),
            source_path: format!("/mnt/UNOE/{dest}"),
            src_create_time_utc: "2015-03-02T10:00:00Z".to_string(),
            create_time_status: "ok".to_string(),
            src_mtime_utc: "2020-01-01T00:00:00Z".to_string(),
            size_bytes: 42,
            sha256: "aa".repeat(32),
        }
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provenance.csv");
        let store = ProvenanceStore::open(&path).unwrap();
        store.append(&sample_row("a.txt")).unwrap();

        // Re-open must reuse the file and keep existing rows.
        let store = ProvenanceStore::open(&path).unwrap();
        store.append(&sample_row("b.txt")).unwrap();

        let rows = read_all(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].dest_path, "a.txt");
        assert_eq!(rows[1].dest_path, "b.txt");
    }

    #[test]
    fn open_refuses_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provenance.csv");
        std::fs::write(&path, "alpha,beta\n1,2\n").unwrap();
        assert!(matches!(
            ProvenanceStore::open(&path),
            Err(Error::InvalidHeaders { .. })
        ));
    }

    #[test]
    fn awkward_fields_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provenance.csv");
        let store = ProvenanceStore::open(&path).unwrap();
        let mut row = sample_row("Games/old, broken/save \"1\".dat");
        row.source_path = "/mnt/UNOE/Games/  padded  ".to_string();
        store.append(&row).unwrap();

        let rows = read_all(&path).unwrap();
        assert_eq!(rows[0].dest_path, "Games/old, broken/save \"1\".dat");
        assert_eq!(rows[0].source_path, "/mnt/UNOE/Games/  padded  ");
    }

    #[test]
    fn quoting_is_minimal_but_protects_padding() {
        let plain = String::from_utf8(render_record(&sample_row("a.txt")).unwrap()).unwrap();
        assert!(plain.starts_with("a.txt,UNOE,"), "unexpected quoting: {plain}");

        let mut padded = sample_row("b.txt");
        padded.source_path = " /mnt/UNOE/padded ".to_string();
        let rendered = String::from_utf8(render_record(&padded).unwrap()).unwrap();
        assert!(
            rendered.contains("\" /mnt/UNOE/padded \""),
            "padding left unquoted: {rendered}"
        );

        let commas = String::from_utf8(
            render_record(&sample_row("Games/old, broken.dat")).unwrap(),
        )
        .unwrap();
        assert!(commas.starts_with("\"Games/old, broken.dat\","));
    }

    #[test]
    fn duplicate_rows_are_permitted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provenance.csv");
        let store = ProvenanceStore::open(&path).unwrap();
        store.append(&sample_row("a.txt")).unwrap();
        store.append(&sample_row("a.txt")).unwrap();
        assert_eq!(read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn verified_append_suppresses_hash_mismatch() {
        let dir = tempdir().unwrap();
        let dest_root = dir.path().join("dest");
        std::fs::create_dir_all(&dest_root).unwrap();
        let src = dir.path().join("src.txt");
        let dst = dest_root.join("src.txt");
        std::fs::write(&src, b"source content").unwrap();
        std::fs::write(&dst, b"different content").unwrap();

        let store = ProvenanceStore::open(&dir.path().join("provenance.csv")).unwrap();
        let src_meta = crate::metadata::read_side_meta(&src).unwrap();
        let created = CreateTime {
            value: String::new(),
            status: crate::metadata::CreateTimeStatus::Missing,
        };
        let written = store
            .append_verified(&dest_root, &dst, Origin::Unoe, &src, &src_meta, &created)
            .unwrap();
        assert!(!written);
        assert!(read_all(store.path()).unwrap().is_empty());

        std::fs::write(&dst, b"source content").unwrap();
        let written = store
            .append_verified(&dest_root, &dst, Origin::Unoe, &src, &src_meta, &created)
            .unwrap();
        assert!(written);
        let rows = read_all(store.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].create_time_status, "missing");
    }

    #[test]
    fn missing_file_is_a_distinct_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_all(&dir.path().join("nope.csv")),
            Err(Error::MissingProvenance(_))
        ));
    }
}
