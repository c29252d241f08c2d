use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::trace;

const HASH_CHUNK: usize = 1024 * 1024;

/// Seconds between the Windows FILETIME epoch (1601-01-01) and the Unix
/// epoch.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Extended attributes probed for the Windows creation time, in order.
const CRTIME_XATTRS: [&str; 2] = ["system.ntfs_crtime_be", "system.ntfs_crtime"];

/// Outcome of the creation-time probe. Round-trips through provenance
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateTimeStatus {
    Ok,
    ParseError,
    Missing,
}

impl CreateTimeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateTimeStatus::Ok => "ok",
            CreateTimeStatus::ParseError => "parse_error",
            CreateTimeStatus::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<CreateTimeStatus> {
        match s {
            "ok" => Some(CreateTimeStatus::Ok),
            "parse_error" => Some(CreateTimeStatus::ParseError),
            "missing" => Some(CreateTimeStatus::Missing),
            _ => None,
        }
    }
}

/// Parsed creation time. `value` is empty unless `status` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTime {
    pub value: String,
    pub status: CreateTimeStatus,
}

impl CreateTime {
    fn ok(value: String) -> Self {
        CreateTime {
            value,
            status: CreateTimeStatus::Ok,
        }
    }

    fn parse_error() -> Self {
        CreateTime {
            value: String::new(),
            status: CreateTimeStatus::ParseError,
        }
    }

    fn missing() -> Self {
        CreateTime {
            value: String::new(),
            status: CreateTimeStatus::Missing,
        }
    }
}

/// Size, mtime, and content hash of one side of a comparison.
#[derive(Debug, Clone)]
pub struct SideMeta {
    pub size: u64,
    pub mtime_unix: i64,
    pub mtime_utc: String,
    pub sha256: String,
}

/// SHA-256 over the full content stream, 1 MiB chunks, lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    Ok(out)
}

/// ISO-8601 UTC with `Z` suffix at second resolution.
pub fn format_epoch_utc(secs: i64) -> String {
    match DateTime::<Utc>::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => String::new(),
    }
}

pub fn mtime_unix(metadata: &std::fs::Metadata) -> i64 {
    filetime::FileTime::from_last_modification_time(metadata).unix_seconds()
}

/// Read size, mtime, and SHA-256 for one comparison side.
pub fn read_side_meta(path: &Path) -> io::Result<SideMeta> {
    let metadata = std::fs::metadata(path)?;
    let mtime = mtime_unix(&metadata);
    Ok(SideMeta {
        size: metadata.len(),
        mtime_unix: mtime,
        mtime_utc: format_epoch_utc(mtime),
        sha256: sha256_file(path)?,
    })
}

/// Windows creation time for a source file.
///
/// Probes, in order: native birth time (strictly positive epoch only), then
/// the `system.ntfs_crtime_be` and `system.ntfs_crtime` extended
/// attributes, each holding a hex-encoded 64-bit big-endian FILETIME,
/// optionally `0x`-prefixed. An attribute that exists but fails to decode
/// yields `parse_error`; no source at all yields `missing`.
pub fn windows_create_time(path: &Path) -> CreateTime {
    if let Ok(metadata) = std::fs::metadata(path) {
        if let Ok(created) = metadata.created() {
            let secs = filetime::FileTime::from_system_time(created).unix_seconds();
            if secs > 0 {
                return CreateTime::ok(format_epoch_utc(secs));
            }
        }
    }

    let mut saw_attribute = false;
    for name in CRTIME_XATTRS {
        match xattr::get(path, name) {
            Ok(Some(raw)) => {
                saw_attribute = true;
                if let Some(secs) = parse_filetime_hex(&raw) {
                    trace!("{}: creation time from {}", path.display(), name);
                    return CreateTime::ok(format_epoch_utc(secs));
                }
            }
            Ok(None) => {}
            Err(_) => {}
        }
    }

    if saw_attribute {
        CreateTime::parse_error()
    } else {
        CreateTime::missing()
    }
}

/// Decode a hex-encoded FILETIME attribute value into Unix epoch seconds.
///
/// Accepts an optional `0x` prefix; an encoding longer than 16 hex digits
/// contributes its trailing 16. Returns `None` for the wrong length,
/// non-hex content, or a pre-1970 result.
pub fn parse_filetime_hex(raw: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(raw).ok()?;
    let trimmed = text.trim().trim_end_matches('\0');
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits = if digits.len() > 16 {
        &digits[digits.len() - 16..]
    } else {
        digits
    };
    if digits.len() != 16 {
        return None;
    }
    let filetime = u64::from_str_radix(digits, 16).ok()?;
    let secs = (filetime / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_EPOCH_OFFSET;
    if secs < 0 {
        return None;
    }
    Some(secs)
}
