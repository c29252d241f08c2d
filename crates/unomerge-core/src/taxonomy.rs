use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Source volume label, carried verbatim through provenance and the
/// collision logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Unoe,
    Dose,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Unoe => "UNOE",
            Origin::Dose => "DOSE",
        }
    }

    pub fn other(&self) -> Origin {
        match self {
            Origin::Unoe => Origin::Dose,
            Origin::Dose => Origin::Unoe,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Windows system directories skipped wherever they appear.
pub const EXCLUDED_NAMES: [&str; 2] = ["$RECYCLE.BIN", "System Volume Information"];

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "tif", "tiff", "bmp", "heic"];

const RECOVERY_SUBPATH: &str = "90_System_Artifacts/Recovered_found.000";
const UNMAPPED_SUBPATH: &str = "90_System_Artifacts/Unmapped_Folders";
const LOOSE_SUBPATH: &str = "90_System_Artifacts/Loose_Files";
const ROOT_IMAGE_SUBPATH: &str = "02_Media/Photos/_From_Root";

/// Destination subtrees created by the prepare phase.
pub const SKELETON: [&str; 16] = [
    "01_Personal",
    "01_Personal/Documents",
    "01_Personal/Desktop",
    "01_Personal/Downloads",
    "02_Media/Photos",
    "02_Media/Video",
    "02_Media/Audio",
    "03_Knowledge/Training",
    "03_Knowledge/Research",
    "03_Knowledge/Books",
    "04_Software/OS_Images",
    "04_Software/ESXi_VMs",
    "04_Software/Installers",
    "05_Games",
    "90_System_Artifacts/Unmapped_Folders",
    "90_System_Artifacts/Loose_Files",
];

/// Content-heavy buckets the hash sampler draws from.
pub const SAMPLER_BUCKETS: [&str; 7] = [
    "03_Knowledge/Training",
    "02_Media/Video",
    "05_Games",
    "04_Software/OS_Images",
    "04_Software/ESXi_VMs",
    "01_Personal",
    "03_Knowledge/Research",
];

/// Subtrees handed to the hardlink dedupe subprocess.
pub const DEDUPE_SUBTREES: [&str; 5] = [
    "01_Personal",
    "02_Media",
    "03_Knowledge",
    "04_Software",
    "05_Games",
];

/// Where a depth-1 source entry routes to, relative to the destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Shared destination bucket — mapped taxonomy hit, as-is bucket, or
    /// the `found.000` recovery path. Both origins can land here, so these
    /// are the collision-capable destinations.
    Bucket(PathBuf),
    /// Per-origin destination for a directory name the map does not know.
    Unmapped(PathBuf),
    /// Entry is skipped entirely.
    Excluded,
}

/// The static top-level-name → destination-subpath map.
///
/// Built once at startup and never mutated. Keys match exactly, case
/// sensitive, embedded spaces and punctuation included.
pub struct TaxonomyMap {
    mapped: HashMap<&'static str, &'static str>,
    as_is: [&'static str; 3],
}

impl TaxonomyMap {
    pub fn standard() -> Self {
        let mapped = HashMap::from([
            ("Pictures", "02_Media/Photos"),
            ("My Pictures", "02_Media/Photos"),
            ("Photos", "02_Media/Photos"),
            ("Video", "02_Media/Video"),
            ("Videos", "02_Media/Video"),
            ("Movies", "02_Media/Video"),
            ("AUDIO", "02_Media/Audio"),
            ("Music", "02_Media/Audio"),
            ("Documents", "01_Personal/Documents"),
            ("My Documents", "01_Personal/Documents"),
            ("Desktop", "01_Personal/Desktop"),
            ("Downloads", "01_Personal/Downloads"),
            ("Training", "03_Knowledge/Training"),
            ("Courses", "03_Knowledge/Training"),
            ("Research", "03_Knowledge/Research"),
            ("Books", "03_Knowledge/Books"),
            ("ISOs", "04_Software/OS_Images"),
            ("OS Images", "04_Software/OS_Images"),
            ("VMs", "04_Software/ESXi_VMs"),
            ("ESXi", "04_Software/ESXi_VMs"),
            ("Installers", "04_Software/Installers"),
            ("Games", "05_Games"),
        ]);
        TaxonomyMap {
            mapped,
            as_is: ["ASH", "Backups", "Dropbox"],
        }
    }

    /// Route a directory found at depth 1 under a source root.
    ///
    /// Depends only on the basename, the entry kind, and this map — never
    /// on file content or metadata.
    pub fn classify_top_level_dir(&self, origin: Origin, name: &str) -> Route {
        if is_excluded_name(name) {
            return Route::Excluded;
        }
        if name == "found.000" {
            return Route::Bucket(PathBuf::from(RECOVERY_SUBPATH));
        }
        if self.as_is.contains(&name) {
            return Route::Bucket(PathBuf::from(name));
        }
        match self.mapped.get(name) {
            Some(subpath) => Route::Bucket(PathBuf::from(subpath)),
            None => Route::Unmapped(
                Path::new(UNMAPPED_SUBPATH).join(origin.as_str()).join(name),
            ),
        }
    }

    /// Route a loose file found at depth 1 under a source root. Image
    /// extensions go to the photo from-root bucket, everything else to
    /// loose files; both are per-origin.
    pub fn classify_root_file(&self, origin: Origin, name: &str) -> Route {
        if is_excluded_name(name) {
            return Route::Excluded;
        }
        let base = if has_image_extension(name) {
            ROOT_IMAGE_SUBPATH
        } else {
            LOOSE_SUBPATH
        };
        Route::Unmapped(Path::new(base).join(origin.as_str()).join(name))
    }

    /// All shared destination buckets reachable through this map, for the
    /// collision pairing pass: mapped subpaths, as-is names, and the
    /// recovery path.
    pub fn shared_buckets(&self) -> Vec<(&'static str, PathBuf)> {
        let mut buckets: Vec<(&'static str, PathBuf)> = self
            .mapped
            .iter()
            .map(|(name, subpath)| (*name, PathBuf::from(subpath)))
            .collect();
        for name in self.as_is {
            buckets.push((name, PathBuf::from(name)));
        }
        buckets.push(("found.000", PathBuf::from(RECOVERY_SUBPATH)));
        buckets.sort_by_key(|(name, _)| *name);
        buckets
    }
}

pub fn is_excluded_name(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
}

fn has_image_extension(name: &str) -> bool {
    match Path::new(name).extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}
