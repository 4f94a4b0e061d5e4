//! Image files: discovery in an images directory and the paths derived from them.
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of the partial output written during an extraction.
pub const PARTIAL_SUFFIX: &str = ".part";
/// Extension of the sidecar file holding an expected SHA-256 value.
pub const SIDECAR_SUFFIX: &str = ".checksum";

/// The on-disk format of an image, decided from its file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// A raw `.img` file.
    Raw,
    /// An xz-compressed `.img.xz` file.
    Xz,
}

impl ImageFormat {
    /// Classifies a path, returning `None` for unsupported files.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".img.xz") {
            Some(Self::Xz)
        } else if name.ends_with(".img") {
            Some(Self::Raw)
        } else {
            None
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Xz)
    }
}

/// Returns whether `path` names an image in a compressed format.
pub fn is_compressed(path: &Path) -> bool {
    ImageFormat::from_path(path).is_some_and(ImageFormat::is_compressed)
}

/// The final output path of extracting `compressed` (the `.xz` suffix stripped).
///
/// Returns `None` unless `compressed` names an `.img.xz` image, so the result
/// never coincides with the source.
pub fn extracted_path(compressed: &Path) -> Option<PathBuf> {
    if !is_compressed(compressed) {
        return None;
    }
    let name = compressed.file_name()?.to_str()?.strip_suffix(".xz")?;
    Some(compressed.with_file_name(name))
}

/// The temporary sibling an extraction writes to before the final rename.
pub fn partial_path(output: &Path) -> PathBuf {
    append_suffix(output, PARTIAL_SUFFIX)
}

/// The sidecar file expected to hold the SHA-256 of `image`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    append_suffix(image, SIDECAR_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Lists the supported images (`.img`, `.img.xz`) directly inside `dir`.
///
/// Hidden entries and macOS `._` metadata files are skipped. The result is
/// sorted by file name so refreshes keep a stable order.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)?.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        let path = entry.path();
        if ImageFormat::from_path(&path).is_some() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
