//! Determines how many bytes an operation is expected to move.
//!
//! Raw images are measured directly. For compressed images the decompressor's
//! human-readable listing (`xz -l`) is parsed for the *uncompressed* size. If
//! that fails, the compressed size times a small multiplier is used as a rough
//! placeholder and the estimate is flagged as inexact.
use crate::operation::{OperationKind, SizeEstimate};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

/// Multiplier applied to the compressed size when the listing is unusable.
pub const DEFAULT_SIZE_MULTIPLIER: u64 = 4;

static SIZE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9][0-9,]*(?:\.[0-9]+)?)\s*(B|KiB|MiB|GiB|TiB)\b").expect("valid size regex")
});

/// Converts a number with optional thousands separators and a binary unit
/// suffix into bytes, e.g. `("1,536.0", "KiB")` → `1572864`.
pub fn parse_human_size(number: &str, unit: &str) -> Option<u64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    let multiplier: u64 = match unit.trim() {
        "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        _ => return None,
    };
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

/// Extracts the uncompressed size of `file_name` from an `xz -l` listing.
///
/// The row naming the file is preferred; its second size field is the
/// uncompressed one (the first is the compressed size). When no row names the
/// file, the last row carrying two size fields (the totals row) is used.
pub fn parse_listing(listing: &str, file_name: &str) -> Option<u64> {
    let second_size = |line: &str| -> Option<u64> {
        let caps = SIZE_FIELD.captures_iter(line).nth(1)?;
        parse_human_size(&caps[1], &caps[2])
    };

    listing
        .lines()
        .filter(|line| !file_name.is_empty() && line.contains(file_name))
        .find_map(second_size)
        .or_else(|| {
            listing
                .lines()
                .rev()
                .filter(|line| !line.trim().is_empty())
                .find_map(second_size)
        })
}

/// The byte count a meter line starts with.
///
/// `pv` lines look like `1.50GiB 0:00:04 [ 245MiB/s] [=====>  ] 45% ETA 0:00:05`;
/// lines that do not start with a size yield `None`.
pub fn transferred_bytes(line: &str) -> Option<u64> {
    let caps = SIZE_FIELD.captures(line.trim_start())?;
    if caps.get(0)?.start() != 0 {
        return None;
    }
    parse_human_size(&caps[1], &caps[2])
}

/// Size estimation for one source artifact.
pub struct SizeEstimator {
    multiplier: u64,
}

impl Default for SizeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_MULTIPLIER)
    }
}

impl SizeEstimator {
    pub fn new(multiplier: u64) -> Self {
        Self {
            multiplier: multiplier.max(1),
        }
    }

    /// Estimates the bytes `kind` will move for `source`.
    ///
    /// `listing` is the decompressor listing command, used only for compressed
    /// sources. A source whose size cannot be read yields
    /// [`SizeEstimate::UNKNOWN`]; that is "no size info", not an error.
    pub fn estimate(
        &self,
        source: &Path,
        compressed: bool,
        kind: OperationKind,
        listing: Option<Command>,
    ) -> SizeEstimate {
        let on_disk = match fs::metadata(source) {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::debug!(source = %source.display(), error = %e, "cannot stat source");
                return SizeEstimate::UNKNOWN;
            }
        };

        // A check streams the file as stored, compressed or not.
        if !compressed || kind == OperationKind::Check {
            return SizeEstimate::exact(on_disk);
        }

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(bytes) = listing.and_then(|cmd| run_listing(cmd, &file_name)) {
            return SizeEstimate::exact(bytes);
        }
        SizeEstimate::estimated(on_disk.saturating_mul(self.multiplier))
    }
}

fn run_listing(mut cmd: Command, file_name: &str) -> Option<u64> {
    let output = match cmd.output() {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(error = %e, "size listing could not run");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(status = %output.status, "size listing failed");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_listing(&text, file_name)
}
