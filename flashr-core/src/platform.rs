//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! perform tasks that are not cross-platform: discovering candidate block
//! devices, unmounting a device's partitions before it is flashed, and
//! detecting the host board.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct implementation
//! for the target OS. Each submodule exposes the same public API, so that the
//! rest of the library can use it without worrying about the underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use self::unsupported::*;

/// Returns the parent disk of a partition name.
///
/// `nvme0n1p2` becomes `nvme0n1`, `mmcblk0p1` becomes `mmcblk0` and `sda1`
/// becomes `sda`. Names that are already whole disks are returned unchanged.
pub fn parent_device_name(name: &str) -> &str {
    if name.starts_with("nvme") || name.starts_with("mmcblk") || name.starts_with("loop") {
        if let Some(idx) = name.rfind('p') {
            let (disk, part) = name.split_at(idx);
            if part.len() > 1 && part[1..].bytes().all(|b| b.is_ascii_digit()) {
                return disk;
            }
        }
        return name;
    }
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}
