use super::parent_device_name;
use crate::device::Device;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Kernel name of a mounted disk as reported by `sysinfo` (e.g. "sda1").
fn kernel_name(disk: &sysinfo::Disk) -> String {
    let name = disk.name().to_string_lossy();
    name.rsplit('/').next().unwrap_or_default().to_string()
}

/// Scans for the block devices that are safe to offer as flash targets.
///
/// This function discovers devices by iterating through the `/sys/block` directory.
/// The filtering logic is as follows:
/// 1.  Find the device holding the root filesystem and exclude both it and its
///     parent disk, so the running system can never be selected.
/// 2.  Skip loop and ram devices.
/// 3.  Skip devices that report a size of zero, which often corresponds to
///     empty card readers.
///
/// # Returns
///
/// A `Result<Vec<Device>>` which is a list of discovered [`Device`]s on success,
/// or an error if the system drive cannot be determined or `/sys/block` cannot be read.
pub fn get_candidate_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let mut excluded = HashSet::new();
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let name = kernel_name(disk);
            excluded.insert(parent_device_name(&name).to_string());
            excluded.insert(name);
        }
    }
    if excluded.is_empty() {
        return Err(anyhow!("Could not determine system drive."));
    }

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block").context("cannot read /sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();

        if device_name.starts_with("loop")
            || device_name.starts_with("ram")
            || excluded.contains(&device_name)
        {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .and_then(|s| {
                s.parse::<u64>()
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
            })
            .unwrap_or(0);

        if size_sectors == 0 {
            continue;
        }

        let size_gb = (size_sectors * 512) as f64 / (1024.0 * 1024.0 * 1024.0);
        let removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        let mount_point = mount_points_of(&disks, &device_name)
            .into_iter()
            .next()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        devices.push(Device {
            path: PathBuf::from("/dev/").join(&device_name),
            name: device_name,
            size_gb,
            removable,
            mount_point,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Mount points of `device_name` itself and of all its partitions.
fn mount_points_of(disks: &sysinfo::Disks, device_name: &str) -> Vec<PathBuf> {
    disks
        .iter()
        .filter(|disk| {
            let name = kernel_name(disk);
            name == device_name || parent_device_name(&name) == device_name
        })
        .map(|disk| disk.mount_point().to_path_buf())
        .filter(|mp| !mp.as_os_str().is_empty())
        .collect()
}

/// Unmounts every mounted partition of `device` (e.g. `/dev/sdb1`, `/dev/sdb2`).
///
/// Returns the number of filesystems unmounted. Every mount point is tried;
/// failures are collected into one error. Callers treat it as non-fatal.
pub fn unmount_partitions(device: &Path) -> Result<usize> {
    let device_name = device
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("{} is not a device path", device.display()))?;

    let disks = sysinfo::Disks::new_with_refreshed_list();
    unmount_all(&mount_points_of(&disks, &device_name), |mp| {
        nix::mount::umount(mp)
    })
}

fn unmount_all(
    mount_points: &[PathBuf],
    mut umount: impl FnMut(&Path) -> nix::Result<()>,
) -> Result<usize> {
    let mut count = 0;
    let mut failures = Vec::new();
    for mount_point in mount_points {
        match umount(mount_point) {
            Ok(()) => {
                tracing::info!(mount_point = %mount_point.display(), "unmounted");
                count += 1;
            }
            Err(e) => {
                tracing::warn!(mount_point = %mount_point.display(), error = %e, "umount failed");
                failures.push(format!("umount {}: {e}", mount_point.display()));
            }
        }
    }
    if failures.is_empty() {
        Ok(count)
    } else {
        bail!(
            "{} of {} unmounts failed: {}",
            failures.len(),
            mount_points.len(),
            failures.join("; ")
        )
    }
}

/// Whether the host is a Raspberry Pi (which enables EEPROM configuration).
pub fn is_raspberry_pi() -> bool {
    ["/proc/device-tree/model", "/proc/cpuinfo"]
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .any(|text| text.contains("Raspberry Pi"))
}

/// Whether the current process runs with root privileges.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn unmount_keeps_going_after_a_failure() {
        let points: Vec<PathBuf> = ["/media/boot", "/media/root", "/media/data"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let mut tried = Vec::new();
        let err = unmount_all(&points, |mp| {
            tried.push(mp.to_path_buf());
            if mp.ends_with("boot") {
                Err(Errno::EBUSY)
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(tried, points);
        let message = err.to_string();
        assert!(message.starts_with("1 of 3 unmounts failed"));
        assert!(message.contains("/media/boot"));
    }

    #[test]
    fn unmount_counts_successes() {
        let points = vec![PathBuf::from("/media/a"), PathBuf::from("/media/b")];
        assert_eq!(unmount_all(&points, |_| Ok(())).unwrap(), 2);
        assert_eq!(unmount_all(&[], |_| Ok(())).unwrap(), 0);
    }
}
