use crate::device::Device;
use anyhow::{Result, anyhow};
use std::path::Path;

/// Device discovery is only implemented for Linux.
pub fn get_candidate_devices() -> Result<Vec<Device>> {
    Err(anyhow!("device discovery is not supported on this platform"))
}

/// Unmounting is only implemented for Linux; nothing is unmounted elsewhere.
pub fn unmount_partitions(_device: &Path) -> Result<usize> {
    Ok(0)
}

pub fn is_raspberry_pi() -> bool {
    false
}

pub fn is_root() -> bool {
    false
}
