use std::fmt;
use std::path::PathBuf;

/// Represents a block device that can be used as a flash target.
///
/// This struct holds the information shown to the user when picking a target:
/// its system path, size and mount point. It is populated by the
/// platform-specific discovery functions in the [`crate::platform`] module.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The total size of the device in gigabytes (GB).
    pub size_gb: f64,
    /// Whether the kernel reports the media as removable.
    pub removable: bool,
    /// The primary mount point of the device or one of its partitions, if any.
    pub mount_point: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };
        let kind = if self.removable { "removable" } else { "fixed" };

        write!(
            f,
            "{:<15} {:>7.1} GB {:<9} {}",
            self.path.display(),
            self.size_gb,
            kind,
            mount_info
        )
    }
}
