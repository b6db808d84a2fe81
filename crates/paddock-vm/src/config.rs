//! Boot configuration handed to a driver when launching a VM.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lowest usable vsock guest CID; 0, 1 and 2 are reserved.
pub const MIN_GUEST_CID: u32 = 3;

/// Configuration used to boot a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    /// Number of virtual CPUs (1-255)
    pub vcpu_count: u8,
    /// Memory size in MiB
    pub memory_mib: u32,
    /// Allow CPU and memory to be hot-added after boot
    pub hotplug_cpu_mem: bool,
    /// Path to kernel image
    pub kernel_path: PathBuf,
    /// Path to initrd image (optional)
    pub initrd_path: Option<PathBuf>,
    /// Path to a firmware image, used instead of a kernel when set
    pub bios_path: Option<PathBuf>,
    /// Path to a coreboot filesystem image, used together with `bios_path`
    pub cbfs_path: Option<PathBuf>,
    /// Boot the VM so it can be saved as a template
    pub boot_to_template: bool,
    /// Boot the VM from a previously saved template
    pub boot_from_template: bool,
    /// Template memory file, required for template boots
    pub memory_path: Option<PathBuf>,
    /// Template device state file, required when booting from a template
    pub devices_state_path: Option<PathBuf>,
    /// vsock guest CID, `None` disables vsock
    pub vsock_cid: Option<u32>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            memory_mib: 128,
            hotplug_cpu_mem: false,
            kernel_path: PathBuf::from("/var/lib/paddock/kernel"),
            initrd_path: Some(PathBuf::from("/var/lib/paddock/hyper-initrd.img")),
            bios_path: None,
            cbfs_path: None,
            boot_to_template: false,
            boot_from_template: false,
            memory_path: None,
            devices_state_path: None,
            vsock_cid: None,
        }
    }
}

impl BootConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid or two
    /// options cannot be combined.
    pub fn validate(&self) -> Result<()> {
        if self.vcpu_count == 0 {
            return Err(VmError::Config("vcpu_count must be at least 1".into()));
        }

        if self.memory_mib < 64 {
            return Err(VmError::Config(format!(
                "memory_mib must be at least 64, got {}",
                self.memory_mib
            )));
        }

        if self.bios_path.is_none() && self.kernel_path.as_os_str().is_empty() {
            return Err(VmError::Config(
                "either kernel_path or bios_path is required".into(),
            ));
        }

        if self.cbfs_path.is_some() && self.bios_path.is_none() {
            return Err(VmError::Config("cbfs_path requires bios_path".into()));
        }

        if self.boot_to_template && self.boot_from_template {
            return Err(VmError::Config(
                "boot_to_template and boot_from_template are mutually exclusive".into(),
            ));
        }

        if (self.boot_to_template || self.boot_from_template) && self.memory_path.is_none() {
            return Err(VmError::Config("template boot requires memory_path".into()));
        }

        if self.boot_from_template && self.devices_state_path.is_none() {
            return Err(VmError::Config(
                "booting from a template requires devices_state_path".into(),
            ));
        }

        if let Some(cid) = self.vsock_cid {
            if cid < MIN_GUEST_CID {
                return Err(VmError::Config(format!(
                    "vsock guest cid must be >= {MIN_GUEST_CID}, got {cid}"
                )));
            }
        }

        Ok(())
    }
}
