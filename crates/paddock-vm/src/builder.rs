//! Builder for [`BootConfig`].

use crate::config::BootConfig;
use crate::error::Result;
use std::path::PathBuf;

/// Fluent builder for boot configurations.
///
/// # Example
///
/// ```
/// use paddock_vm::BootConfigBuilder;
///
/// # fn example() -> paddock_vm::Result<()> {
/// let config = BootConfigBuilder::new()
///     .vcpus(2)
///     .memory_mib(512)
///     .kernel("/path/to/kernel")
///     .initrd("/path/to/initrd.img")
///     .build()?;
/// assert_eq!(config.vcpu_count, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BootConfigBuilder {
    config: BootConfig,
}

impl BootConfigBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of virtual CPUs.
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Allow CPU and memory hot-add.
    pub fn hotplug_cpu_mem(mut self) -> Self {
        self.config.hotplug_cpu_mem = true;
        self
    }

    /// Set the path to the kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the path to the initrd image.
    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.initrd_path = Some(path.into());
        self
    }

    /// Boot from firmware, optionally with a coreboot filesystem image.
    pub fn bios(mut self, bios: impl Into<PathBuf>, cbfs: Option<PathBuf>) -> Self {
        self.config.bios_path = Some(bios.into());
        self.config.cbfs_path = cbfs;
        self
    }

    /// Boot so that the VM can be saved as a template at `memory_path`.
    pub fn save_as_template(mut self, memory_path: impl Into<PathBuf>) -> Self {
        self.config.boot_to_template = true;
        self.config.memory_path = Some(memory_path.into());
        self
    }

    /// Boot from a saved template.
    pub fn restore_from_template(
        mut self,
        memory_path: impl Into<PathBuf>,
        devices_state_path: impl Into<PathBuf>,
    ) -> Self {
        self.config.boot_from_template = true;
        self.config.memory_path = Some(memory_path.into());
        self.config.devices_state_path = Some(devices_state_path.into());
        self
    }

    /// Enable vsock with the given guest CID.
    pub fn vsock_cid(mut self, cid: u32) -> Self {
        self.config.vsock_cid = Some(cid);
        self
    }

    /// Return the configuration without validating it.
    pub fn build_config(self) -> BootConfig {
        self.config
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    /// Returns [`VmError::Config`](crate::VmError::Config) if validation fails.
    pub fn build(self) -> Result<BootConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_vcpus_memory() {
        let config = BootConfigBuilder::new()
            .vcpus(4)
            .memory_mib(512)
            .build_config();

        assert_eq!(config.vcpu_count, 4);
        assert_eq!(config.memory_mib, 512);
    }

    #[test]
    fn test_builder_kernel_initrd() {
        let config = BootConfigBuilder::new()
            .kernel("/path/to/kernel")
            .initrd("/path/to/initrd")
            .build_config();

        assert_eq!(config.kernel_path, PathBuf::from("/path/to/kernel"));
        assert_eq!(config.initrd_path, Some(PathBuf::from("/path/to/initrd")));
    }

    #[test]
    fn test_builder_rejects_both_template_modes() {
        let result = BootConfigBuilder::new()
            .save_as_template("/tmp/mem")
            .restore_from_template("/tmp/mem", "/tmp/state")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_from_template() {
        let config = BootConfigBuilder::new()
            .restore_from_template("/tmp/mem", "/tmp/state")
            .build()
            .expect("template config should be valid");

        assert!(config.boot_from_template);
        assert_eq!(config.devices_state_path, Some(PathBuf::from("/tmp/state")));
    }

    #[test]
    fn test_builder_vsock() {
        let config = BootConfigBuilder::new().vsock_cid(7).build_config();
        assert_eq!(config.vsock_cid, Some(7));
    }
}
