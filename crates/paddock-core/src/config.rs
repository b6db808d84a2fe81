//! VM context configuration.
//!
//! Configuration is built in code through [`ContextConfig::builder`] or
//! loaded from environment variables with [`ContextConfig::from_env`].

use crate::error::CoreError;
use std::path::PathBuf;
use std::time::Duration;

/// Default watchdog for a graceful shutdown before the VM is killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit for the guest to stop its sandbox.
pub const DEFAULT_SANDBOX_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by every VM a daemon manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Directory holding one sub-directory per VM.
    pub base_dir: PathBuf,
    /// Time the guest gets to shut down before the VM is killed.
    pub shutdown_timeout: Duration,
    /// Time the guest gets to stop its sandbox.
    pub sandbox_stop_timeout: Duration,
    /// Install a default route through every interface's gateway instead of
    /// only the first one.
    pub default_route_every_interface: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/run/paddock/vm"),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            sandbox_stop_timeout: DEFAULT_SANDBOX_STOP_TIMEOUT,
            default_route_every_interface: false,
        }
    }
}

impl ContextConfig {
    /// Create a new config builder.
    pub fn builder() -> ContextConfigBuilder {
        ContextConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PADDOCK_BASE_DIR` | `/var/run/paddock/vm` |
    /// | `PADDOCK_SHUTDOWN_TIMEOUT_SECS` | `10` |
    /// | `PADDOCK_SANDBOX_STOP_TIMEOUT_SECS` | `30` |
    /// | `PADDOCK_DEFAULT_ROUTE_ALL` | `false` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            base_dir: std::env::var("PADDOCK_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.base_dir),
            shutdown_timeout: std::env::var("PADDOCK_SHUTDOWN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.shutdown_timeout),
            sandbox_stop_timeout: std::env::var("PADDOCK_SANDBOX_STOP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.sandbox_stop_timeout),
            default_route_every_interface: std::env::var("PADDOCK_DEFAULT_ROUTE_ALL")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.default_route_every_interface),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(CoreError::spec("base_dir is required"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(CoreError::spec("shutdown_timeout must be > 0"));
        }
        if self.sandbox_stop_timeout.is_zero() {
            return Err(CoreError::spec("sandbox_stop_timeout must be > 0"));
        }
        Ok(())
    }

    /// Per-VM working directory.
    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.base_dir.join(vm_id)
    }

    /// Directory shared with the guest for directory-backed volumes.
    pub fn share_dir(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join("share_dir")
    }
}

/// Builder for [`ContextConfig`].
#[derive(Debug, Default)]
pub struct ContextConfigBuilder {
    config: ContextConfig,
}

impl ContextConfigBuilder {
    /// Set the base directory.
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.base_dir = path.into();
        self
    }

    /// Set the shutdown watchdog.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the sandbox stop limit.
    pub fn sandbox_stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.sandbox_stop_timeout = timeout;
        self
    }

    /// Route through every interface, not just the first.
    pub fn default_route_every_interface(mut self, enabled: bool) -> Self {
        self.config.default_route_every_interface = enabled;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ContextConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.sandbox_stop_timeout, Duration::from_secs(30));
        assert!(!config.default_route_every_interface);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = ContextConfig::builder()
            .shutdown_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(CoreError::Spec(_))));
    }

    #[test]
    fn test_builder_success() {
        let config = ContextConfig::builder()
            .base_dir("/tmp/paddock")
            .shutdown_timeout(Duration::from_secs(3))
            .default_route_every_interface(true)
            .build()
            .expect("should build successfully");

        assert_eq!(config.base_dir, PathBuf::from("/tmp/paddock"));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert!(config.default_route_every_interface);
    }

    /// Every variable overrides its default; unparseable numbers fall back.
    #[test]
    fn test_from_env_overrides() {
        let vars = [
            ("PADDOCK_BASE_DIR", "/tmp/paddock-env"),
            ("PADDOCK_SHUTDOWN_TIMEOUT_SECS", "4"),
            ("PADDOCK_SANDBOX_STOP_TIMEOUT_SECS", "soon"),
            ("PADDOCK_DEFAULT_ROUTE_ALL", "1"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }

        let config = ContextConfig::from_env();

        for (key, _) in vars {
            std::env::remove_var(key);
        }
        assert_eq!(config.base_dir, PathBuf::from("/tmp/paddock-env"));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(4));
        assert_eq!(config.sandbox_stop_timeout, Duration::from_secs(30));
        assert!(config.default_route_every_interface);

        let config = ContextConfig::from_env();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert!(!config.default_route_every_interface);
    }

    #[test]
    fn test_share_dir_layout() {
        let config = ContextConfig::builder()
            .base_dir("/tmp/paddock")
            .build()
            .unwrap();
        assert_eq!(
            config.share_dir("vm-1"),
            PathBuf::from("/tmp/paddock/vm-1/share_dir")
        );
    }
}
