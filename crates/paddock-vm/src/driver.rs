//! Hypervisor driver contract.
//!
//! A [`HypervisorDriver`] is selected once at daemon start and injected into
//! every VM. It creates one [`DriverContext`] per VM, either fresh or from a
//! persisted blob. Every mutating call on a context returns immediately and
//! reports completion by posting an event onto the VM's queue.

use crate::config::BootConfig;
use crate::error::{Result, VmError};
use crate::event::{BlockDescriptor, EventSender, GuestNicInfo, HostNicInfo, VmEvent};
use crate::stats::VmStats;
use serde_json::{json, Value};

/// A hypervisor backend.
pub trait HypervisorDriver: Send + Sync {
    /// Backend name, also recorded in persisted driver state.
    fn name(&self) -> &'static str;

    /// Create a context for a new VM.
    fn init_context(&self, vm_id: &str) -> Box<dyn DriverContext>;

    /// Rebuild a context for a running VM from its persisted state.
    ///
    /// # Errors
    /// Returns an error if the blob was not produced by this backend or is
    /// malformed.
    fn load_context(&self, vm_id: &str, persisted: &Value) -> Result<Box<dyn DriverContext>>;

    /// Whether disks and NICs can be attached after boot.
    fn supports_hotplug(&self) -> bool {
        true
    }
}

/// Per-VM handle to a hypervisor backend.
///
/// Implementations must not block and must not call back into the VM; all
/// results go through `events`. Hotplug calls receive the `callback` event to
/// post on success. On failure they post
/// [`VmEvent::DeviceFailed`] wrapping that callback instead.
pub trait DriverContext: Send + Sync {
    /// Boot the VM. Posts `VmStartFailed` if the hypervisor cannot start.
    fn launch(&self, config: &BootConfig, events: &EventSender);

    /// Reconnect to an already running VM.
    fn associate(&self, events: &EventSender);

    /// Backend state needed by [`HypervisorDriver::load_context`].
    fn dump(&self) -> Result<Value>;

    /// Attach a block device.
    fn add_disk(&self, block: &BlockDescriptor, callback: VmEvent, events: &EventSender);

    /// Detach a block device.
    fn remove_disk(&self, block: &BlockDescriptor, callback: VmEvent, events: &EventSender);

    /// Attach a network device.
    fn add_nic(
        &self,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        callback: VmEvent,
        events: &EventSender,
    );

    /// Detach a network device.
    fn remove_nic(&self, id: &str, pci_addr: u32, callback: VmEvent, events: &EventSender);

    /// Pause or resume the guest. Posts `PauseResult`.
    fn pause(&self, pause: bool, events: &EventSender);

    /// Power the VM off. Posts `VmExit` once the hypervisor is gone.
    fn shutdown(&self, events: &EventSender);

    /// Kill the hypervisor process. Posts `VmKilled`.
    fn kill(&self, events: &EventSender);

    /// Current resource usage. Unlike the other calls this answers
    /// directly, from counters the backend already holds.
    ///
    /// # Errors
    /// Returns an error if the backend cannot report usage.
    fn stats(&self) -> Result<VmStats> {
        Err(VmError::Driver("stats not supported by this driver".into()))
    }

    /// Release driver resources. Must be idempotent.
    fn close(&self);
}

/// A backend that does nothing.
///
/// Useful for VMs whose hypervisor is managed elsewhere and as a
/// reassociation target in tests. Hotplug requests complete at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyDriver;

const EMPTY_DRIVER_NAME: &str = "empty";

impl HypervisorDriver for EmptyDriver {
    fn name(&self) -> &'static str {
        EMPTY_DRIVER_NAME
    }

    fn init_context(&self, _vm_id: &str) -> Box<dyn DriverContext> {
        Box::new(EmptyContext)
    }

    fn load_context(&self, _vm_id: &str, persisted: &Value) -> Result<Box<dyn DriverContext>> {
        match persisted.get("hypervisor").and_then(Value::as_str) {
            Some(EMPTY_DRIVER_NAME) => Ok(Box::new(EmptyContext)),
            other => Err(VmError::Driver(format!(
                "wrong driver type in persisted state: {}",
                other.unwrap_or("<missing>")
            ))),
        }
    }

    fn supports_hotplug(&self) -> bool {
        false
    }
}

/// Context created by [`EmptyDriver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyContext;

impl DriverContext for EmptyContext {
    fn launch(&self, _config: &BootConfig, _events: &EventSender) {}

    fn associate(&self, _events: &EventSender) {}

    fn dump(&self) -> Result<Value> {
        Ok(json!({ "hypervisor": EMPTY_DRIVER_NAME }))
    }

    fn add_disk(&self, _block: &BlockDescriptor, callback: VmEvent, events: &EventSender) {
        crate::event::post(events, callback);
    }

    fn remove_disk(&self, _block: &BlockDescriptor, callback: VmEvent, events: &EventSender) {
        crate::event::post(events, callback);
    }

    fn add_nic(
        &self,
        _host: &HostNicInfo,
        _guest: &GuestNicInfo,
        callback: VmEvent,
        events: &EventSender,
    ) {
        crate::event::post(events, callback);
    }

    fn remove_nic(&self, _id: &str, _pci_addr: u32, callback: VmEvent, events: &EventSender) {
        crate::event::post(events, callback);
    }

    fn pause(&self, pause: bool, events: &EventSender) {
        crate::event::post(events, VmEvent::PauseResult { pause, cause: None });
    }

    fn shutdown(&self, events: &EventSender) {
        crate::event::post(events, VmEvent::VmExit);
    }

    fn kill(&self, events: &EventSender) {
        crate::event::post(events, VmEvent::VmKilled { success: true });
    }

    fn stats(&self) -> Result<VmStats> {
        Ok(VmStats::default())
    }

    fn close(&self) {}
}
