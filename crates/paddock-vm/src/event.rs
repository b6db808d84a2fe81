//! The closed set of events consumed by a VM's dispatcher.
//!
//! Commands, driver notifications, timer expiries and failures all travel
//! through one queue per VM as [`VmEvent`] values. Every variant carries
//! enough identity (volume name, interface id, ...) to be routed back to the
//! waiter that caused it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Sending half of a VM's event queue.
pub type EventSender = mpsc::UnboundedSender<VmEvent>;

/// Receiving half of a VM's event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<VmEvent>;

/// Create a new, empty event queue.
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Post an event, ignoring a queue whose dispatcher has already gone.
///
/// Returns `false` if the event was dropped.
pub fn post(events: &EventSender, event: VmEvent) -> bool {
    match events.send(event) {
        Ok(()) => true,
        Err(mpsc::error::SendError(event)) => {
            tracing::debug!(event = %event, "event queue closed, dropping event");
            false
        }
    }
}

/// An event delivered to a VM's dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VmEvent {
    // ---- commands -------------------------------------------------------
    /// Gracefully stop the sandbox and power the VM off.
    Shutdown,
    /// Detach from the VM, leaving it running.
    Release,
    /// Pause (`true`) or resume (`false`) the VM.
    Pause { pause: bool },

    // ---- driver / agent notifications ----------------------------------
    /// The in-guest agent connected after boot.
    InitConnected,
    /// The driver could not launch the VM.
    VmStartFailed { message: String },
    /// The hypervisor process exited.
    VmExit,
    /// A forced kill finished.
    VmKilled { success: bool },
    /// The shutdown watchdog expired.
    VmTimeout,
    /// A pause or resume request completed. `cause` is set on failure.
    PauseResult { pause: bool, cause: Option<String> },
    /// A block device was attached.
    BlockInserted {
        name: String,
        device_name: String,
        scsi_id: u32,
        scsi_addr: String,
    },
    /// A block device was detached.
    BlockRemoved { name: String, success: bool },
    /// A network device was attached.
    NetDevInserted {
        id: String,
        index: u32,
        device_name: String,
        pci_addr: u32,
    },
    /// A network device was detached.
    NetDevRemoved { id: String, index: u32 },

    // ---- failures -------------------------------------------------------
    /// A driver command session failed. `session` is the callback event the
    /// session would have posted on success.
    DeviceFailed {
        session: Option<Box<VmEvent>>,
        reason: String,
    },
    /// The control channel never came up.
    InitFailed { reason: String },
    /// The control channel to the hypervisor or agent broke.
    Interrupted { reason: String },
}

impl VmEvent {
    /// Short, stable name of the event kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Release => "release",
            Self::Pause { .. } => "pause",
            Self::InitConnected => "init_connected",
            Self::VmStartFailed { .. } => "vm_start_failed",
            Self::VmExit => "vm_exit",
            Self::VmKilled { .. } => "vm_killed",
            Self::VmTimeout => "vm_timeout",
            Self::PauseResult { .. } => "pause_result",
            Self::BlockInserted { .. } => "block_inserted",
            Self::BlockRemoved { .. } => "block_removed",
            Self::NetDevInserted { .. } => "netdev_inserted",
            Self::NetDevRemoved { .. } => "netdev_removed",
            Self::DeviceFailed { .. } => "device_failed",
            Self::InitFailed { .. } => "init_failed",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    /// Whether this event is a caller command that expects a reply.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Release | Self::Pause { .. })
    }

    /// Wrap this callback event as the failure of the session that carried it.
    pub fn into_device_failure(self, reason: impl Into<String>) -> VmEvent {
        VmEvent::DeviceFailed {
            session: Some(Box::new(self)),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockInserted { name, .. } | Self::BlockRemoved { name, .. } => {
                write!(f, "{}({})", self.kind(), name)
            }
            Self::NetDevInserted { id, .. } | Self::NetDevRemoved { id, .. } => {
                write!(f, "{}({})", self.kind(), id)
            }
            Self::DeviceFailed {
                session: Some(session),
                ..
            } => write!(f, "device_failed({session})"),
            _ => f.write_str(self.kind()),
        }
    }
}

/// A block device to attach to or detach from the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Volume name, echoed back in completion events
    pub name: String,
    /// Backing file or device on the host
    pub filename: String,
    /// Image format (`raw`, `qcow2`, ...)
    pub format: String,
    /// Filesystem inside the device
    pub fstype: String,
    /// Guest device name (`sda`, ...)
    pub device_name: String,
    /// SCSI id allocated by the VM
    pub scsi_id: u32,
    /// SCSI address derived from the id
    pub scsi_addr: String,
    /// Attach read-only
    pub read_only: bool,
}

/// Host side of a network device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNicInfo {
    /// Interface id, echoed back in completion events
    pub id: String,
    /// Tap device name
    pub device: String,
    /// Bridge the tap device is enslaved to
    pub bridge: String,
    /// Guest MAC address
    pub mac: String,
    /// Gateway address
    pub gateway: String,
}

/// Guest side of a network device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNicInfo {
    /// Guest device name (`eth0`, ...)
    pub device: String,
    /// Guest address in CIDR form
    pub ip_addr: String,
    /// Interface index inside the guest
    pub index: u32,
    /// PCI slot allocated by the VM
    pub pci_addr: u32,
}

/// Compute the SCSI address for a SCSI id.
pub fn scsi_addr(scsi_id: u32) -> String {
    format!("{}:{}", scsi_id / 256, scsi_id % 256)
}

/// Compute the guest device name for a SCSI id: `sda`..`sdz`, `sdaa`, ...
pub fn scsi_device_name(scsi_id: u32) -> String {
    let mut suffix = Vec::new();
    let mut n = scsi_id as u64 + 1;
    while n > 0 {
        n -= 1;
        suffix.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    suffix.reverse();
    format!("sd{}", String::from_utf8_lossy(&suffix))
}
