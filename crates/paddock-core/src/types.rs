//! Request descriptions and the result surface of a VM.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

/// Format marking a directory-backed volume.
pub const DIR_VOLUME_FORMAT: &str = "vfs";

/// A storage volume, either a host directory shared into the guest or a
/// block device hot-plugged into it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescription {
    /// Unique volume name within the VM
    pub name: String,
    /// Host path or device backing the volume
    pub source: String,
    /// `vfs` for directories, `raw`/`qcow2`/... for block devices
    pub format: String,
    /// Filesystem type, `dir` for directories
    pub fstype: String,
    /// Attach read-only
    #[serde(default)]
    pub read_only: bool,
    /// Volume managed by a container engine rather than the runtime
    #[serde(default)]
    pub docker_volume: bool,
    /// Backend-specific options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VolumeOption>,
}

impl VolumeDescription {
    /// Whether this volume is a shared host directory.
    pub fn is_dir(&self) -> bool {
        self.format == DIR_VOLUME_FORMAT
    }
}

/// Options for network-backed and throttled volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOption {
    pub user: String,
    pub monitors: Vec<String>,
    pub keyring: String,
    pub bytes_per_sec: u64,
    pub iops: u64,
}

/// A container's use of a shared volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReference {
    /// Mount point inside the container
    pub path: String,
    /// Name of the referenced volume
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
}

/// User and groups a container process runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupInfo {
    pub user: String,
    pub group: String,
    #[serde(default)]
    pub additional_groups: Vec<String>,
}

/// Everything needed to provision and start one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescription {
    /// Unique container id within the VM
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stop_signal: String,
    /// Root filesystem volume, owned by this container alone
    pub root_volume: VolumeDescription,
    /// Path of the root filesystem inside the root volume
    pub root_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserGroupInfo>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    pub workdir: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub sysctl: BTreeMap<String, String>,
    /// Shared volumes, keyed by volume name
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeReference>,
    /// Initialize the container environment on start
    #[serde(default)]
    pub initialize: bool,
}

/// A network interface to plug into the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescription {
    /// Caller-chosen identifier
    pub id: String,
    /// Loopback interface, no device is hot-plugged
    #[serde(default)]
    pub lo: bool,
    #[serde(default)]
    pub bridge: String,
    /// Address in `a.b.c.d/len` form
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub tap_name: String,
    #[serde(default)]
    pub mtu: u32,
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

/// Networks allowed to reach mapped ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborNetworks {
    #[serde(default)]
    pub internal_networks: Vec<String>,
    #[serde(default)]
    pub external_networks: Vec<String>,
}

/// Sandbox-wide guest settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub hostname: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<NeighborNetworks>,
}

/// Outcome of one resource operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResult {
    /// Id of the resource the operation was about
    pub id: String,
    pub success: bool,
    /// Failure cause, empty on success
    pub message: String,
}

impl VmResult {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            message: message.into(),
        }
    }
}

/// Where resource operation outcomes are delivered.
pub type ResultSender = mpsc::UnboundedSender<VmResult>;

/// Receiving side of a [`ResultSender`].
pub type ResultReceiver = mpsc::UnboundedReceiver<VmResult>;

/// Create a result target.
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    mpsc::unbounded_channel()
}

/// Deliver a result, ignoring a caller that stopped listening.
pub(crate) fn report(target: &ResultSender, result: VmResult) {
    if target.send(result).is_err() {
        tracing::trace!("result target closed, dropping result");
    }
}

/// Kind of a streamed VM response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    /// The guest agent is up
    VmRunning,
    /// The sandbox started inside the guest
    SandboxRunning,
    /// The sandbox stopped inside the guest
    SandboxStopped,
    /// The VM is gone. Sent once per VM lifetime.
    VmShutdown,
    /// A command completed
    Ok,
    /// A command could not run because a resource is busy
    Busy,
    /// A command was malformed
    BadRequest,
    /// A command arrived in a state that does not accept it
    Unexpected,
    /// A fault occurred
    Failed,
    /// A pause or resume completed
    PauseResult,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VmRunning => "vm_running",
            Self::SandboxRunning => "sandbox_running",
            Self::SandboxStopped => "sandbox_stopped",
            Self::VmShutdown => "vm_shutdown",
            Self::Ok => "ok",
            Self::Busy => "busy",
            Self::BadRequest => "bad_request",
            Self::Unexpected => "unexpected",
            Self::Failed => "failed",
            Self::PauseResult => "pause_result",
        };
        f.write_str(s)
    }
}

/// A status message streamed to every subscriber of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResponse {
    pub vm_id: String,
    pub code: ResponseCode,
    /// Human-readable detail, empty when there is none
    pub cause: String,
    /// Code-specific payload (the pause flag for `PauseResult`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl VmResponse {
    pub fn new(vm_id: impl Into<String>, code: ResponseCode, cause: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            code,
            cause: cause.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
