//! In-guest agent contract.
//!
//! The agent runs inside the guest and manages the sandbox there. Its
//! transport is backend-specific; the VM only needs the calls below.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Process id, unique within the container
    pub id: String,
    #[serde(default)]
    pub terminal: bool,
    /// Stdio stream sequence allocated by the VM
    #[serde(default)]
    pub stdio: u64,
    /// Stderr stream sequence, 0 when stderr shares the terminal
    #[serde(default)]
    pub stderr: u64,
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub user: String,
}

/// A block or directory volume as seen from the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestVolume {
    /// Guest device (`sda`) or share-dir relative path for directories
    pub device: String,
    /// SCSI address, empty for directories
    #[serde(default)]
    pub addr: String,
    /// Mount point inside the container
    pub mount: String,
    pub fstype: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Container definition sent to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestContainer {
    pub id: String,
    /// Root device or share-dir path
    pub image: String,
    /// SCSI address of the root device, empty for directory roots
    #[serde(default)]
    pub addr: String,
    pub fstype: String,
    /// Root filesystem path inside the root volume
    pub rootfs: String,
    pub volumes: Vec<GuestVolume>,
    #[serde(default)]
    pub sysctl: BTreeMap<String, String>,
    pub process: Process,
    #[serde(default)]
    pub initialize: bool,
}

/// A guest route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination in CIDR form
    pub dest: String,
    #[serde(default)]
    pub gateway: String,
    /// Guest device the route goes through
    #[serde(default)]
    pub device: String,
}

/// Guest-side configuration of one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceUpdate {
    pub device: String,
    pub ip_address: String,
    pub netmask: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub mtu: u32,
}

/// Sandbox definition sent to the agent when it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSandbox {
    pub hostname: String,
    #[serde(default)]
    pub dns: Vec<String>,
    pub interfaces: Vec<InterfaceUpdate>,
    pub routes: Vec<Route>,
    /// Share directory tag for directory-backed volumes
    pub share_dir: String,
}

/// Calls the VM makes into the in-guest agent.
#[async_trait]
pub trait SandboxAgent: Send + Sync {
    /// Agent protocol version; doubles as a liveness check.
    async fn api_version(&self) -> Result<u32>;

    async fn start_sandbox(&self, sandbox: &GuestSandbox) -> Result<()>;

    async fn destroy_sandbox(&self) -> Result<()>;

    async fn new_container(&self, container: &GuestContainer) -> Result<()>;

    async fn add_process(&self, container: &str, process: &Process) -> Result<()>;

    async fn signal_process(&self, container: &str, process: &str, signal: i32) -> Result<()>;

    /// Wait for a process to exit and return its exit status.
    async fn wait_process(&self, container: &str, process: &str) -> Result<i32>;

    async fn update_interface(&self, update: &InterfaceUpdate) -> Result<()>;

    async fn add_route(&self, routes: &[Route]) -> Result<()>;

    async fn write_stdin(&self, container: &str, process: &str, data: &[u8]) -> Result<usize>;

    async fn read_stdout(&self, container: &str, process: &str, max: usize) -> Result<Vec<u8>>;

    async fn close_stdin(&self, container: &str, process: &str) -> Result<()>;

    /// Write `data` to `path` inside a container's root filesystem,
    /// replacing any existing file.
    async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Read the whole file at `path` inside a container's root filesystem.
    async fn read_file(&self, container: &str, path: &str) -> Result<Vec<u8>>;

    /// Bring hot-added CPUs and memory online.
    async fn online_cpu_mem(&self) -> Result<()>;
}
