//! # paddock-core
//!
//! Per-VM control plane of the paddock hypervisor container runtime.
//!
//! Each VM runs a lifecycle state machine, tracks the volumes, containers
//! and interfaces plugged into it, and can be dumped and picked up again
//! after a daemon restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   paddock-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐  subscribe  ┌────────────────────┐  │
//! │  │       Vm        │────────────▶│    ResponseHub     │  │
//! │  │  - shutdown()   │             │  (fan-out task)    │  │
//! │  │  - add_*()      │             └────────────────────┘  │
//! │  └─────────────────┘                       ▲             │
//! │           │                                │ responses   │
//! │           ▼                                │             │
//! │  ┌─────────────────┐   events   ┌────────────────────┐   │
//! │  │   VmContext     │───────────▶│    Dispatcher      │   │
//! │  │  Mutex<Resources│            │ Running/Terminating│   │
//! │  │   volumes,      │◀───────────│ /None, watchdog    │   │
//! │  │   containers,   │  routed    └────────────────────┘   │
//! │  │   networks>     │  hotplug             ▲              │
//! │  └─────────────────┘  results             │ events       │
//! │           │                               │              │
//! └───────────┼───────────────────────────────┼──────────────┘
//!             ▼                               │
//! ┌──────────────────────────────────────────────────────────┐
//! │     paddock-vm: DriverContext / session runner           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use paddock_core::{ContextConfig, Vm, VolumeDescription};
//! use paddock_vm::{BootConfigBuilder, EmptyDriver};
//!
//! # async fn example(agent: std::sync::Arc<dyn paddock_core::SandboxAgent>) -> paddock_core::Result<()> {
//! let boot = BootConfigBuilder::new().vcpus(2).memory_mib(512).build()?;
//! let vm = Vm::boot(None, boot, &EmptyDriver, agent, ContextConfig::from_env()).await?;
//!
//! let result = vm
//!     .add_volume(VolumeDescription {
//!         name: "data".into(),
//!         source: "/srv/data".into(),
//!         format: "vfs".into(),
//!         fstype: "dir".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! assert!(result.success);
//!
//! // hand the VM over to another daemon
//! let snapshot = vm.release().await?;
//! # Ok(())
//! # }
//! ```

mod agent;
mod config;
mod context;
mod error;
mod fanout;
mod persist;
mod pool;
mod resource;
mod state;
mod types;
mod vm;

pub use agent::{
    GuestContainer, GuestSandbox, GuestVolume, InterfaceUpdate, Process, Route, SandboxAgent,
};
pub use config::{
    ContextConfig, ContextConfigBuilder, DEFAULT_SANDBOX_STOP_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT,
};
pub use context::VmContext;
pub use error::{CoreError, Result};
pub use fanout::Subscription;
pub use persist::{
    check_version, PersistInfo, PersistVolumeInfo, COMPATIBLE_PERSIST_VERSION,
    CURRENT_PERSIST_VERSION,
};
pub use pool::{PoolConfig, PoolStats, VmLauncher, VmPool, POOL_FIRST_CID};
pub use resource::{
    ContainerState, HardwareStatus, InterfaceRecord, FIRST_ATTACH_ID, FIRST_PCI_ADDR,
};
pub use state::VmState;
pub use types::{
    result_channel, ContainerDescription, InterfaceDescription, NeighborNetworks,
    PortDescription, ResponseCode, ResultReceiver, ResultSender, SandboxConfig, UserGroupInfo,
    VmResponse, VmResult, VolumeDescription, VolumeOption, VolumeReference, DIR_VOLUME_FORMAT,
};
pub use vm::Vm;
