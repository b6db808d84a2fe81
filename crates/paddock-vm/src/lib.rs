//! # paddock-vm
//!
//! Hypervisor-facing layer of the paddock runtime.
//!
//! This crate defines what a hypervisor backend has to provide and how its
//! results travel back to the VM that asked for them:
//!
//! - **Driver contract**: [`HypervisorDriver`] creates or reloads a
//!   per-VM [`DriverContext`], whose calls never block and report through
//!   the VM's event queue.
//! - **Events**: the closed [`VmEvent`] set consumed by a VM's dispatcher.
//! - **Session protocol**: [`SessionHandle`] serializes hotplug command
//!   batches over one control channel with FIFO ordering, bounded retries,
//!   a handshake timeout and fatal channel errors.
//! - **Session-backed driver**: [`SessionDriver`] turns hotplug, pause and
//!   power requests into command sessions on a [`CommandChannel`].
//! - **Usage counters**: [`VmStats`], reported by [`DriverContext::stats`].
//! - **Boot configuration**: [`BootConfig`] and its builder.
//!
//! ## Quick Start
//!
//! ```
//! use paddock_vm::{event_queue, BootConfigBuilder, EmptyDriver, HypervisorDriver, VmEvent};
//!
//! # fn example() -> paddock_vm::Result<()> {
//! let config = BootConfigBuilder::new().vcpus(2).memory_mib(256).build()?;
//! let (events, mut rx) = event_queue();
//!
//! let ctx = EmptyDriver.init_context("vm-1");
//! ctx.launch(&config, &events);
//! ctx.shutdown(&events);
//! assert_eq!(rx.try_recv().ok(), Some(VmEvent::VmExit));
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod driver;
mod error;
mod event;
pub mod session;
mod session_driver;
mod stats;

pub use builder::BootConfigBuilder;
pub use config::{BootConfig, MIN_GUEST_CID};
pub use driver::{DriverContext, EmptyContext, EmptyDriver, HypervisorDriver};
pub use error::{Result, VmError};
pub use event::{
    event_queue, post, scsi_addr, scsi_device_name, BlockDescriptor, EventReceiver, EventSender,
    GuestNicInfo, HostNicInfo, VmEvent,
};
pub use session::{
    ChannelMessage, CommandChannel, DriverCommand, DriverSession, SessionConfig, SessionHandle,
};
pub use session_driver::{ChannelConnector, SessionContext, SessionDriver};
pub use stats::{BlockStats, CpuStats, MemoryStats, NetworkStats, VmStats};
