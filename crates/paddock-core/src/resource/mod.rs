//! Resource lifecycle manager.
//!
//! Tracks the volumes, containers and network interfaces of one VM. All of
//! it lives in [`Resources`], guarded by the VM-wide lock so that admission
//! checks (duplicate ids, missing volumes, in-use volumes) are atomic with
//! each other. Readiness is tracked asynchronously: a container observes its
//! volumes through a [`Countdown`] and a background task waits on it.
//!
//! The operations themselves are methods on [`VmContext`](crate::VmContext),
//! split by resource kind across the sub-modules.

mod container;
mod disk;
mod network;

pub(crate) use container::ContainerContext;
pub use container::ContainerState;
pub(crate) use disk::{Detach, DiskContext, Readiness};
pub use network::InterfaceRecord;
pub(crate) use network::NetworkContext;

use crate::types::{ResultSender, SandboxConfig, VmResult};
use paddock_vm::{scsi_addr, scsi_device_name, BlockDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// First PCI slot available for hot-plugged devices.
pub const FIRST_PCI_ADDR: u32 = 0x05;

/// First attach id; 0 means "no stream".
pub const FIRST_ATTACH_ID: u64 = 1;

/// Hardware allocation counters. Each only ever grows while the VM lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareStatus {
    /// Next PCI slot
    pub pci_addr: u32,
    /// Next SCSI id
    pub scsi_id: u32,
    /// Next stdio attach id
    pub attach_id: u64,
    /// vsock guest CID, if the VM uses vsock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_cid: Option<u32>,
}

impl Default for HardwareStatus {
    fn default() -> Self {
        Self {
            pci_addr: FIRST_PCI_ADDR,
            scsi_id: 0,
            attach_id: FIRST_ATTACH_ID,
            guest_cid: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Progress {
    pending: usize,
    failure: Option<String>,
}

/// Readiness countdown shared between a container and the volumes it
/// observes.
///
/// Volumes that are not yet ready each hold one count. The waiter finishes
/// when the count reaches zero, when any volume fails, or when every holder
/// has been dropped (the container went away).
#[derive(Debug, Clone)]
pub(crate) struct Countdown(Arc<watch::Sender<Progress>>);

/// Waiting side of a [`Countdown`].
pub(crate) type CountdownWaiter = watch::Receiver<Progress>;

impl Countdown {
    pub(crate) fn new() -> Self {
        Self(Arc::new(watch::Sender::new(Progress::default())))
    }

    pub(crate) fn add(&self) {
        self.0.send_modify(|p| p.pending += 1);
    }

    pub(crate) fn done(&self) {
        self.0.send_modify(|p| p.pending = p.pending.saturating_sub(1));
    }

    pub(crate) fn fail(&self, reason: &str) {
        self.0.send_modify(|p| {
            if p.failure.is_none() {
                p.failure = Some(reason.to_string());
            }
        });
    }

    pub(crate) fn pending(&self) -> usize {
        self.0.borrow().pending
    }

    pub(crate) fn waiter(&self) -> CountdownWaiter {
        self.0.subscribe()
    }

    /// Wait until every observed volume is ready.
    ///
    /// # Errors
    /// Returns the first failure reason, or a generic one if the countdown
    /// was abandoned.
    pub(crate) async fn wait(mut waiter: CountdownWaiter) -> Result<(), String> {
        let progress = waiter
            .wait_for(|p| p.pending == 0 || p.failure.is_some())
            .await
            .map_err(|_| "container removed before its volumes were ready".to_string())?;
        match &progress.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// All resource state of one VM, guarded by the VM lock.
#[derive(Debug, Default)]
pub(crate) struct Resources {
    /// Shared volumes by name
    pub volumes: HashMap<String, DiskContext>,
    /// Containers by id; each owns its root volume
    pub containers: HashMap<String, ContainerContext>,
    /// Disks whose detach is in flight, by name
    pub detaching: HashMap<String, Detach>,
    pub networks: NetworkContext,
    pub hw: HardwareStatus,
    pub paused: bool,
    pub sandbox: Option<SandboxConfig>,
    pub sandbox_running: bool,
    /// Set once the VM is gone; no resource may be added after that
    pub retired: bool,
}

impl Resources {
    /// Whether a disk name is used by a shared volume, a root volume or a
    /// disk being detached.
    pub fn disk_name_taken(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
            || self.detaching.contains_key(name)
            || self.containers.values().any(|c| c.root.name() == name)
    }

    /// Find a live disk, shared or root, by name.
    pub fn find_disk_mut(&mut self, name: &str) -> Option<&mut DiskContext> {
        if self.volumes.contains_key(name) {
            return self.volumes.get_mut(name);
        }
        self.containers
            .values_mut()
            .map(|c| &mut c.root)
            .find(|root| root.name() == name)
    }

    pub fn alloc_pci_addr(&mut self) -> u32 {
        let addr = self.hw.pci_addr;
        self.hw.pci_addr += 1;
        addr
    }

    pub fn alloc_scsi_id(&mut self) -> u32 {
        let id = self.hw.scsi_id;
        self.hw.scsi_id += 1;
        id
    }

    pub fn next_attach_id(&mut self) -> u64 {
        let id = self.hw.attach_id;
        self.hw.attach_id += 1;
        id
    }

    /// Allocate a SCSI id and build the block descriptor for a volume.
    pub fn allocate_block(&mut self, disk: &DiskContext) -> BlockDescriptor {
        let scsi_id = self.alloc_scsi_id();
        BlockDescriptor {
            name: disk.name().to_string(),
            filename: disk.desc.source.clone(),
            format: disk.desc.format.clone(),
            fstype: disk.desc.fstype.clone(),
            device_name: scsi_device_name(scsi_id),
            scsi_id,
            scsi_addr: scsi_addr(scsi_id),
            read_only: disk.desc.read_only,
        }
    }

    /// Drop all resources, failing every pending waiter and result target
    /// with `reason`.
    ///
    /// PCI and SCSI counters restart; the attach id keeps counting since
    /// stdio sequences may still be live in the guest.
    pub fn reset(&mut self, reason: &str) -> Vec<(ResultSender, VmResult)> {
        let attach_id = self.hw.attach_id;
        let guest_cid = self.hw.guest_cid;
        let old = std::mem::take(self);
        self.hw.attach_id = attach_id;
        self.hw.guest_cid = guest_cid;

        let mut orphans = Vec::new();
        for (name, mut disk) in old.volumes {
            disk.mark_failed(reason);
            if let Some(target) = disk.result.take() {
                orphans.push((target, VmResult::failed(name, reason)));
            }
        }
        for (_, detach) in old.detaching {
            if let Some((target, id)) = detach.target {
                orphans.push((target, VmResult::failed(id, reason)));
            }
        }
        for (id, target) in old.networks.pending {
            orphans.push((target, VmResult::failed(id, reason)));
        }
        // containers and their countdowns are dropped here, which ends
        // their readiness waiters
        drop(old.containers);
        orphans
    }
}
