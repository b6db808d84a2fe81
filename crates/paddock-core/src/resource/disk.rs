//! Volumes: directory shares and hot-plugged block devices.

use super::Countdown;
use crate::agent::GuestVolume;
use crate::context::VmContext;
use crate::error::{CoreError, Result};
use crate::types::{report, ResultSender, VmResult, VolumeDescription};
use paddock_vm::{BlockDescriptor, VmEvent};
use std::collections::HashMap;

/// Attach progress of a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// One volume known to the VM.
#[derive(Debug)]
pub(crate) struct DiskContext {
    pub desc: VolumeDescription,
    /// Block device assignment; `None` for directory volumes
    pub block: Option<BlockDescriptor>,
    pub readiness: Readiness,
    pub is_root: bool,
    /// Observing containers. `Some` while the container still waits for
    /// this disk.
    observers: HashMap<String, Option<Countdown>>,
    /// Result target of a standalone add still in flight
    pub result: Option<ResultSender>,
}

impl DiskContext {
    pub fn new(desc: VolumeDescription, is_root: bool) -> Self {
        let readiness = if desc.is_dir() {
            Readiness::Ready
        } else {
            Readiness::Pending
        };
        Self {
            desc,
            block: None,
            readiness,
            is_root,
            observers: HashMap::new(),
            result: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    pub fn is_observed(&self) -> bool {
        !self.observers.is_empty()
    }

    /// Ids of observing containers, sorted.
    pub fn observer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.observers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register a container. A disk that is not ready yet holds one count
    /// on the container's countdown until it is.
    pub fn observe(&mut self, container: &str, countdown: &Countdown) {
        let slot = match &self.readiness {
            Readiness::Ready => None,
            Readiness::Pending => {
                countdown.add();
                Some(countdown.clone())
            }
            Readiness::Failed(reason) => {
                countdown.fail(reason);
                None
            }
        };
        self.observers.insert(container.to_string(), slot);
    }

    pub fn unobserve(&mut self, container: &str) {
        self.observers.remove(container);
    }

    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }

    pub fn mark_ready(&mut self, device_name: &str, scsi_id: u32, scsi_addr: &str) {
        if let Some(block) = self.block.as_mut() {
            block.device_name = device_name.to_string();
            block.scsi_id = scsi_id;
            block.scsi_addr = scsi_addr.to_string();
        }
        self.readiness = Readiness::Ready;
        for slot in self.observers.values_mut() {
            if let Some(countdown) = slot.take() {
                countdown.done();
            }
        }
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.readiness = Readiness::Failed(reason.to_string());
        for slot in self.observers.values_mut() {
            if let Some(countdown) = slot.take() {
                countdown.fail(reason);
            }
        }
    }

    /// The volume as the guest mounts it.
    pub fn guest_volume(&self, mount: &str, read_only: bool) -> GuestVolume {
        match &self.block {
            Some(block) => GuestVolume {
                device: block.device_name.clone(),
                addr: block.scsi_addr.clone(),
                mount: mount.to_string(),
                fstype: self.desc.fstype.clone(),
                read_only: read_only || self.desc.read_only,
            },
            None => GuestVolume {
                device: self.desc.source.clone(),
                addr: String::new(),
                mount: mount.to_string(),
                fstype: "dir".to_string(),
                read_only: read_only || self.desc.read_only,
            },
        }
    }

    /// Callback event for a completed attach.
    pub fn inserted_event(block: &BlockDescriptor) -> VmEvent {
        VmEvent::BlockInserted {
            name: block.name.clone(),
            device_name: block.device_name.clone(),
            scsi_id: block.scsi_id,
            scsi_addr: block.scsi_addr.clone(),
        }
    }

    /// Callback event for a completed detach.
    pub fn removed_event(name: &str) -> VmEvent {
        VmEvent::BlockRemoved {
            name: name.to_string(),
            success: true,
        }
    }
}

/// A disk whose detach is in flight.
#[derive(Debug)]
pub(crate) struct Detach {
    pub disk: DiskContext,
    /// Where to report, and under which id
    pub target: Option<(ResultSender, String)>,
}

impl VmContext {
    /// Add a shared volume.
    ///
    /// Directory volumes are ready at once and `result` receives success
    /// before this returns. Block volumes are attached through the driver
    /// and reported once the driver confirms.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] if the name is empty or already used, or the
    ///   volume is a block device and the driver cannot hot-plug
    /// - [`CoreError::NotReady`] if the VM is not running
    pub fn add_volume(&self, desc: VolumeDescription, result: ResultSender) -> Result<()> {
        self.try_add_volume(desc, result)
            .map_err(|e| self.rejected("add_volume", e))
    }

    fn try_add_volume(&self, desc: VolumeDescription, result: ResultSender) -> Result<()> {
        if desc.name.is_empty() {
            return Err(CoreError::spec("volume name is required"));
        }

        let mut res = self.lock_running()?;
        if res.disk_name_taken(&desc.name) {
            return Err(CoreError::spec(format!("volume {} already exists", desc.name)));
        }

        let name = desc.name.clone();
        let mut disk = DiskContext::new(desc, false);
        if disk.is_ready() {
            res.volumes.insert(name.clone(), disk);
            drop(res);
            tracing::debug!(vm_id = %self.id, volume = %name, "directory volume added");
            report(&result, VmResult::ok(name));
            return Ok(());
        }
        self.require_hotplug(&format!("block volume {name}"))?;

        let block = res.allocate_block(&disk);
        disk.block = Some(block.clone());
        disk.result = Some(result);
        res.volumes.insert(name, disk);
        tracing::debug!(
            vm_id = %self.id,
            volume = %block.name,
            scsi_id = block.scsi_id,
            "attaching block volume"
        );
        self.driver
            .add_disk(&block, DiskContext::inserted_event(&block), &self.events);
        Ok(())
    }

    /// Remove a shared volume.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] if the volume does not exist
    /// - [`CoreError::Busy`] if a container still uses it or its attach is
    ///   still in flight
    /// - [`CoreError::NotReady`] if the VM is not running
    pub fn remove_volume(&self, name: &str, result: ResultSender) -> Result<()> {
        self.try_remove_volume(name, result)
            .map_err(|e| self.rejected("remove_volume", e))
    }

    fn try_remove_volume(&self, name: &str, result: ResultSender) -> Result<()> {
        let mut res = self.lock_running()?;
        let disk = res
            .volumes
            .get(name)
            .ok_or_else(|| CoreError::spec(format!("volume {name} not found")))?;
        if disk.is_observed() {
            return Err(CoreError::busy(format!(
                "volume {name} is used by {}",
                disk.observer_ids().join(",")
            )));
        }
        if !disk.is_ready() {
            return Err(CoreError::busy(format!("volume {name} is not ready")));
        }

        let Some(disk) = res.volumes.remove(name) else {
            return Err(CoreError::spec(format!("volume {name} not found")));
        };
        let Some(block) = disk.block.clone() else {
            drop(res);
            tracing::debug!(vm_id = %self.id, volume = %name, "directory volume removed");
            report(&result, VmResult::ok(name));
            return Ok(());
        };

        res.detaching.insert(
            name.to_string(),
            Detach {
                disk,
                target: Some((result, name.to_string())),
            },
        );
        tracing::debug!(vm_id = %self.id, volume = %name, "detaching block volume");
        self.driver
            .remove_disk(&block, DiskContext::removed_event(name), &self.events);
        Ok(())
    }

    pub(crate) fn on_block_inserted(
        &self,
        name: &str,
        device_name: &str,
        scsi_id: u32,
        scsi_addr: &str,
    ) {
        let mut res = self.lock();
        if let Some(disk) = res.find_disk_mut(name) {
            disk.mark_ready(device_name, scsi_id, scsi_addr);
            let target = disk.result.take();
            drop(res);
            tracing::debug!(vm_id = %self.id, volume = %name, device = %device_name, "block volume ready");
            if let Some(target) = target {
                report(&target, VmResult::ok(name));
            }
        } else if let Some(detach) = res.detaching.get_mut(name) {
            // removed while attaching; detach it now
            detach.disk.mark_ready(device_name, scsi_id, scsi_addr);
            if let Some(block) = detach.disk.block.clone() {
                tracing::debug!(vm_id = %self.id, volume = %name, "attach finished for a removed disk, detaching");
                self.driver
                    .remove_disk(&block, DiskContext::removed_event(name), &self.events);
            }
        } else {
            tracing::warn!(vm_id = %self.id, volume = %name, "attach finished for unknown disk");
        }
    }

    pub(crate) fn on_block_attach_failed(&self, name: &str, reason: &str) {
        let mut res = self.lock();
        if let Some(detach) = res.detaching.remove(name) {
            drop(res);
            // removed while attaching; nothing left to detach
            tracing::debug!(vm_id = %self.id, volume = %name, %reason, "attach failed for a removed disk");
            if let Some((target, id)) = detach.target {
                report(&target, VmResult::ok(id));
            }
        } else if let Some(mut disk) = res.volumes.remove(name) {
            disk.mark_failed(reason);
            drop(res);
            tracing::error!(vm_id = %self.id, volume = %name, %reason, "block volume attach failed");
            if let Some(target) = disk.result.take() {
                report(&target, VmResult::failed(name, reason));
            }
        } else if let Some(root) = res.find_disk_mut(name) {
            // the owning container's waiter rolls it back
            root.mark_failed(reason);
            tracing::error!(vm_id = %self.id, volume = %name, %reason, "root volume attach failed");
        } else {
            tracing::warn!(vm_id = %self.id, volume = %name, %reason, "attach failed for unknown disk");
        }
    }

    pub(crate) fn on_block_removed(&self, name: &str, success: bool, reason: Option<&str>) {
        let mut res = self.lock();
        let Some(mut detach) = res.detaching.remove(name) else {
            tracing::warn!(vm_id = %self.id, volume = %name, "detach finished for unknown disk");
            return;
        };

        let outcome = if success {
            tracing::debug!(vm_id = %self.id, volume = %name, "block volume detached");
            None
        } else {
            let reason = reason.unwrap_or("detach failed").to_string();
            tracing::error!(vm_id = %self.id, volume = %name, %reason, "block volume detach failed");
            // a shared volume stays usable after a failed detach
            if !detach.disk.is_root {
                detach.disk.result = None;
                res.volumes.insert(name.to_string(), detach.disk);
            }
            Some(reason)
        };
        drop(res);

        if let Some((target, id)) = detach.target {
            match outcome {
                None => report(&target, VmResult::ok(id)),
                Some(reason) => report(&target, VmResult::failed(id, reason)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_volume(name: &str) -> VolumeDescription {
        VolumeDescription {
            name: name.into(),
            source: format!("/dev/{name}"),
            format: "raw".into(),
            fstype: "ext4".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_directory_volume_is_ready() {
        let disk = DiskContext::new(
            VolumeDescription {
                name: "v1".into(),
                format: "vfs".into(),
                ..Default::default()
            },
            false,
        );
        assert!(disk.is_ready());
        assert_eq!(disk.guest_volume("/data", false).fstype, "dir");
    }

    #[test]
    fn test_observe_pending_holds_count() {
        let mut disk = DiskContext::new(block_volume("v1"), false);
        let countdown = Countdown::new();
        disk.observe("c1", &countdown);
        assert_eq!(countdown.pending(), 1);
        assert!(disk.is_observed());

        disk.mark_ready("sda", 0, "0:0");
        assert_eq!(countdown.pending(), 0);
        // still observed after it became ready
        assert_eq!(disk.observer_ids(), vec!["c1".to_string()]);

        disk.unobserve("c1");
        assert!(!disk.is_observed());
    }

    #[test]
    fn test_observe_ready_does_not_count() {
        let mut disk = DiskContext::new(block_volume("v1"), false);
        disk.mark_ready("sda", 0, "0:0");
        let countdown = Countdown::new();
        disk.observe("c1", &countdown);
        assert_eq!(countdown.pending(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_observers() {
        let mut disk = DiskContext::new(block_volume("v1"), false);
        let countdown = Countdown::new();
        disk.observe("c1", &countdown);
        disk.mark_failed("no free slot");
        assert_eq!(
            Countdown::wait(countdown.waiter()).await,
            Err("no free slot".to_string())
        );
    }
}
