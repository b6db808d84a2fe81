//! Containers and their readiness.

use super::{Countdown, CountdownWaiter, Detach, DiskContext, Readiness, Resources};
use crate::agent::{GuestContainer, Process};
use crate::context::VmContext;
use crate::error::{CoreError, Result};
use crate::types::{report, ContainerDescription, ResultSender, VmResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Provisioning progress of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Waiting for its volumes to attach
    Provisioning,
    /// Every volume is attached; the container can start
    Ready,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Ready => f.write_str("ready"),
        }
    }
}

/// One container known to the VM.
#[derive(Debug)]
pub(crate) struct ContainerContext {
    pub desc: ContainerDescription,
    /// Root volume, owned by this container alone
    pub root: DiskContext,
    pub countdown: Countdown,
    /// Distinguishes this container from a later one reusing its id
    pub incarnation: Uuid,
    /// Dropped with the container, which wakes every waiter with an error
    pub state: watch::Sender<ContainerState>,
}

impl ContainerContext {
    pub fn new(desc: ContainerDescription, root: DiskContext) -> Self {
        Self {
            desc,
            root,
            countdown: Countdown::new(),
            incarnation: Uuid::new_v4(),
            state: watch::Sender::new(ContainerState::Provisioning),
        }
    }

    pub fn id(&self) -> &str {
        &self.desc.id
    }

    pub fn current_state(&self) -> ContainerState {
        *self.state.borrow()
    }

    /// Container definition for the guest agent.
    pub fn guest_container(
        &self,
        volumes: &HashMap<String, DiskContext>,
        process: Process,
    ) -> GuestContainer {
        let root = self.root.guest_volume("/", false);
        let volumes = self
            .desc
            .volumes
            .values()
            .filter_map(|r| {
                volumes
                    .get(&r.name)
                    .map(|disk| disk.guest_volume(&r.path, r.read_only))
            })
            .collect();
        GuestContainer {
            id: self.desc.id.clone(),
            image: root.device,
            addr: root.addr,
            fstype: root.fstype,
            rootfs: self.desc.root_path.clone(),
            volumes,
            sysctl: self.desc.sysctl.clone(),
            process,
            initialize: self.desc.initialize,
        }
    }

    /// The first process of the container.
    pub fn init_process(&self, stdio: u64, stderr: u64) -> Process {
        let mut args = Vec::with_capacity(self.desc.args.len() + 1);
        args.push(self.desc.path.clone());
        args.extend(self.desc.args.iter().cloned());
        Process {
            id: "init".to_string(),
            terminal: self.desc.tty,
            stdio,
            stderr,
            args,
            envs: self.desc.envs.clone(),
            workdir: self.desc.workdir.clone(),
            user: self
                .desc
                .user
                .as_ref()
                .map(|u| u.user.clone())
                .unwrap_or_default(),
        }
    }
}

/// Root volume name of a container.
pub(crate) fn root_volume_name(desc: &ContainerDescription) -> String {
    if desc.root_volume.name.is_empty() {
        format!("{}-root", desc.id)
    } else {
        desc.root_volume.name.clone()
    }
}

impl VmContext {
    /// Add a container and attach its root volume.
    ///
    /// The container observes every shared volume it references; `result`
    /// receives success once all of them and the root are ready. Admission
    /// is all-or-nothing: if any referenced volume is missing, nothing
    /// changes.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] on a duplicate id, a taken root volume name or a
    ///   missing shared volume, or a block root the driver cannot hot-plug
    /// - [`CoreError::NotReady`] if the VM is not running
    pub fn add_container(
        self: &Arc<Self>,
        desc: ContainerDescription,
        result: ResultSender,
    ) -> Result<()> {
        self.try_add_container(desc, result)
            .map_err(|e| self.rejected("add_container", e))
    }

    fn try_add_container(
        self: &Arc<Self>,
        desc: ContainerDescription,
        result: ResultSender,
    ) -> Result<()> {
        if desc.id.is_empty() {
            return Err(CoreError::spec("container id is required"));
        }

        let mut res = self.lock_running()?;
        if res.containers.contains_key(&desc.id) {
            return Err(CoreError::spec(format!("container {} already exists", desc.id)));
        }
        let root_name = root_volume_name(&desc);
        if res.disk_name_taken(&root_name) {
            return Err(CoreError::spec(format!(
                "root volume {root_name} of container {} is already in use",
                desc.id
            )));
        }
        if let Some(missing) = desc.volumes.keys().find(|n| !res.volumes.contains_key(*n)) {
            return Err(CoreError::spec(format!(
                "volume {missing} for container {} does not exist",
                desc.id
            )));
        }

        let id = desc.id.clone();
        let mut root_desc = desc.root_volume.clone();
        root_desc.name = root_name;
        let mut root = DiskContext::new(root_desc, true);
        let attach = if root.is_ready() {
            None
        } else {
            self.require_hotplug(&format!("root volume {}", root.name()))?;
            let block = res.allocate_block(&root);
            root.block = Some(block.clone());
            Some(block)
        };

        let container = ContainerContext::new(desc, root);
        let countdown = container.countdown.clone();
        for name in container.desc.volumes.keys() {
            if let Some(disk) = res.volumes.get_mut(name) {
                disk.observe(&id, &countdown);
            }
        }
        let incarnation = container.incarnation;
        let waiter = countdown.waiter();
        res.containers.insert(id.clone(), container);
        if let Some(container) = res.containers.get_mut(&id) {
            container.root.observe(&id, &countdown);
        }

        tracing::info!(
            vm_id = %self.id,
            container_id = %id,
            pending_volumes = countdown.pending(),
            "container added"
        );
        if let Some(block) = attach {
            self.driver
                .add_disk(&block, DiskContext::inserted_event(&block), &self.events);
        }
        drop(res);

        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            ctx.finish_container_add(id, incarnation, waiter, Some(result))
                .await;
        });
        Ok(())
    }

    /// Wait for a container's volumes, then mark it ready or roll it back.
    pub(crate) async fn finish_container_add(
        self: Arc<Self>,
        id: String,
        incarnation: Uuid,
        waiter: CountdownWaiter,
        result: Option<ResultSender>,
    ) {
        let outcome = Countdown::wait(waiter).await;

        let mut res = self.lock();
        let current = res
            .containers
            .get(&id)
            .is_some_and(|c| c.incarnation == incarnation);

        let reply = match outcome {
            Ok(()) if current => {
                if let Some(container) = res.containers.get(&id) {
                    container.state.send_replace(ContainerState::Ready);
                }
                tracing::info!(vm_id = %self.id, container_id = %id, "container ready");
                VmResult::ok(&id)
            }
            Ok(()) => VmResult::failed(&id, format!("container {id} was removed")),
            Err(reason) => {
                if current {
                    self.rollback_container(&mut res, &id);
                }
                tracing::error!(vm_id = %self.id, container_id = %id, %reason, "container failed");
                VmResult::failed(&id, reason)
            }
        };
        drop(res);

        if let Some(target) = result {
            report(&target, reply);
        }
    }

    /// Undo a container whose volumes failed.
    fn rollback_container(&self, res: &mut Resources, id: &str) {
        let Some(mut container) = res.containers.remove(id) else {
            return;
        };
        for name in container.desc.volumes.keys() {
            if let Some(disk) = res.volumes.get_mut(name) {
                disk.unobserve(id);
            }
        }
        container.root.clear_observers();
        self.detach_root(res, container.root, None);
    }

    /// Detach a container's root volume. `target` is told once the disk
    /// is gone.
    fn detach_root(
        &self,
        res: &mut Resources,
        root: DiskContext,
        target: Option<(ResultSender, String)>,
    ) {
        let name = root.name().to_string();
        let block = match (&root.block, &root.readiness) {
            (Some(block), Readiness::Ready) => Some(block.clone()),
            (Some(_), Readiness::Pending) => None,
            _ => {
                // nothing attached
                if let Some((target, id)) = target {
                    report(&target, VmResult::ok(id));
                }
                return;
            }
        };

        res.detaching.insert(name.clone(), Detach { disk: root, target });
        match block {
            Some(block) => {
                tracing::debug!(vm_id = %self.id, volume = %name, "detaching root volume");
                self.driver
                    .remove_disk(&block, DiskContext::removed_event(&name), &self.events);
            }
            None => {
                tracing::debug!(vm_id = %self.id, volume = %name, "root detach deferred until attach completes");
            }
        }
    }

    /// Remove a container and detach its root volume.
    ///
    /// Shared volumes it observed stay attached. A container still
    /// provisioning is removed too; its add reports a failure.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] if the container does not exist
    /// - [`CoreError::NotReady`] if the VM is not running
    pub fn remove_container(&self, id: &str, result: ResultSender) -> Result<()> {
        self.try_remove_container(id, result)
            .map_err(|e| self.rejected("remove_container", e))
    }

    fn try_remove_container(&self, id: &str, result: ResultSender) -> Result<()> {
        let mut res = self.lock_running()?;
        let Some(mut container) = res.containers.remove(id) else {
            return Err(CoreError::spec(format!("container {id} not found")));
        };
        for name in container.desc.volumes.keys() {
            if let Some(disk) = res.volumes.get_mut(name) {
                disk.unobserve(id);
            }
        }
        container.root.clear_observers();
        tracing::info!(vm_id = %self.id, container_id = %id, "container removed");
        self.detach_root(&mut res, container.root, Some((result, id.to_string())));
        Ok(())
    }

    /// Current provisioning state of a container.
    pub fn container_state(&self, id: &str) -> Option<ContainerState> {
        self.lock().containers.get(id).map(ContainerContext::current_state)
    }

    /// Watch a container's provisioning state. The receiver closes when the
    /// container is removed.
    pub(crate) fn watch_container(&self, id: &str) -> Option<watch::Receiver<ContainerState>> {
        self.lock().containers.get(id).map(|c| c.state.subscribe())
    }

    /// Build the guest definition of a ready container, allocating its
    /// stdio sequences.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] if the container does not exist
    /// - [`CoreError::Busy`] if it is still provisioning
    pub(crate) fn prepare_container_start(&self, id: &str) -> Result<GuestContainer> {
        let mut res = self.lock();
        let (tty, state) = match res.containers.get(id) {
            Some(c) => (c.desc.tty, c.current_state()),
            None => return Err(CoreError::spec(format!("container {id} not found"))),
        };
        if state != ContainerState::Ready {
            return Err(CoreError::busy(format!("container {id} is {state}")));
        }

        let stdio = res.next_attach_id();
        let stderr = if tty { 0 } else { res.next_attach_id() };
        let res = &*res;
        let container = res
            .containers
            .get(id)
            .ok_or_else(|| CoreError::spec(format!("container {id} not found")))?;
        Ok(container.guest_container(&res.volumes, container.init_process(stdio, stderr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VolumeDescription, VolumeReference};

    fn desc() -> ContainerDescription {
        let mut desc = ContainerDescription {
            id: "c1".into(),
            path: "/bin/sh".into(),
            args: vec!["-c".into(), "true".into()],
            root_path: "rootfs".into(),
            root_volume: VolumeDescription {
                source: "/images/c1".into(),
                format: "vfs".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        desc.volumes.insert(
            "v1".into(),
            VolumeReference {
                path: "/data".into(),
                name: "v1".into(),
                read_only: true,
            },
        );
        desc
    }

    #[test]
    fn test_root_volume_name_defaults_to_id() {
        let mut d = desc();
        assert_eq!(root_volume_name(&d), "c1-root");
        d.root_volume.name = "custom".into();
        assert_eq!(root_volume_name(&d), "custom");
    }

    #[test]
    fn test_guest_container_includes_known_volumes() {
        let d = desc();
        let root = DiskContext::new(d.root_volume.clone(), true);
        let container = ContainerContext::new(d, root);

        let mut volumes = HashMap::new();
        volumes.insert(
            "v1".to_string(),
            DiskContext::new(
                VolumeDescription {
                    name: "v1".into(),
                    source: "/srv/v1".into(),
                    format: "vfs".into(),
                    ..Default::default()
                },
                false,
            ),
        );

        let guest = container.guest_container(&volumes, container.init_process(1, 2));
        assert_eq!(guest.image, "/images/c1");
        assert_eq!(guest.fstype, "dir");
        assert_eq!(guest.volumes.len(), 1);
        assert_eq!(guest.volumes[0].mount, "/data");
        assert!(guest.volumes[0].read_only);
        assert_eq!(guest.process.args, vec!["/bin/sh", "-c", "true"]);
        assert_eq!(guest.process.stdio, 1);
        assert_eq!(guest.process.stderr, 2);
    }

    #[test]
    fn test_state_starts_provisioning() {
        let d = desc();
        let root = DiskContext::new(d.root_volume.clone(), true);
        let container = ContainerContext::new(d, root);
        assert_eq!(container.current_state(), ContainerState::Provisioning);
        assert_eq!(ContainerState::Ready.to_string(), "ready");
    }
}
