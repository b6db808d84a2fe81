//! Persisted VM state and reassociation.
//!
//! A running VM can be dumped to JSON, the daemon restarted, and the VM
//! picked up again from that snapshot. Snapshots carry a version tag; only
//! versions in `COMPATIBLE_PERSIST_VERSION..=CURRENT_PERSIST_VERSION` are
//! accepted.

use crate::agent::SandboxAgent;
use crate::config::ContextConfig;
use crate::context::{ResponseReceiver, VmContext};
use crate::error::{CoreError, Result};
use crate::resource::{
    ContainerContext, ContainerState, DiskContext, HardwareStatus, InterfaceRecord, Readiness,
    Resources, FIRST_ATTACH_ID, FIRST_PCI_ADDR,
};
use crate::types::{ContainerDescription, PortDescription, SandboxConfig, VolumeDescription};
use chrono::{DateTime, Utc};
use paddock_vm::{scsi_addr, BlockDescriptor, HypervisorDriver};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot format written by this version.
pub const CURRENT_PERSIST_VERSION: u32 = 20170224;

/// Oldest snapshot format still accepted. Snapshots older than
/// [`CURRENT_PERSIST_VERSION`] identify root volumes by a `/` mount point
/// instead of a flag.
pub const COMPATIBLE_PERSIST_VERSION: u32 = 20161208;

/// Serialized state of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistInfo {
    pub persist_version: u32,
    pub id: String,
    /// Backend-specific state from [`paddock_vm::DriverContext::dump`]
    pub driver_info: Value,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub sandbox_running: bool,
    pub hw_stat: HardwareStatus,
    #[serde(default)]
    pub volume_list: Vec<PersistVolumeInfo>,
    #[serde(default)]
    pub network_list: Vec<InterfaceRecord>,
    #[serde(default)]
    pub port_list: Vec<PortDescription>,
    #[serde(default)]
    pub container_list: Vec<ContainerDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dumped_at: Option<DateTime<Utc>>,
}

/// One volume in a snapshot, shared or root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistVolumeInfo {
    pub name: String,
    pub source: String,
    pub format: String,
    pub fstype: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub docker_volume: bool,
    /// Guest device, empty for directories
    #[serde(default)]
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scsi_id: Option<u32>,
    #[serde(default)]
    pub scsi_addr: String,
    /// Observing containers; the owner for a root volume
    #[serde(default)]
    pub containers: Vec<String>,
    /// Legacy: mount point per entry of `containers`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_points: Vec<String>,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl PersistVolumeInfo {
    fn from_disk(disk: &DiskContext, containers: Vec<String>) -> Self {
        let block = disk.block.as_ref();
        Self {
            name: disk.name().to_string(),
            source: disk.desc.source.clone(),
            format: disk.desc.format.clone(),
            fstype: disk.desc.fstype.clone(),
            read_only: disk.desc.read_only,
            docker_volume: disk.desc.docker_volume,
            device_name: block.map(|b| b.device_name.clone()).unwrap_or_default(),
            scsi_id: block.map(|b| b.scsi_id),
            scsi_addr: block.map(|b| b.scsi_addr.clone()).unwrap_or_default(),
            containers,
            mount_points: Vec::new(),
            is_root: disk.is_root,
            ready: disk.is_ready(),
        }
    }

    fn into_disk(self, is_root: bool) -> DiskContext {
        let desc = VolumeDescription {
            name: self.name,
            source: self.source,
            format: self.format,
            fstype: self.fstype,
            read_only: self.read_only,
            docker_volume: self.docker_volume,
            options: None,
        };
        let mut disk = DiskContext::new(desc, is_root);
        if let Some(scsi_id) = self.scsi_id {
            disk.block = Some(BlockDescriptor {
                name: disk.desc.name.clone(),
                filename: disk.desc.source.clone(),
                format: disk.desc.format.clone(),
                fstype: disk.desc.fstype.clone(),
                device_name: self.device_name,
                scsi_id,
                scsi_addr: if self.scsi_addr.is_empty() {
                    scsi_addr(scsi_id)
                } else {
                    self.scsi_addr
                },
                read_only: disk.desc.read_only,
            });
        }
        disk.readiness = if self.ready || disk.block.is_none() {
            Readiness::Ready
        } else {
            Readiness::Pending
        };
        disk
    }

    /// Owning container if this is a root volume.
    fn root_owner(&self, legacy: bool) -> Result<Option<String>> {
        if !legacy {
            if !self.is_root {
                return Ok(None);
            }
            return match self.containers.first() {
                Some(owner) => Ok(Some(owner.clone())),
                None => Err(CoreError::Corrupt(format!(
                    "root volume {} has no owner",
                    self.name
                ))),
            };
        }

        if self.containers.len() != self.mount_points.len() {
            return Err(CoreError::Corrupt(format!(
                "volume {} lists {} containers but {} mount points",
                self.name,
                self.containers.len(),
                self.mount_points.len()
            )));
        }
        Ok(self
            .mount_points
            .iter()
            .position(|m| m == "/")
            .map(|i| self.containers[i].clone()))
    }
}

/// Check a snapshot version against the supported range.
///
/// # Errors
/// [`CoreError::Version`] if the version is outside the range.
pub fn check_version(version: u32) -> Result<()> {
    if (COMPATIBLE_PERSIST_VERSION..=CURRENT_PERSIST_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(CoreError::Version {
            found: version,
            compatible: COMPATIBLE_PERSIST_VERSION,
            current: CURRENT_PERSIST_VERSION,
        })
    }
}

/// Rebuild resource state from a snapshot.
pub(crate) fn restore(info: &PersistInfo) -> Result<Resources> {
    let legacy = info.persist_version < CURRENT_PERSIST_VERSION;
    let mut res = Resources {
        hw: info.hw_stat,
        paused: info.paused,
        sandbox: info.sandbox.clone(),
        sandbox_running: info.sandbox_running,
        ..Default::default()
    };

    let mut roots: HashMap<String, DiskContext> = HashMap::new();
    for vol in &info.volume_list {
        match vol.root_owner(legacy)? {
            Some(owner) => {
                let disk = vol.clone().into_disk(true);
                if roots.insert(owner.clone(), disk).is_some() {
                    return Err(CoreError::Corrupt(format!(
                        "container {owner} has more than one root volume"
                    )));
                }
            }
            None => {
                let disk = vol.clone().into_disk(false);
                if res.volumes.insert(vol.name.clone(), disk).is_some() {
                    return Err(CoreError::Corrupt(format!("duplicate volume {}", vol.name)));
                }
            }
        }
    }

    for desc in &info.container_list {
        let root = roots.remove(&desc.id).ok_or_else(|| {
            CoreError::Corrupt(format!("container {} has no root volume", desc.id))
        })?;
        let mut container = ContainerContext::new(desc.clone(), root);
        let countdown = container.countdown.clone();
        for name in desc.volumes.keys() {
            match res.volumes.get_mut(name) {
                Some(disk) => disk.observe(&desc.id, &countdown),
                None => {
                    tracing::warn!(vm_id = %info.id, container_id = %desc.id, volume = %name, "container references unknown volume");
                }
            }
        }
        container.root.observe(&desc.id, &countdown);
        if countdown.pending() == 0 {
            container.state.send_replace(ContainerState::Ready);
        }
        if res.containers.insert(desc.id.clone(), container).is_some() {
            return Err(CoreError::Corrupt(format!("duplicate container {}", desc.id)));
        }
    }
    if let Some((owner, disk)) = roots.into_iter().next() {
        return Err(CoreError::Corrupt(format!(
            "root volume {} belongs to unknown container {owner}",
            disk.name()
        )));
    }

    for iface in &info.network_list {
        let mut iface = iface.clone();
        if iface.id.is_empty() {
            iface.id = uuid::Uuid::new_v4().to_string();
        }
        if res.networks.interfaces.contains_key(&iface.id) {
            return Err(CoreError::Corrupt(format!("duplicate interface {}", iface.id)));
        }
        res.networks.interfaces.insert(iface.id.clone(), iface);
    }
    res.networks.ports = info.port_list.clone();

    check_counters(&res)?;
    Ok(res)
}

/// Counters must stay ahead of every id already handed out.
fn check_counters(res: &Resources) -> Result<()> {
    let scsi_ids = res
        .volumes
        .values()
        .chain(res.containers.values().map(|c| &c.root))
        .filter_map(|d| d.block.as_ref().map(|b| b.scsi_id));
    if let Some(max) = scsi_ids.max() {
        if res.hw.scsi_id <= max {
            return Err(CoreError::Corrupt(format!(
                "scsi counter {} not above allocated id {max}",
                res.hw.scsi_id
            )));
        }
    }

    let pci_addrs = res
        .networks
        .interfaces
        .values()
        .filter(|i| !i.lo)
        .map(|i| i.pci_addr);
    if let Some(max) = pci_addrs.max() {
        if res.hw.pci_addr <= max {
            return Err(CoreError::Corrupt(format!(
                "pci counter {} not above allocated address {max}",
                res.hw.pci_addr
            )));
        }
    }
    if res.hw.pci_addr < FIRST_PCI_ADDR || res.hw.attach_id < FIRST_ATTACH_ID {
        return Err(CoreError::Corrupt("hardware counters below their start".into()));
    }
    Ok(())
}

impl VmContext {
    /// Snapshot this VM.
    ///
    /// Disks being detached and interfaces not yet plugged are left out.
    ///
    /// # Errors
    /// Returns an error if the driver cannot dump its state.
    pub fn dump(&self) -> Result<PersistInfo> {
        let driver_info = self.driver.dump()?;
        let res = self.lock();

        let mut volume_list: Vec<PersistVolumeInfo> = res
            .volumes
            .values()
            .map(|d| PersistVolumeInfo::from_disk(d, d.observer_ids()))
            .chain(
                res.containers
                    .values()
                    .map(|c| PersistVolumeInfo::from_disk(&c.root, vec![c.id().to_string()])),
            )
            .collect();
        volume_list.sort_by(|a, b| a.name.cmp(&b.name));

        let mut container_list: Vec<ContainerDescription> =
            res.containers.values().map(|c| c.desc.clone()).collect();
        container_list.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(PersistInfo {
            persist_version: CURRENT_PERSIST_VERSION,
            id: self.id.clone(),
            driver_info,
            paused: res.paused,
            sandbox: res.sandbox.clone(),
            sandbox_running: res.sandbox_running,
            hw_stat: res.hw,
            volume_list,
            network_list: res
                .networks
                .interfaces
                .values()
                .filter(|i| i.inserted)
                .cloned()
                .collect(),
            port_list: res.networks.ports.clone(),
            container_list,
            dumped_at: Some(Utc::now()),
        })
    }

    /// Re-arm everything that was in flight when the snapshot was taken:
    /// readiness waiters of provisioning containers and attaches of block
    /// disks that had not completed.
    fn resume_pending(self: &Arc<Self>) {
        let mut attaches = Vec::new();
        let mut waiters = Vec::new();
        {
            let res = self.lock();
            for disk in res
                .volumes
                .values()
                .chain(res.containers.values().map(|c| &c.root))
            {
                if let (Some(block), Readiness::Pending) = (&disk.block, &disk.readiness) {
                    attaches.push(block.clone());
                }
            }
            for container in res.containers.values() {
                if container.current_state() == ContainerState::Provisioning {
                    waiters.push((
                        container.id().to_string(),
                        container.incarnation,
                        container.countdown.waiter(),
                    ));
                }
            }
            for block in &attaches {
                tracing::info!(vm_id = %self.id, volume = %block.name, "re-attaching block volume");
                self.driver
                    .add_disk(block, DiskContext::inserted_event(block), &self.events);
            }
        }

        for (id, incarnation, waiter) in waiters {
            let ctx = Arc::clone(self);
            tokio::spawn(async move {
                ctx.finish_container_add(id, incarnation, waiter, None).await;
            });
        }
    }
}

/// Pick up a running VM from its snapshot.
///
/// Nothing is touched unless the snapshot is accepted: the version and id
/// are checked and the resources rebuilt before the driver sees it.
pub(crate) fn associate(
    id: &str,
    driver: &dyn HypervisorDriver,
    agent: Arc<dyn SandboxAgent>,
    config: ContextConfig,
    data: &[u8],
) -> Result<(Arc<VmContext>, ResponseReceiver)> {
    #[derive(Deserialize)]
    struct Header {
        persist_version: u32,
        id: String,
    }

    let header: Header = serde_json::from_slice(data)?;
    check_version(header.persist_version)?;
    if header.id != id {
        return Err(CoreError::IdMismatch {
            expected: id.to_string(),
            found: header.id,
        });
    }

    let info: PersistInfo = serde_json::from_slice(data)?;
    let resources = restore(&info)?;
    let driver_ctx = driver.load_context(id, &info.driver_info)?;

    let (ctx, responses) = VmContext::start(
        id.to_string(),
        config,
        Arc::from(driver_ctx),
        agent,
        driver.supports_hotplug(),
        resources,
    );
    ctx.driver.associate(&ctx.events);
    ctx.resume_pending();

    tracing::info!(
        vm_id = %id,
        persist_version = info.persist_version,
        containers = info.container_list.len(),
        volumes = info.volume_list.len(),
        "vm associated"
    );
    Ok((ctx, responses))
}
