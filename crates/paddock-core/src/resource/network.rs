//! Network interfaces and port mappings.

use crate::agent::{GuestSandbox, InterfaceUpdate, Route};
use crate::context::VmContext;
use crate::error::{CoreError, Result};
use crate::types::{
    report, InterfaceDescription, PortDescription, ResultSender, SandboxConfig, VmResult,
};
use paddock_vm::{GuestNicInfo, HostNicInfo, VmEvent};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// Mount tag of the directory shared with the guest.
const SHARE_DIR_TAG: &str = "share_dir";

/// A network interface as the VM tracks it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub id: String,
    /// Guest interface index, `ethN`
    pub index: u32,
    pub pci_addr: u32,
    /// Guest device name
    pub device_name: String,
    /// Host tap device
    #[serde(default)]
    pub host_device: String,
    #[serde(default)]
    pub bridge: String,
    /// Guest address in CIDR form
    pub ip_addr: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub lo: bool,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// The device is plugged into the guest
    #[serde(default)]
    pub inserted: bool,
}

impl InterfaceRecord {
    /// Address without prefix length.
    pub fn address(&self) -> String {
        parse_cidr(&self.ip_addr)
            .map(|(addr, _)| addr.to_string())
            .unwrap_or_default()
    }

    /// Dotted netmask derived from the prefix length.
    pub fn netmask(&self) -> String {
        parse_cidr(&self.ip_addr)
            .map(|(_, prefix)| netmask(prefix).to_string())
            .unwrap_or_default()
    }

    pub(crate) fn guest_update(&self) -> InterfaceUpdate {
        InterfaceUpdate {
            device: self.device_name.clone(),
            ip_address: self.address(),
            netmask: self.netmask(),
            mac: self.mac.clone(),
            mtu: self.mtu,
        }
    }
}

/// Interfaces and port mappings of one VM.
#[derive(Debug, Default)]
pub(crate) struct NetworkContext {
    pub interfaces: BTreeMap<String, InterfaceRecord>,
    pub ports: Vec<PortDescription>,
    /// Result targets of plug and unplug operations in flight
    pub pending: HashMap<String, ResultSender>,
}

impl NetworkContext {
    /// Lowest interface index not used by a non-loopback interface.
    pub fn free_index(&self) -> u32 {
        let mut used: Vec<u32> = self
            .interfaces
            .values()
            .filter(|i| !i.lo)
            .map(|i| i.index)
            .collect();
        used.sort_unstable();
        let mut index = 0;
        for n in used {
            if n == index {
                index += 1;
            } else if n > index {
                break;
            }
        }
        index
    }

    /// Routes of every plugged interface.
    pub fn routes(&self) -> Vec<Route> {
        self.interfaces
            .values()
            .filter(|i| i.inserted)
            .flat_map(|i| i.routes.iter().cloned())
            .collect()
    }
}

/// Parse `a.b.c.d/len` or a bare address, which means `/32`.
pub(crate) fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| CoreError::spec(format!("invalid prefix length in {cidr}")))?;
            (addr, prefix)
        }
        None => (cidr, 32),
    };
    if prefix > 32 {
        return Err(CoreError::spec(format!("invalid prefix length in {cidr}")));
    }
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| CoreError::spec(format!("invalid address {cidr}")))?;
    Ok((addr, prefix))
}

fn netmask(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ipv4Addr::from(bits)
}

fn valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

impl VmContext {
    /// Plug a network interface into the guest.
    ///
    /// Loopback interfaces are recorded and reported at once. Others are
    /// hot-plugged and reported when the driver confirms; if the sandbox is
    /// already running, the guest is configured first.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] on a duplicate id or a malformed address, or
    ///   for a NIC the driver cannot hot-plug
    /// - [`CoreError::NotReady`] if the VM is not running
    pub fn add_interface(&self, desc: InterfaceDescription, result: ResultSender) -> Result<()> {
        self.try_add_interface(desc, result)
            .map_err(|e| self.rejected("add_interface", e))
    }

    fn try_add_interface(&self, desc: InterfaceDescription, result: ResultSender) -> Result<()> {
        if desc.id.is_empty() {
            return Err(CoreError::spec("interface id is required"));
        }
        if !(desc.lo && desc.ip.is_empty()) {
            parse_cidr(&desc.ip)?;
        }
        if !desc.gateway.is_empty() {
            parse_cidr(&desc.gateway)?;
        }
        if !desc.mac.is_empty() && !valid_mac(&desc.mac) {
            return Err(CoreError::spec(format!("invalid mac address {}", desc.mac)));
        }

        let mut res = self.lock_running()?;
        if res.networks.interfaces.contains_key(&desc.id) {
            return Err(CoreError::spec(format!("interface {} already exists", desc.id)));
        }

        if desc.lo {
            res.networks.interfaces.insert(
                desc.id.clone(),
                InterfaceRecord {
                    id: desc.id.clone(),
                    device_name: "lo".to_string(),
                    ip_addr: desc.ip,
                    mtu: desc.mtu,
                    lo: true,
                    inserted: true,
                    ..Default::default()
                },
            );
            drop(res);
            tracing::debug!(vm_id = %self.id, interface = %desc.id, "loopback interface added");
            report(&result, VmResult::ok(desc.id));
            return Ok(());
        }

        self.require_hotplug(&format!("interface {}", desc.id))?;
        let index = res.networks.free_index();
        let pci_addr = res.alloc_pci_addr();
        let device_name = format!("eth{index}");
        let mut routes = Vec::new();
        if !desc.gateway.is_empty() && (index == 0 || self.config.default_route_every_interface)
        {
            routes.push(Route {
                dest: DEFAULT_ROUTE.to_string(),
                gateway: desc.gateway.clone(),
                device: device_name.clone(),
            });
        }

        let record = InterfaceRecord {
            id: desc.id.clone(),
            index,
            pci_addr,
            device_name: device_name.clone(),
            host_device: desc.tap_name.clone(),
            bridge: desc.bridge.clone(),
            ip_addr: desc.ip.clone(),
            mac: desc.mac.clone(),
            gateway: desc.gateway.clone(),
            mtu: desc.mtu,
            lo: false,
            routes,
            inserted: false,
        };
        let host = HostNicInfo {
            id: desc.id.clone(),
            device: desc.tap_name,
            bridge: desc.bridge,
            mac: desc.mac,
            gateway: desc.gateway,
        };
        let guest = GuestNicInfo {
            device: device_name.clone(),
            ip_addr: desc.ip,
            index,
            pci_addr,
        };
        res.networks.interfaces.insert(desc.id.clone(), record);
        res.networks.pending.insert(desc.id.clone(), result);

        tracing::debug!(vm_id = %self.id, interface = %desc.id, index, pci_addr, "plugging interface");
        self.driver.add_nic(
            &host,
            &guest,
            VmEvent::NetDevInserted {
                id: desc.id,
                index,
                device_name,
                pci_addr,
            },
            &self.events,
        );
        Ok(())
    }

    pub(crate) fn on_netdev_inserted(self: &Arc<Self>, id: &str, device_name: &str) {
        let mut res = self.lock();
        let sandbox_running = res.sandbox_running;
        let Some(record) = res.networks.interfaces.get_mut(id) else {
            tracing::warn!(vm_id = %self.id, interface = %id, "plug finished for unknown interface");
            return;
        };
        record.inserted = true;
        record.device_name = device_name.to_string();
        let update = record.guest_update();
        let routes = record.routes.clone();
        let target = res.networks.pending.remove(id);
        drop(res);

        tracing::info!(vm_id = %self.id, interface = %id, device = %device_name, "interface plugged");
        let Some(target) = target else {
            return;
        };
        if !sandbox_running {
            report(&target, VmResult::ok(id));
            return;
        }

        let ctx = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let configured = async {
                ctx.agent.update_interface(&update).await?;
                if !routes.is_empty() {
                    ctx.agent.add_route(&routes).await?;
                }
                Ok::<_, CoreError>(())
            }
            .await;
            match configured {
                Ok(()) => report(&target, VmResult::ok(&id)),
                Err(e) => {
                    tracing::error!(vm_id = %ctx.id, interface = %id, error = %e, "guest interface update failed");
                    report(&target, VmResult::failed(&id, e.to_string()));
                }
            }
        });
    }

    pub(crate) fn on_netdev_attach_failed(&self, id: &str, reason: &str) {
        let mut res = self.lock();
        res.networks.interfaces.remove(id);
        let target = res.networks.pending.remove(id);
        drop(res);

        tracing::error!(vm_id = %self.id, interface = %id, %reason, "interface plug failed");
        if let Some(target) = target {
            report(&target, VmResult::failed(id, reason));
        }
    }

    /// Unplug a network interface.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] if the interface does not exist
    /// - [`CoreError::Busy`] while a plug or unplug of it is in flight
    /// - [`CoreError::NotReady`] if the VM is not running
    pub fn remove_interface(&self, id: &str, result: ResultSender) -> Result<()> {
        self.try_remove_interface(id, result)
            .map_err(|e| self.rejected("remove_interface", e))
    }

    fn try_remove_interface(&self, id: &str, result: ResultSender) -> Result<()> {
        let mut res = self.lock_running()?;
        let Some(record) = res.networks.interfaces.get(id) else {
            return Err(CoreError::spec(format!("interface {id} not found")));
        };
        let (lo, index, pci_addr) = (record.lo, record.index, record.pci_addr);
        if res.networks.pending.contains_key(id) || !record.inserted {
            return Err(CoreError::busy(format!("interface {id} is being plugged")));
        }

        if lo {
            res.networks.interfaces.remove(id);
            drop(res);
            report(&result, VmResult::ok(id));
            return Ok(());
        }

        res.networks.pending.insert(id.to_string(), result);
        tracing::debug!(vm_id = %self.id, interface = %id, "unplugging interface");
        self.driver.remove_nic(
            id,
            pci_addr,
            VmEvent::NetDevRemoved {
                id: id.to_string(),
                index,
            },
            &self.events,
        );
        Ok(())
    }

    pub(crate) fn on_netdev_removed(&self, id: &str) {
        let mut res = self.lock();
        res.networks.interfaces.remove(id);
        let target = res.networks.pending.remove(id);
        drop(res);

        tracing::info!(vm_id = %self.id, interface = %id, "interface unplugged");
        if let Some(target) = target {
            report(&target, VmResult::ok(id));
        }
    }

    pub(crate) fn on_netdev_detach_failed(&self, id: &str, reason: &str) {
        let target = self.lock().networks.pending.remove(id);
        tracing::error!(vm_id = %self.id, interface = %id, %reason, "interface unplug failed");
        if let Some(target) = target {
            report(&target, VmResult::failed(id, reason));
        }
    }

    /// Record host-to-container port mappings.
    ///
    /// # Errors
    /// [`CoreError::Spec`] on a zero port, an unknown protocol or a host
    /// port already mapped for the same protocol.
    pub fn add_port_mappings(&self, ports: Vec<PortDescription>) -> Result<()> {
        let mut res = self.lock();
        let mut accepted: Vec<PortDescription> = Vec::with_capacity(ports.len());
        for mut port in ports {
            port.protocol = port.protocol.to_ascii_lowercase();
            if port.protocol != "tcp" && port.protocol != "udp" {
                return Err(CoreError::spec(format!("unknown protocol {}", port.protocol)));
            }
            if port.host_port == 0 || port.container_port == 0 {
                return Err(CoreError::spec("port must be non-zero"));
            }
            let taken = res
                .networks
                .ports
                .iter()
                .chain(accepted.iter())
                .any(|p| p.host_port == port.host_port && p.protocol == port.protocol);
            if taken {
                return Err(CoreError::spec(format!(
                    "host port {}/{} is already mapped",
                    port.host_port, port.protocol
                )));
            }
            accepted.push(port);
        }
        res.networks.ports.extend(accepted);
        Ok(())
    }

    /// Current port mappings.
    pub fn port_mappings(&self) -> Vec<PortDescription> {
        self.lock().networks.ports.clone()
    }

    /// Record sandbox-wide guest settings.
    pub fn set_sandbox_config(&self, config: SandboxConfig) {
        self.lock().sandbox = Some(config);
    }

    /// Sandbox definition for the guest agent: hostname, DNS, every
    /// plugged interface and their routes.
    pub(crate) fn guest_sandbox(&self) -> GuestSandbox {
        let res = self.lock();
        let sandbox = res.sandbox.clone().unwrap_or_default();
        let hostname = if sandbox.hostname.is_empty() {
            self.id.clone()
        } else {
            sandbox.hostname
        };
        GuestSandbox {
            hostname,
            dns: sandbox.dns,
            interfaces: res
                .networks
                .interfaces
                .values()
                .filter(|i| i.inserted && !i.lo)
                .map(InterfaceRecord::guest_update)
                .collect(),
            routes: res.networks.routes(),
            share_dir: SHARE_DIR_TAG.to_string(),
        }
    }

    /// Snapshot of the interface records.
    pub fn interfaces(&self) -> Vec<InterfaceRecord> {
        self.lock().networks.interfaces.values().cloned().collect()
    }
}
