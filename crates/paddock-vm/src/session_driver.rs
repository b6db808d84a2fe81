//! A driver whose VMs are controlled through a command channel.
//!
//! [`SessionDriver`] does not start hypervisor processes itself. Each VM's
//! hypervisor is expected to expose a control channel, opened through a
//! [`ChannelConnector`]; every hotplug, pause and power request becomes a
//! [`DriverSession`] on that VM's [`SessionHandle`].

use crate::config::BootConfig;
use crate::driver::{DriverContext, HypervisorDriver};
use crate::error::{Result, VmError};
use crate::event::{post, BlockDescriptor, EventSender, GuestNicInfo, HostNicInfo, VmEvent};
use crate::session::{
    ChannelMessage, CommandChannel, DriverCommand, DriverSession, SessionConfig, SessionHandle,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};

/// Opens the control channel of a VM.
pub trait ChannelConnector: Send + Sync + 'static {
    /// Channel for `vm_id`. Connecting may be deferred to
    /// [`CommandChannel::handshake`].
    fn connect(&self, vm_id: &str) -> Box<dyn CommandChannel>;
}

#[async_trait]
impl CommandChannel for Box<dyn CommandChannel> {
    async fn handshake(&mut self) -> Result<()> {
        (**self).handshake().await
    }

    async fn send(&mut self, command: &DriverCommand) -> Result<()> {
        (**self).send(command).await
    }

    async fn recv(&mut self) -> Result<ChannelMessage> {
        (**self).recv().await
    }
}

/// Backend that drives hypervisors over their control channels.
#[derive(Clone)]
pub struct SessionDriver {
    name: &'static str,
    connector: Arc<dyn ChannelConnector>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionDriver {
    pub fn new(name: &'static str, connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            name,
            connector,
            config: SessionConfig::default(),
        }
    }

    /// Use `config` for every runner this driver starts.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    fn context(&self, vm_id: &str) -> SessionContext {
        SessionContext {
            vm_id: vm_id.to_string(),
            driver: self.name,
            connector: Arc::clone(&self.connector),
            config: self.config,
            runner: Mutex::new(None),
        }
    }
}

impl HypervisorDriver for SessionDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init_context(&self, vm_id: &str) -> Box<dyn DriverContext> {
        Box::new(self.context(vm_id))
    }

    fn load_context(&self, vm_id: &str, persisted: &Value) -> Result<Box<dyn DriverContext>> {
        let hypervisor = persisted.get("hypervisor").and_then(Value::as_str);
        if hypervisor != Some(self.name) {
            return Err(VmError::Driver(format!(
                "wrong driver type in persisted state: {}",
                hypervisor.unwrap_or("<missing>")
            )));
        }
        match persisted.get("vm_id").and_then(Value::as_str) {
            Some(id) if id != vm_id => Err(VmError::Driver(format!(
                "persisted driver state belongs to {id}"
            ))),
            _ => Ok(Box::new(self.context(vm_id))),
        }
    }
}

/// Context created by [`SessionDriver`].
///
/// The runner starts on `launch` or `associate`; requests made before that
/// fail at once.
pub struct SessionContext {
    vm_id: String,
    driver: &'static str,
    connector: Arc<dyn ChannelConnector>,
    config: SessionConfig,
    runner: Mutex<Option<SessionHandle>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("vm_id", &self.vm_id)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    fn open(&self, events: &EventSender) {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.is_some() {
            tracing::debug!(vm_id = %self.vm_id, "control channel already open");
            return;
        }
        let channel = self.connector.connect(&self.vm_id);
        *runner = Some(SessionHandle::spawn(channel, events.clone(), self.config));
        tracing::info!(vm_id = %self.vm_id, driver = self.driver, "control channel opened");
    }

    fn submit(&self, session: DriverSession, events: &EventSender) {
        let runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = match runner.as_ref() {
            Some(handle) => handle.submit(session.clone()),
            None => Err(VmError::SessionClosed),
        };
        drop(runner);

        if let Err(e) = outcome {
            tracing::error!(vm_id = %self.vm_id, callback = session.label(), error = %e, "driver session not submitted");
            if let Some(callback) = session.callback {
                post(events, callback.into_device_failure(e.to_string()));
            }
        }
    }
}

fn drive_id(scsi_id: u32) -> String {
    format!("drive{scsi_id}")
}

fn scsi_disk_id(scsi_id: u32) -> String {
    format!("scsi-disk{scsi_id}")
}

/// Commands that attach a block device on the SCSI bus.
fn add_disk_commands(block: &BlockDescriptor) -> Vec<DriverCommand> {
    let mut drive = format!(
        "drive_add dummy file={},if=none,id={},format={},cache=writeback",
        block.filename,
        drive_id(block.scsi_id),
        block.format
    );
    if block.read_only {
        drive.push_str(",readonly");
    }
    vec![
        DriverCommand::with_arguments("human-monitor-command", json!({ "command-line": drive })),
        DriverCommand::with_arguments(
            "device_add",
            json!({
                "driver": "scsi-hd",
                "bus": "scsi0.0",
                "scsi-id": block.scsi_id.to_string(),
                "drive": drive_id(block.scsi_id),
                "id": scsi_disk_id(block.scsi_id),
            }),
        ),
    ]
}

fn remove_disk_commands(block: &BlockDescriptor) -> Vec<DriverCommand> {
    vec![
        DriverCommand::with_arguments("device_del", json!({ "id": scsi_disk_id(block.scsi_id) })),
        DriverCommand::with_arguments(
            "human-monitor-command",
            json!({ "command-line": format!("drive_del {}", drive_id(block.scsi_id)) }),
        ),
    ]
}

/// Commands that plug a tap device as a virtio NIC at `guest.pci_addr`.
fn add_nic_commands(host: &HostNicInfo, guest: &GuestNicInfo) -> Vec<DriverCommand> {
    vec![
        DriverCommand::with_arguments(
            "netdev_add",
            json!({
                "type": "tap",
                "id": host.id,
                "ifname": host.device,
                "script": "no",
            }),
        ),
        DriverCommand::with_arguments(
            "device_add",
            json!({
                "driver": "virtio-net-pci",
                "netdev": host.id,
                "mac": host.mac,
                "bus": "pci.0",
                "addr": format!("0x{:x}", guest.pci_addr),
                "id": host.id,
            }),
        ),
    ]
}

fn remove_nic_commands(id: &str) -> Vec<DriverCommand> {
    vec![
        DriverCommand::with_arguments("device_del", json!({ "id": id })),
        DriverCommand::with_arguments("netdev_del", json!({ "id": id })),
    ]
}

impl DriverContext for SessionContext {
    fn launch(&self, _config: &BootConfig, events: &EventSender) {
        self.open(events);
    }

    fn associate(&self, events: &EventSender) {
        self.open(events);
    }

    fn dump(&self) -> Result<Value> {
        Ok(json!({ "hypervisor": self.driver, "vm_id": self.vm_id }))
    }

    fn add_disk(&self, block: &BlockDescriptor, callback: VmEvent, events: &EventSender) {
        self.submit(
            DriverSession::new(add_disk_commands(block), callback),
            events,
        );
    }

    fn remove_disk(&self, block: &BlockDescriptor, callback: VmEvent, events: &EventSender) {
        self.submit(
            DriverSession::new(remove_disk_commands(block), callback),
            events,
        );
    }

    fn add_nic(
        &self,
        host: &HostNicInfo,
        guest: &GuestNicInfo,
        callback: VmEvent,
        events: &EventSender,
    ) {
        self.submit(
            DriverSession::new(add_nic_commands(host, guest), callback),
            events,
        );
    }

    fn remove_nic(&self, id: &str, _pci_addr: u32, callback: VmEvent, events: &EventSender) {
        self.submit(DriverSession::new(remove_nic_commands(id), callback), events);
    }

    fn pause(&self, pause: bool, events: &EventSender) {
        let command = if pause { "stop" } else { "cont" };
        self.submit(
            DriverSession::new(
                vec![DriverCommand::new(command)],
                VmEvent::PauseResult { pause, cause: None },
            ),
            events,
        );
    }

    fn shutdown(&self, events: &EventSender) {
        // VmExit follows from the hypervisor's shutdown notice
        self.submit(
            DriverSession::detached(vec![DriverCommand::new("system_powerdown")]),
            events,
        );
    }

    fn kill(&self, events: &EventSender) {
        self.submit(
            DriverSession::new(
                vec![DriverCommand::new("quit")],
                VmEvent::VmKilled { success: true },
            ),
            events,
        );
    }

    fn close(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = runner {
            handle.quit();
            tracing::debug!(vm_id = %self.vm_id, "control channel closed");
        }
    }
}
