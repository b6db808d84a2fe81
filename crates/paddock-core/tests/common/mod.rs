//! Scripted driver and agent shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use paddock_core::{
    ContainerDescription, ContextConfig, CoreError, GuestContainer, GuestSandbox,
    InterfaceDescription, InterfaceUpdate, Process, Route, SandboxAgent, Vm, VolumeDescription,
    VolumeReference,
};
use paddock_vm::{
    post, BlockDescriptor, BootConfig, CpuStats, DriverContext, EventSender, GuestNicInfo,
    HostNicInfo, HypervisorDriver, MemoryStats, VmError, VmEvent, VmStats,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the mock driver does and what it was asked to do.
#[derive(Default)]
pub struct DriverScript {
    calls: Mutex<Vec<String>>,
    /// Keep hotplug callbacks until `complete_held`
    pub hold_hotplug: AtomicBool,
    /// Disk names whose attach fails
    pub fail_disks: Mutex<HashSet<String>>,
    /// Post `VmExit` when asked to shut down
    pub exit_on_shutdown: AtomicBool,
    /// Report no hotplug support
    pub no_hotplug: AtomicBool,
    pub loads: AtomicUsize,
    held: Mutex<Vec<(VmEvent, EventSender)>>,
    events: Mutex<Option<EventSender>>,
}

impl DriverScript {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn complete(&self, callback: VmEvent, events: &EventSender) {
        if self.hold_hotplug.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push((callback, events.clone()));
        } else {
            post(events, callback);
        }
    }
}

#[derive(Clone)]
pub struct MockDriver {
    pub script: Arc<DriverScript>,
}

impl MockDriver {
    pub fn new() -> Self {
        let script = DriverScript::default();
        script.exit_on_shutdown.store(true, Ordering::SeqCst);
        Self {
            script: Arc::new(script),
        }
    }

    /// Driver whose hotplug completions wait for `complete_held`.
    pub fn holding() -> Self {
        let driver = Self::new();
        driver.script.hold_hotplug.store(true, Ordering::SeqCst);
        driver
    }

    /// Driver that cannot hot-plug devices.
    pub fn without_hotplug() -> Self {
        let driver = Self::new();
        driver.script.no_hotplug.store(true, Ordering::SeqCst);
        driver
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn fail_disk(&self, name: &str) {
        self.script.fail_disks.lock().unwrap().insert(name.to_string());
    }

    /// Post every held hotplug callback. Returns how many were held.
    pub fn complete_held(&self) -> usize {
        let held: Vec<_> = self.script.held.lock().unwrap().drain(..).collect();
        let count = held.len();
        for (callback, events) in held {
            post(&events, callback);
        }
        count
    }

    pub fn held_count(&self) -> usize {
        self.script.held.lock().unwrap().len()
    }

    /// Post an event as if the hypervisor had sent it.
    pub fn inject(&self, event: VmEvent) -> bool {
        let events = self.script.events.lock().unwrap().clone();
        events.map(|tx| post(&tx, event)).unwrap_or(false)
    }
}

impl HypervisorDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn init_context(&self, _vm_id: &str) -> Box<dyn DriverContext> {
        Box::new(MockContext {
            script: Arc::clone(&self.script),
        })
    }

    fn load_context(
        &self,
        vm_id: &str,
        persisted: &Value,
    ) -> paddock_vm::Result<Box<dyn DriverContext>> {
        self.script.loads.fetch_add(1, Ordering::SeqCst);
        if persisted.get("hypervisor").and_then(Value::as_str) != Some("mock") {
            return Err(VmError::Driver("not a mock snapshot".into()));
        }
        Ok(self.init_context(vm_id))
    }

    fn supports_hotplug(&self) -> bool {
        !self.script.no_hotplug.load(Ordering::SeqCst)
    }
}

struct MockContext {
    script: Arc<DriverScript>,
}

impl DriverContext for MockContext {
    fn launch(&self, _config: &BootConfig, events: &EventSender) {
        self.script.record("launch".into());
        *self.script.events.lock().unwrap() = Some(events.clone());
        post(events, VmEvent::InitConnected);
    }

    fn associate(&self, events: &EventSender) {
        self.script.record("associate".into());
        *self.script.events.lock().unwrap() = Some(events.clone());
    }

    fn dump(&self) -> paddock_vm::Result<Value> {
        Ok(json!({ "hypervisor": "mock" }))
    }

    fn add_disk(&self, block: &BlockDescriptor, callback: VmEvent, events: &EventSender) {
        self.script.record(format!("add_disk:{}", block.name));
        if self.script.fail_disks.lock().unwrap().contains(&block.name) {
            post(events, callback.into_device_failure("injected attach failure"));
            return;
        }
        self.script.complete(callback, events);
    }

    fn remove_disk(&self, block: &BlockDescriptor, callback: VmEvent, events: &EventSender) {
        self.script.record(format!("remove_disk:{}", block.name));
        self.script.complete(callback, events);
    }

    fn add_nic(
        &self,
        host: &HostNicInfo,
        _guest: &GuestNicInfo,
        callback: VmEvent,
        events: &EventSender,
    ) {
        self.script.record(format!("add_nic:{}", host.id));
        self.script.complete(callback, events);
    }

    fn remove_nic(&self, id: &str, _pci_addr: u32, callback: VmEvent, events: &EventSender) {
        self.script.record(format!("remove_nic:{id}"));
        self.script.complete(callback, events);
    }

    fn pause(&self, pause: bool, events: &EventSender) {
        self.script.record(format!("pause:{pause}"));
        post(events, VmEvent::PauseResult { pause, cause: None });
    }

    fn shutdown(&self, events: &EventSender) {
        self.script.record("shutdown".into());
        if self.script.exit_on_shutdown.load(Ordering::SeqCst) {
            post(events, VmEvent::VmExit);
        }
    }

    fn kill(&self, events: &EventSender) {
        self.script.record("kill".into());
        post(events, VmEvent::VmKilled { success: true });
    }

    fn stats(&self) -> paddock_vm::Result<VmStats> {
        self.script.record("stats".into());
        Ok(VmStats {
            cpu: CpuStats {
                total_ns: 3_000,
                user_ns: 2_000,
                system_ns: 1_000,
                per_cpu_ns: vec![1_500, 1_500],
            },
            memory: MemoryStats {
                usage_bytes: 64 << 20,
                available_bytes: 192 << 20,
                rss_bytes: 80 << 20,
            },
            ..Default::default()
        })
    }

    fn close(&self) {
        self.script.record("close".into());
    }
}

/// Agent that accepts everything and records what it was asked.
#[derive(Default)]
pub struct MockAgent {
    calls: Mutex<Vec<String>>,
    pub sandboxes: Mutex<Vec<GuestSandbox>>,
    pub containers: Mutex<Vec<GuestContainer>>,
    pub updates: Mutex<Vec<InterfaceUpdate>>,
    pub routes: Mutex<Vec<Route>>,
    /// Files by (container, path)
    pub files: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MockAgent {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl SandboxAgent for MockAgent {
    async fn api_version(&self) -> paddock_core::Result<u32> {
        self.record("api_version");
        Ok(4242)
    }

    async fn start_sandbox(&self, sandbox: &GuestSandbox) -> paddock_core::Result<()> {
        self.record("start_sandbox");
        self.sandboxes.lock().unwrap().push(sandbox.clone());
        Ok(())
    }

    async fn destroy_sandbox(&self) -> paddock_core::Result<()> {
        self.record("destroy_sandbox");
        Ok(())
    }

    async fn new_container(&self, container: &GuestContainer) -> paddock_core::Result<()> {
        self.record(format!("new_container:{}", container.id));
        self.containers.lock().unwrap().push(container.clone());
        Ok(())
    }

    async fn add_process(&self, container: &str, process: &Process) -> paddock_core::Result<()> {
        self.record(format!("add_process:{container}:{}", process.id));
        Ok(())
    }

    async fn signal_process(
        &self,
        container: &str,
        process: &str,
        signal: i32,
    ) -> paddock_core::Result<()> {
        self.record(format!("signal_process:{container}:{process}:{signal}"));
        Ok(())
    }

    async fn wait_process(&self, container: &str, process: &str) -> paddock_core::Result<i32> {
        self.record(format!("wait_process:{container}:{process}"));
        Ok(0)
    }

    async fn update_interface(&self, update: &InterfaceUpdate) -> paddock_core::Result<()> {
        self.record(format!("update_interface:{}", update.device));
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn add_route(&self, routes: &[Route]) -> paddock_core::Result<()> {
        self.record("add_route");
        self.routes.lock().unwrap().extend(routes.iter().cloned());
        Ok(())
    }

    async fn write_stdin(
        &self,
        _container: &str,
        _process: &str,
        data: &[u8],
    ) -> paddock_core::Result<usize> {
        Ok(data.len())
    }

    async fn read_stdout(
        &self,
        _container: &str,
        _process: &str,
        _max: usize,
    ) -> paddock_core::Result<Vec<u8>> {
        Ok(b"hello".to_vec())
    }

    async fn close_stdin(&self, _container: &str, _process: &str) -> paddock_core::Result<()> {
        Ok(())
    }

    async fn write_file(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
    ) -> paddock_core::Result<()> {
        self.record(format!("write_file:{container}:{path}"));
        self.files
            .lock()
            .unwrap()
            .insert((container.into(), path.into()), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, container: &str, path: &str) -> paddock_core::Result<Vec<u8>> {
        self.record(format!("read_file:{container}:{path}"));
        self.files
            .lock()
            .unwrap()
            .get(&(container.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::Agent(format!("{path}: no such file")))
    }

    async fn online_cpu_mem(&self) -> paddock_core::Result<()> {
        self.record("online_cpu_mem");
        Err(CoreError::Agent("hotplug not supported".into()))
    }
}

/// Context config rooted in a fresh temporary directory.
pub fn test_config() -> ContextConfig {
    let base: PathBuf =
        std::env::temp_dir().join(format!("paddock-test-{}", uuid::Uuid::new_v4()));
    ContextConfig::builder()
        .base_dir(base)
        .shutdown_timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

pub async fn boot(driver: &MockDriver) -> (Vm, Arc<MockAgent>) {
    boot_with(driver, test_config()).await
}

pub async fn boot_with(driver: &MockDriver, config: ContextConfig) -> (Vm, Arc<MockAgent>) {
    init_tracing();
    let agent = Arc::new(MockAgent::default());
    let vm = Vm::boot(
        Some("vm-test".into()),
        BootConfig::default(),
        driver,
        agent.clone(),
        config,
    )
    .await
    .expect("boot should succeed");
    (vm, agent)
}

pub fn dir_volume(name: &str) -> VolumeDescription {
    VolumeDescription {
        name: name.into(),
        source: format!("/srv/{name}"),
        format: "vfs".into(),
        fstype: "dir".into(),
        ..Default::default()
    }
}

pub fn block_volume(name: &str) -> VolumeDescription {
    VolumeDescription {
        name: name.into(),
        source: format!("/dev/mapper/{name}"),
        format: "raw".into(),
        fstype: "ext4".into(),
        ..Default::default()
    }
}

/// Container with a directory root and the given shared volumes.
pub fn container(id: &str, volumes: &[&str]) -> ContainerDescription {
    let mut desc = ContainerDescription {
        id: id.into(),
        image: "busybox".into(),
        root_volume: dir_volume(&format!("{id}-root")),
        root_path: "rootfs".into(),
        path: "/bin/sh".into(),
        workdir: "/".into(),
        ..Default::default()
    };
    for name in volumes {
        desc.volumes.insert(
            (*name).into(),
            VolumeReference {
                path: format!("/mnt/{name}"),
                name: (*name).into(),
                read_only: false,
            },
        );
    }
    desc
}

/// Container whose root is a block device.
pub fn block_container(id: &str, volumes: &[&str]) -> ContainerDescription {
    let mut desc = container(id, volumes);
    desc.root_volume = block_volume(&format!("{id}-root"));
    desc
}

pub fn interface(id: &str, ip: &str, gateway: &str) -> InterfaceDescription {
    InterfaceDescription {
        id: id.into(),
        ip: ip.into(),
        gateway: gateway.into(),
        mac: "52:54:00:12:34:56".into(),
        tap_name: format!("tap-{id}"),
        bridge: "br0".into(),
        ..Default::default()
    }
}
