//! The VM facade: lifecycle commands, resource operations and agent calls
//! wrapped as async methods.

use crate::agent::{Process, SandboxAgent};
use crate::config::ContextConfig;
use crate::context::VmContext;
use crate::error::{CoreError, Result};
use crate::fanout::{ResponseHub, Subscription};
use crate::persist;
use crate::resource::{ContainerState, HardwareStatus, Resources};
use crate::state::VmState;
use crate::types::{
    result_channel, ContainerDescription, InterfaceDescription, PortDescription, ResponseCode,
    ResultSender, SandboxConfig, VmResponse, VmResult, VolumeDescription,
};
use chrono::{DateTime, Utc};
use paddock_vm::{BootConfig, HypervisorDriver, VmError, VmEvent, VmStats};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A managed VM.
///
/// Cheap to clone; every clone drives the same VM.
#[derive(Debug, Clone)]
pub struct Vm {
    ctx: Arc<VmContext>,
    hub: Arc<ResponseHub>,
    created_at: DateTime<Utc>,
}

impl Vm {
    /// Boot a new VM.
    ///
    /// Creates the VM's share directory, starts its dispatcher and asks the
    /// driver to launch it. The VM is `Running` when this returns; the guest
    /// agent reports `VmRunning` once it connects.
    ///
    /// # Errors
    /// Returns an error if either configuration is invalid or the share
    /// directory cannot be created.
    pub async fn boot(
        id: Option<String>,
        boot: BootConfig,
        driver: &dyn HypervisorDriver,
        agent: Arc<dyn SandboxAgent>,
        config: ContextConfig,
    ) -> Result<Self> {
        let start = Instant::now();
        config.validate()?;
        boot.validate()?;

        let id = id.unwrap_or_else(|| format!("vm-{}", Uuid::new_v4().simple()));
        tracing::info!(
            vm_id = %id,
            driver = driver.name(),
            vcpus = boot.vcpu_count,
            memory_mib = boot.memory_mib,
            "booting vm"
        );

        let share_dir = config.share_dir(&id);
        tokio::fs::create_dir_all(&share_dir).await.map_err(|e| {
            tracing::error!(vm_id = %id, path = %share_dir.display(), error = %e, "failed to create share directory");
            CoreError::Io(e)
        })?;

        let resources = Resources {
            hw: HardwareStatus {
                guest_cid: boot.vsock_cid,
                ..Default::default()
            },
            ..Default::default()
        };
        let driver_ctx = driver.init_context(&id);
        let (ctx, responses) = VmContext::start(
            id.clone(),
            config,
            Arc::from(driver_ctx),
            agent,
            driver.supports_hotplug(),
            resources,
        );
        let hub = ResponseHub::spawn(id.clone(), responses);
        ctx.driver.launch(&boot, &ctx.events);

        tracing::info!(
            vm_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "vm launched"
        );
        Ok(Self {
            ctx,
            hub,
            created_at: Utc::now(),
        })
    }

    /// Pick up a running VM from a snapshot produced by [`dump`](Self::dump)
    /// or [`release`](Self::release).
    ///
    /// # Errors
    /// - [`CoreError::Version`] if the snapshot version is not supported
    /// - [`CoreError::IdMismatch`] if the snapshot belongs to another VM
    /// - [`CoreError::Corrupt`] if the snapshot is inconsistent
    /// - [`CoreError::Vm`] if the driver rejects its persisted state
    pub fn associate(
        id: &str,
        driver: &dyn HypervisorDriver,
        agent: Arc<dyn SandboxAgent>,
        config: ContextConfig,
        data: &[u8],
    ) -> Result<Self> {
        config.validate()?;
        let (ctx, responses) = persist::associate(id, driver, agent, config, data)?;
        let hub = ResponseHub::spawn(id.to_string(), responses);
        Ok(Self {
            ctx,
            hub,
            created_at: Utc::now(),
        })
    }

    /// VM identifier.
    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    /// When this handle was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Shared context, for non-blocking resource operations with caller
    /// supplied result targets.
    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    /// Subscribe to the VM's responses.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        self.ctx.state()
    }

    /// Wait until the VM reaches `target`.
    ///
    /// # Errors
    /// - [`CoreError::Vm`] with a timeout if `target` is not reached in time
    /// - [`CoreError::NotReady`] if the VM ended in another state
    pub async fn wait_for_state(&self, target: VmState, timeout: Duration) -> Result<()> {
        let mut state = self.ctx.state_watch();
        let outcome = tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CoreError::NotReady {
                expected: target.to_string(),
                actual: self.state().to_string(),
            }),
            Err(_) => Err(VmError::Timeout(timeout).into()),
        }
    }

    /// Wait on `sub` for a response with `code`.
    async fn await_response(
        &self,
        sub: &mut Subscription,
        code: ResponseCode,
    ) -> Result<VmResponse> {
        while let Some(response) = sub.recv().await {
            if response.code == code {
                return Ok(response);
            }
            if response.code == ResponseCode::Unexpected {
                return Err(CoreError::NotReady {
                    expected: VmState::Running.to_string(),
                    actual: self.state().to_string(),
                });
            }
            tracing::trace!(vm_id = %self.id(), code = %response.code, "skipping response");
        }
        Err(CoreError::Closed(self.id().to_string()))
    }

    /// Stop the sandbox and power the VM off, killing it if the guest does
    /// not exit in time. Returns once the VM is gone.
    ///
    /// # Errors
    /// [`CoreError::NotReady`] if the VM is already shutting down.
    pub async fn shutdown(&self) -> Result<()> {
        let start = Instant::now();
        let mut sub = self.subscribe();
        if !self.ctx.post(VmEvent::Shutdown) {
            return Ok(());
        }
        match self.await_response(&mut sub, ResponseCode::VmShutdown).await {
            Ok(_) | Err(CoreError::Closed(_)) => {
                tracing::info!(
                    vm_id = %self.id(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "vm shut down"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Kill the hypervisor without asking the guest. Returns once the VM is
    /// gone.
    pub async fn kill(&self) -> Result<()> {
        let mut sub = self.subscribe();
        tracing::warn!(vm_id = %self.id(), "killing vm");
        self.ctx.driver.kill(&self.ctx.events);
        match self.await_response(&mut sub, ResponseCode::VmShutdown).await {
            Ok(_) | Err(CoreError::Closed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Detach from the VM, leaving it running, and return its snapshot.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be taken or the VM is not
    /// running.
    pub async fn release(&self) -> Result<Vec<u8>> {
        let data = self.dump()?;
        let mut sub = self.subscribe();
        if !self.ctx.post(VmEvent::Release) {
            return Err(CoreError::Closed(self.id().to_string()));
        }
        self.await_response(&mut sub, ResponseCode::Ok).await?;
        tracing::info!(vm_id = %self.id(), bytes = data.len(), "vm released");
        Ok(data)
    }

    /// Pause (`true`) or resume (`false`) the guest.
    pub async fn pause(&self, pause: bool) -> Result<()> {
        let mut sub = self.subscribe();
        if !self.ctx.post(VmEvent::Pause { pause }) {
            return Err(CoreError::Closed(self.id().to_string()));
        }
        let response = self.await_response(&mut sub, ResponseCode::PauseResult).await?;
        if response.cause.is_empty() {
            Ok(())
        } else {
            Err(VmError::Driver(response.cause).into())
        }
    }

    /// Whether the guest is paused.
    pub fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    /// Serialized snapshot of the VM.
    pub fn dump(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.ctx.dump()?)?)
    }

    /// Run a resource operation and wait for its outcome.
    async fn run_op(
        &self,
        id: &str,
        op: impl FnOnce(ResultSender) -> Result<()>,
    ) -> Result<VmResult> {
        let (tx, mut rx) = result_channel();
        op(tx)?;
        Ok(rx
            .recv()
            .await
            .unwrap_or_else(|| VmResult::failed(id, "vm closed before the operation completed")))
    }

    /// Add a shared volume and wait until it is ready.
    pub async fn add_volume(&self, desc: VolumeDescription) -> Result<VmResult> {
        let name = desc.name.clone();
        self.run_op(&name, |tx| self.ctx.add_volume(desc, tx)).await
    }

    /// Remove a shared volume and wait until it is detached.
    pub async fn remove_volume(&self, name: &str) -> Result<VmResult> {
        self.run_op(name, |tx| self.ctx.remove_volume(name, tx)).await
    }

    /// Add a container and wait until its volumes are ready.
    pub async fn add_container(&self, desc: ContainerDescription) -> Result<VmResult> {
        let id = desc.id.clone();
        self.run_op(&id, |tx| self.ctx.add_container(desc, tx)).await
    }

    /// Remove a container and wait until its root volume is detached.
    pub async fn remove_container(&self, id: &str) -> Result<VmResult> {
        self.run_op(id, |tx| self.ctx.remove_container(id, tx)).await
    }

    /// Plug an interface and wait until the guest has it.
    pub async fn add_interface(&self, desc: InterfaceDescription) -> Result<VmResult> {
        let id = desc.id.clone();
        self.run_op(&id, |tx| self.ctx.add_interface(desc, tx)).await
    }

    /// Unplug an interface.
    pub async fn remove_interface(&self, id: &str) -> Result<VmResult> {
        self.run_op(id, |tx| self.ctx.remove_interface(id, tx)).await
    }

    /// Wait until a container is ready to start.
    ///
    /// # Errors
    /// - [`CoreError::Spec`] if the container does not exist or goes away
    /// - [`CoreError::Vm`] with a timeout if it is not ready in time
    pub async fn wait_container_ready(&self, id: &str, timeout: Duration) -> Result<()> {
        let mut state = self
            .ctx
            .watch_container(id)
            .ok_or_else(|| CoreError::spec(format!("container {id} not found")))?;
        let outcome = tokio::time::timeout(timeout, state.wait_for(|s| *s == ContainerState::Ready))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CoreError::spec(format!("container {id} no longer exists"))),
            Err(_) => Err(VmError::Timeout(timeout).into()),
        }
    }

    /// Record sandbox-wide guest settings used by [`start_sandbox`](Self::start_sandbox).
    pub fn set_sandbox_config(&self, config: SandboxConfig) {
        self.ctx.set_sandbox_config(config);
    }

    /// Record host-to-container port mappings.
    pub fn add_port_mappings(&self, ports: Vec<PortDescription>) -> Result<()> {
        self.ctx.add_port_mappings(ports)
    }

    /// Forget all resources. See [`VmContext::reset_resources`].
    pub fn reset_resources(&self) {
        self.ctx.reset_resources();
    }

    /// Start the sandbox inside the guest with the plugged interfaces.
    pub async fn start_sandbox(&self) -> Result<()> {
        self.ctx.ensure_running()?;
        let version = self.ctx.agent.api_version().await?;
        let sandbox = self.ctx.guest_sandbox();
        tracing::info!(
            vm_id = %self.id(),
            api_version = version,
            hostname = %sandbox.hostname,
            interfaces = sandbox.interfaces.len(),
            "starting sandbox"
        );
        self.ctx.agent.start_sandbox(&sandbox).await?;
        self.ctx.set_sandbox_running(true);
        self.ctx.respond(ResponseCode::SandboxRunning, "");
        Ok(())
    }

    /// Stop the sandbox inside the guest, leaving the VM running.
    ///
    /// # Errors
    /// [`CoreError::Vm`] with a timeout if the guest does not stop it in
    /// time.
    pub async fn stop_sandbox(&self) -> Result<()> {
        self.ctx.ensure_running()?;
        let limit = self.ctx.config.sandbox_stop_timeout;
        match tokio::time::timeout(limit, self.ctx.agent.destroy_sandbox()).await {
            Ok(Ok(())) => {
                self.ctx.set_sandbox_running(false);
                self.ctx.respond(ResponseCode::SandboxStopped, "");
                tracing::info!(vm_id = %self.id(), "sandbox stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::error!(vm_id = %self.id(), "sandbox did not stop in time");
                Err(VmError::Timeout(limit).into())
            }
        }
    }

    /// Create and start a ready container in the guest.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.ctx.ensure_running()?;
        let container = self.ctx.prepare_container_start(id)?;
        tracing::info!(
            vm_id = %self.id(),
            container_id = %id,
            stdio = container.process.stdio,
            "starting container"
        );
        self.ctx.agent.new_container(&container).await
    }

    /// Run another process in a started container. Returns the stdio
    /// attach id allocated for it.
    pub async fn add_process(&self, container: &str, mut process: Process) -> Result<u64> {
        self.ctx.ensure_running()?;
        match self.ctx.container_state(container) {
            Some(ContainerState::Ready) => {}
            Some(state) => {
                return Err(CoreError::busy(format!("container {container} is {state}")));
            }
            None => return Err(CoreError::spec(format!("container {container} not found"))),
        }

        process.stdio = self.ctx.next_attach_id();
        process.stderr = if process.terminal {
            0
        } else {
            self.ctx.next_attach_id()
        };
        self.ctx.agent.add_process(container, &process).await?;
        Ok(process.stdio)
    }

    /// Send `signal` to a process in a container.
    pub async fn signal_process(&self, container: &str, process: &str, signal: i32) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx
            .agent
            .signal_process(container, process, signal)
            .await
    }

    /// Wait for a process to exit and return its status.
    pub async fn wait_process(&self, container: &str, process: &str) -> Result<i32> {
        self.ctx.ensure_running()?;
        self.ctx.agent.wait_process(container, process).await
    }

    /// Write to a process's stdin. Returns how many bytes the guest took.
    pub async fn write_stdin(&self, container: &str, process: &str, data: &[u8]) -> Result<usize> {
        self.ctx.ensure_running()?;
        self.ctx.agent.write_stdin(container, process, data).await
    }

    /// Read up to `max` bytes of a process's stdout. An empty buffer means
    /// the stream ended.
    pub async fn read_stdout(&self, container: &str, process: &str, max: usize) -> Result<Vec<u8>> {
        self.ctx.ensure_running()?;
        self.ctx.agent.read_stdout(container, process, max).await
    }

    /// Close a process's stdin.
    pub async fn close_stdin(&self, container: &str, process: &str) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx.agent.close_stdin(container, process).await
    }

    /// Write a file into a container.
    ///
    /// # Errors
    /// [`CoreError::Spec`] if `path` is empty or the container does not
    /// exist.
    pub async fn write_file(&self, container: &str, path: &str, data: &[u8]) -> Result<()> {
        self.check_file_target(container, path)?;
        tracing::debug!(vm_id = %self.id(), container_id = %container, path, bytes = data.len(), "writing file");
        self.ctx.agent.write_file(container, path, data).await
    }

    /// Read a file from a container.
    ///
    /// # Errors
    /// [`CoreError::Spec`] if `path` is empty or the container does not
    /// exist.
    pub async fn read_file(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        self.check_file_target(container, path)?;
        let data = self.ctx.agent.read_file(container, path).await?;
        tracing::debug!(vm_id = %self.id(), container_id = %container, path, bytes = data.len(), "file read");
        Ok(data)
    }

    fn check_file_target(&self, container: &str, path: &str) -> Result<()> {
        self.ctx.ensure_running()?;
        if path.is_empty() {
            return Err(CoreError::spec("file path is required"));
        }
        if self.ctx.container_state(container).is_none() {
            return Err(CoreError::spec(format!("container {container} not found")));
        }
        Ok(())
    }

    /// Resource usage as reported by the driver.
    ///
    /// # Errors
    /// - [`CoreError::NotReady`] if the VM is not running
    /// - [`CoreError::Vm`] if the driver cannot report usage
    pub fn stats(&self) -> Result<VmStats> {
        self.ctx.ensure_running()?;
        self.ctx.driver.stats().map_err(|e| {
            tracing::warn!(vm_id = %self.id(), error = %e, "failed to get vm stats");
            CoreError::Vm(e)
        })
    }

    /// Bring hot-added CPUs and memory online in the guest.
    pub async fn online_cpu_mem(&self) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx.agent.online_cpu_mem().await
    }
}
