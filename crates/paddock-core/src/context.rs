//! Per-VM context shared by the dispatcher, the resource operations and the
//! background tasks they spawn.

use crate::agent::SandboxAgent;
use crate::config::ContextConfig;
use crate::error::{CoreError, Result};
use crate::resource::{ContainerState, HardwareStatus, InterfaceRecord, Resources};
use crate::state::{Dispatcher, VmState};
use crate::types::{report, ResponseCode, ResultSender, VmResponse, VmResult};
use paddock_vm::{event_queue, DriverContext, EventSender, VmEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

/// Receiving side of a VM's response stream.
pub(crate) type ResponseReceiver = mpsc::UnboundedReceiver<VmResponse>;

/// Runtime state of one VM.
///
/// Resource state lives behind a single lock; the lifecycle state is owned
/// by the dispatcher task and only published here.
pub struct VmContext {
    pub(crate) id: String,
    pub(crate) config: ContextConfig,
    pub(crate) driver: Arc<dyn DriverContext>,
    pub(crate) agent: Arc<dyn SandboxAgent>,
    pub(crate) events: EventSender,
    /// Whether the driver can hot-plug disks and NICs
    hotplug: bool,
    responses: Mutex<Option<mpsc::UnboundedSender<VmResponse>>>,
    resources: Mutex<Resources>,
    state: watch::Receiver<VmState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl VmContext {
    /// Build a context around existing resources and start its dispatcher
    /// in `Running`.
    pub(crate) fn start(
        id: String,
        config: ContextConfig,
        driver: Arc<dyn DriverContext>,
        agent: Arc<dyn SandboxAgent>,
        hotplug: bool,
        resources: Resources,
    ) -> (Arc<Self>, ResponseReceiver) {
        let (events, queue) = event_queue();
        let (responses, response_rx) = mpsc::unbounded_channel();
        let (published, state) = watch::channel(VmState::Running);

        let ctx = Arc::new(Self {
            id,
            config,
            driver,
            agent,
            events,
            hotplug,
            responses: Mutex::new(Some(responses)),
            resources: Mutex::new(resources),
            state,
            closed: AtomicBool::new(false),
        });

        let dispatcher = Dispatcher::new(Arc::clone(&ctx), queue, published);
        tokio::spawn(dispatcher.run());
        tracing::info!(vm_id = %ctx.id, "vm context started");
        (ctx, response_rx)
    }

    /// VM identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lifecycle state as last published by the dispatcher.
    pub fn state(&self) -> VmState {
        *self.state.borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<VmState> {
        self.state.clone()
    }

    /// Post an event onto this VM's queue.
    pub(crate) fn post(&self, event: VmEvent) -> bool {
        paddock_vm::post(&self.events, event)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state == VmState::Running {
            Ok(())
        } else {
            Err(CoreError::NotReady {
                expected: VmState::Running.to_string(),
                actual: state.to_string(),
            })
        }
    }

    /// Lock resources for a change. Fails once the VM has stopped running
    /// or its resources were retired, checked under the same lock the
    /// change is made under.
    pub(crate) fn lock_running(&self) -> Result<MutexGuard<'_, Resources>> {
        let res = self.lock();
        if res.retired {
            return Err(CoreError::NotReady {
                expected: VmState::Running.to_string(),
                actual: VmState::None.to_string(),
            });
        }
        self.ensure_running()?;
        Ok(res)
    }

    /// Fail with a spec error if the driver cannot hot-plug `what`.
    pub(crate) fn require_hotplug(&self, what: &str) -> Result<()> {
        if self.hotplug {
            Ok(())
        } else {
            Err(CoreError::spec(format!("driver cannot hot-plug {what}")))
        }
    }

    /// Tell subscribers a request was refused and hand the error back.
    pub(crate) fn rejected(&self, op: &str, err: CoreError) -> CoreError {
        let code = match &err {
            CoreError::Spec(_) => ResponseCode::BadRequest,
            CoreError::Busy(_) => ResponseCode::Busy,
            _ => return err,
        };
        tracing::debug!(vm_id = %self.id, op, error = %err, "request rejected");
        self.respond(code, format!("{op}: {err}"));
        err
    }

    /// Stream a response to every subscriber.
    pub(crate) fn respond(&self, code: ResponseCode, cause: impl Into<String>) {
        self.send_response(VmResponse::new(&self.id, code, cause));
    }

    pub(crate) fn send_response(&self, response: VmResponse) {
        let responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = responses.as_ref() {
            if tx.send(response).is_err() {
                tracing::trace!(vm_id = %self.id, "response stream closed");
            }
        }
    }

    /// Hand a hotplug completion or failure to the resource owning it.
    pub(crate) fn route_device_event(self: &Arc<Self>, event: VmEvent) {
        match event {
            VmEvent::BlockInserted {
                name,
                device_name,
                scsi_id,
                scsi_addr,
            } => self.on_block_inserted(&name, &device_name, scsi_id, &scsi_addr),
            VmEvent::BlockRemoved { name, success } => self.on_block_removed(&name, success, None),
            VmEvent::NetDevInserted {
                id, device_name, ..
            } => self.on_netdev_inserted(&id, &device_name),
            VmEvent::NetDevRemoved { id, .. } => self.on_netdev_removed(&id),
            VmEvent::DeviceFailed { session, reason } => {
                let reason = CoreError::DriverSession(reason).to_string();
                match session.map(|s| *s) {
                    Some(VmEvent::BlockInserted { name, .. }) => {
                        self.on_block_attach_failed(&name, &reason)
                    }
                    Some(VmEvent::BlockRemoved { name, .. }) => {
                        self.on_block_removed(&name, false, Some(&reason))
                    }
                    Some(VmEvent::NetDevInserted { id, .. }) => {
                        self.on_netdev_attach_failed(&id, &reason)
                    }
                    Some(VmEvent::NetDevRemoved { id, .. }) => {
                        self.on_netdev_detach_failed(&id, &reason)
                    }
                    other => {
                        tracing::warn!(vm_id = %self.id, session = ?other, %reason, "device failure without a device session");
                    }
                }
            }
            other => {
                tracing::warn!(vm_id = %self.id, event = %other, "not a device event");
            }
        }
    }

    /// Drop every resource and release everyone waiting on one.
    pub(crate) fn reclaim(&self) {
        let orphans = self.lock().reset("resources released");
        self.fail_orphans(orphans);
    }

    /// Drop every resource for good. Later changes fail with `NotReady`.
    pub(crate) fn retire(&self, reason: &str) {
        let orphans = {
            let mut res = self.lock();
            let orphans = res.reset(reason);
            res.retired = true;
            orphans
        };
        self.fail_orphans(orphans);
    }

    fn fail_orphans(&self, orphans: Vec<(ResultSender, VmResult)>) {
        if !orphans.is_empty() {
            tracing::debug!(vm_id = %self.id, count = orphans.len(), "failing pending resource operations");
        }
        for (target, result) in orphans {
            report(&target, result);
        }
    }

    /// Forget all volumes, containers and interfaces.
    ///
    /// PCI and SCSI numbering restarts; stdio attach ids keep counting.
    /// Operations still in flight are reported as failed.
    pub fn reset_resources(&self) {
        tracing::info!(vm_id = %self.id, "resetting resources");
        self.reclaim();
    }

    /// Allocate a stdio attach id.
    pub fn next_attach_id(&self) -> u64 {
        self.lock().next_attach_id()
    }

    /// Current hardware counters.
    pub fn hardware(&self) -> HardwareStatus {
        self.lock().hw
    }

    /// Whether the guest is paused.
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
    }

    /// Names of the shared volumes, sorted.
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a shared volume has finished attaching.
    pub fn volume_ready(&self, name: &str) -> Option<bool> {
        self.lock().volumes.get(name).map(|d| d.is_ready())
    }

    /// Containers observing a shared volume, sorted.
    pub fn volume_observers(&self, name: &str) -> Option<Vec<String>> {
        self.lock().volumes.get(name).map(|d| d.observer_ids())
    }

    /// Container ids with their state, sorted by id.
    pub fn containers(&self) -> Vec<(String, ContainerState)> {
        let mut containers: Vec<(String, ContainerState)> = self
            .lock()
            .containers
            .values()
            .map(|c| (c.id().to_string(), c.current_state()))
            .collect();
        containers.sort_by(|a, b| a.0.cmp(&b.0));
        containers
    }

    /// Root volume name of a container.
    pub fn container_root(&self, id: &str) -> Option<String> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.root.name().to_string())
    }

    /// Record of one interface.
    pub fn interface(&self, id: &str) -> Option<InterfaceRecord> {
        self.lock().networks.interfaces.get(id).cloned()
    }

    pub(crate) fn set_sandbox_running(&self, running: bool) {
        self.lock().sandbox_running = running;
    }

    /// Release the driver and end the response stream. With `remove_dirs`
    /// the VM's directories are removed too if they are empty. Safe to call
    /// more than once.
    pub(crate) async fn close(&self, remove_dirs: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.driver.close();
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if !remove_dirs {
            tracing::info!(vm_id = %self.id, "vm context closed, vm left running");
            return;
        }
        for dir in [self.config.share_dir(&self.id), self.config.vm_dir(&self.id)] {
            if let Err(e) = tokio::fs::remove_dir(&dir).await {
                tracing::debug!(vm_id = %self.id, dir = %dir.display(), error = %e, "directory not removed");
            }
        }
        tracing::info!(vm_id = %self.id, "vm context closed");
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
