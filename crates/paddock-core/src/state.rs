//! VM lifecycle state machine.
//!
//! One [`Dispatcher`] task per VM consumes the event queue in order and
//! owns the lifecycle fields. Handlers never wait for other events; work
//! that has to wait runs in spawned tasks that post new events.
//!
//! ```text
//!            Shutdown / InitFailed
//!   Running ──────────────────────▶ Terminating
//!      │                              │  VmExit / VmKilled
//!      │ Release / VmExit /           │  VmTimeout (kill)
//!      │ VmKilled / Interrupted /     ▼
//!      └ VmStartFailed ─────────▶   None
//! ```

use crate::context::VmContext;
use crate::error::CoreError;
use crate::types::ResponseCode;
use paddock_vm::{post, EventReceiver, VmEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    /// Accepting commands
    Running,
    /// Shutting down, waiting for the hypervisor to exit
    Terminating,
    /// Gone. Terminal.
    None,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Terminating => write!(f, "TERMINATING"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Owner of a VM's lifecycle state.
pub(crate) struct Dispatcher {
    ctx: Arc<VmContext>,
    queue: EventReceiver,
    state: VmState,
    published: watch::Sender<VmState>,
    watchdog: Option<JoinHandle<()>>,
    shutdown_reported: bool,
    /// Left running for another owner; keep its directories
    released: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        ctx: Arc<VmContext>,
        queue: EventReceiver,
        published: watch::Sender<VmState>,
    ) -> Self {
        Self {
            ctx,
            queue,
            state: VmState::Running,
            published,
            watchdog: None,
            shutdown_reported: false,
            released: false,
        }
    }

    /// Consume events until the VM reaches `None`, then close it.
    pub(crate) async fn run(mut self) {
        while let Some(event) = self.queue.recv().await {
            let start = Instant::now();
            let kind = event.kind();
            match self.state {
                VmState::Running => self.on_running(event),
                VmState::Terminating => self.on_terminating(event),
                VmState::None => break,
            }
            tracing::trace!(
                vm_id = %self.ctx.id,
                event = kind,
                state = %self.state,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "event handled"
            );
            if self.state == VmState::None {
                break;
            }
        }

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        self.ctx.close(!self.released).await;
    }

    fn on_running(&mut self, event: VmEvent) {
        match event {
            VmEvent::Shutdown => self.begin_shutdown(),
            VmEvent::Release => {
                tracing::info!(vm_id = %self.ctx.id, "releasing vm");
                self.ctx.respond(ResponseCode::Ok, "released");
                self.ctx.retire("resources released");
                self.released = true;
                self.transition(VmState::None);
            }
            VmEvent::VmExit | VmEvent::VmKilled { .. } => self.vm_gone(VM_GONE),
            VmEvent::Interrupted { reason } => {
                tracing::error!(vm_id = %self.ctx.id, %reason, "connection to vm interrupted");
                let cause = CoreError::Interrupted(reason).to_string();
                self.ctx.respond(ResponseCode::Failed, &cause);
                self.ctx.driver.shutdown(&self.ctx.events);
                self.vm_gone(&cause);
            }
            VmEvent::InitFailed { reason } => {
                tracing::error!(vm_id = %self.ctx.id, %reason, "guest init failed");
                self.ctx.respond(ResponseCode::Failed, reason);
                self.begin_shutdown();
            }
            VmEvent::VmStartFailed { message } => {
                tracing::error!(vm_id = %self.ctx.id, %message, "vm failed to start");
                self.ctx.respond(ResponseCode::Failed, message);
                self.vm_gone(VM_GONE);
            }
            VmEvent::InitConnected => {
                tracing::info!(vm_id = %self.ctx.id, "guest agent connected");
                self.ctx.respond(ResponseCode::VmRunning, "");
            }
            VmEvent::Pause { pause } => {
                tracing::debug!(vm_id = %self.ctx.id, pause, "pause requested");
                self.ctx.driver.pause(pause, &self.ctx.events);
            }
            VmEvent::PauseResult { pause, cause } => self.pause_result(pause, cause),
            VmEvent::DeviceFailed {
                session: Some(session),
                reason,
            } if is_lifecycle_session(&session) => self.lifecycle_session_failed(*session, reason),
            event @ (VmEvent::BlockInserted { .. }
            | VmEvent::BlockRemoved { .. }
            | VmEvent::NetDevInserted { .. }
            | VmEvent::NetDevRemoved { .. }
            | VmEvent::DeviceFailed { .. }) => self.ctx.route_device_event(event),
            event @ VmEvent::VmTimeout => self.unexpected(&event),
        }
    }

    fn on_terminating(&mut self, event: VmEvent) {
        match event {
            VmEvent::VmExit | VmEvent::VmKilled { .. } => {
                if let Some(watchdog) = self.watchdog.take() {
                    watchdog.abort();
                }
                self.vm_gone(VM_GONE);
            }
            VmEvent::VmTimeout => {
                tracing::warn!(
                    vm_id = %self.ctx.id,
                    timeout_ms = self.ctx.config.shutdown_timeout.as_millis() as u64,
                    "shutdown timed out, killing vm"
                );
                self.watchdog = None;
                self.ctx.driver.kill(&self.ctx.events);
                self.vm_gone(VM_GONE);
            }
            VmEvent::Interrupted { reason } => {
                // the watchdog still ends this state
                tracing::warn!(vm_id = %self.ctx.id, %reason, "connection lost while terminating");
            }
            event @ (VmEvent::BlockInserted { .. }
            | VmEvent::BlockRemoved { .. }
            | VmEvent::NetDevInserted { .. }
            | VmEvent::NetDevRemoved { .. }
            | VmEvent::DeviceFailed { .. }) => self.ctx.route_device_event(event),
            event @ (VmEvent::Shutdown
            | VmEvent::Release
            | VmEvent::Pause { .. }
            | VmEvent::InitConnected
            | VmEvent::InitFailed { .. }
            | VmEvent::VmStartFailed { .. }
            | VmEvent::PauseResult { .. }) => self.unexpected(&event),
        }
    }

    /// Stop the sandbox, power off and give the guest until the watchdog
    /// fires.
    fn begin_shutdown(&mut self) {
        tracing::info!(vm_id = %self.ctx.id, "shutting down vm");
        let ctx = Arc::clone(&self.ctx);
        let sandbox_running = ctx.lock().sandbox_running;
        tokio::spawn(async move {
            if sandbox_running {
                if let Err(e) = ctx.agent.destroy_sandbox().await {
                    tracing::warn!(vm_id = %ctx.id, error = %e, "failed to destroy sandbox");
                }
            }
            ctx.driver.shutdown(&ctx.events);
        });

        let events = self.ctx.events.clone();
        let timeout = self.ctx.config.shutdown_timeout;
        self.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            post(&events, VmEvent::VmTimeout);
        }));
        self.transition(VmState::Terminating);
    }

    /// Report the VM gone and fail whatever still waits on it with `cause`.
    fn vm_gone(&mut self, cause: &str) {
        if !self.shutdown_reported {
            self.shutdown_reported = true;
            self.ctx.respond(ResponseCode::VmShutdown, "");
        }
        self.ctx.retire(cause);
        self.transition(VmState::None);
    }

    /// A pause or kill whose driver session gave up.
    fn lifecycle_session_failed(&mut self, session: VmEvent, reason: String) {
        let cause = CoreError::DriverSession(reason).to_string();
        match session {
            VmEvent::PauseResult { pause, .. } => self.pause_result(pause, Some(cause)),
            VmEvent::VmKilled { .. } => {
                tracing::error!(vm_id = %self.ctx.id, %cause, "kill failed, giving the vm up");
                self.ctx.respond(ResponseCode::Failed, &cause);
                self.vm_gone(&cause);
            }
            other => {
                tracing::warn!(vm_id = %self.ctx.id, session = %other, %cause, "unhandled session failure");
            }
        }
    }

    fn pause_result(&mut self, pause: bool, cause: Option<String>) {
        match &cause {
            None => {
                self.ctx.set_paused(pause);
                tracing::info!(vm_id = %self.ctx.id, pause, "pause state changed");
            }
            Some(cause) => {
                tracing::warn!(vm_id = %self.ctx.id, pause, %cause, "pause failed");
            }
        }
        let response = crate::types::VmResponse::new(
            &self.ctx.id,
            ResponseCode::PauseResult,
            cause.unwrap_or_default(),
        )
        .with_data(json!({ "pause": pause }));
        self.ctx.send_response(response);
    }

    fn unexpected(&self, event: &VmEvent) {
        tracing::warn!(
            vm_id = %self.ctx.id,
            event = %event,
            state = %self.state,
            "unexpected event"
        );
        if event.is_command() {
            self.ctx.respond(
                ResponseCode::Unexpected,
                format!("{} not accepted in state {}", event.kind(), self.state),
            );
        }
    }

    fn transition(&mut self, next: VmState) {
        tracing::info!(vm_id = %self.ctx.id, from = %self.state, to = %next, "vm state changed");
        self.state = next;
        self.published.send_replace(next);
    }
}

const VM_GONE: &str = "vm shut down";

/// Failed sessions that belong to the lifecycle rather than to a device.
fn is_lifecycle_session(session: &VmEvent) -> bool {
    matches!(
        session,
        VmEvent::PauseResult { .. } | VmEvent::VmKilled { .. }
    )
}
