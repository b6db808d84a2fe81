//! Driver command session protocol.
//!
//! A hypervisor exposes one control channel that can only carry one
//! outstanding request at a time, while hotplug requests arrive concurrently.
//! Backends therefore funnel their work through a single runner task:
//!
//! ```text
//!   submit(S1) ─┐                  ┌──────────────────────────┐
//!   submit(S2) ─┼─▶ FIFO queue ──▶ │  runner task             │──▶ CommandChannel
//!   submit(S3) ─┘                  │  - handshake (timeout)   │
//!                                  │  - one session in flight │
//!                                  │  - bounded retries       │
//!                                  └────────────┬─────────────┘
//!                                               │ callback / DeviceFailed /
//!                                               ▼ InitFailed / Interrupted / VmExit
//!                                         VM event queue
//! ```
//!
//! A session is an ordered list of commands plus, usually, one callback
//! event. The callback is posted after the last command succeeds. A command
//! that keeps failing after `max_attempts` turns the callback into
//! [`VmEvent::DeviceFailed`]; a session without a callback only logs it. A broken channel posts
//! [`VmEvent::Interrupted`] and stops the runner; queued sessions are dropped.

use crate::error::{Result, VmError};
use crate::event::{post, EventSender, VmEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of attempts per command.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// One low-level command sent over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverCommand {
    /// Command name
    pub execute: String,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl DriverCommand {
    /// Create a command without arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: Value::Null,
        }
    }

    /// Create a command with arguments.
    pub fn with_arguments(execute: impl Into<String>, arguments: Value) -> Self {
        Self {
            execute: execute.into(),
            arguments,
        }
    }
}

/// An ordered batch of commands and the event to post once they all succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSession {
    pub commands: Vec<DriverCommand>,
    pub callback: Option<VmEvent>,
}

impl DriverSession {
    pub fn new(commands: Vec<DriverCommand>, callback: VmEvent) -> Self {
        Self {
            commands,
            callback: Some(callback),
        }
    }

    /// A session whose outcome arrives some other way, e.g. as a
    /// [`ChannelMessage::Shutdown`].
    pub fn detached(commands: Vec<DriverCommand>) -> Self {
        Self {
            commands,
            callback: None,
        }
    }

    /// Kind of the callback, for logs.
    pub fn label(&self) -> &'static str {
        self.callback.as_ref().map_or("detached", VmEvent::kind)
    }
}

/// A message read from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Successful reply to the in-flight command.
    Return(Value),
    /// The in-flight command failed. Retried by the runner.
    Error(String),
    /// The hypervisor announced that the guest powered off.
    Shutdown,
    /// Any other asynchronous notification.
    Event { name: String, data: Value },
}

/// Backend-specific framing of the control channel.
///
/// `recv` must be cancel-safe: the runner polls it alongside its request
/// queue while idle and drops the future when a new session arrives.
#[async_trait]
pub trait CommandChannel: Send + 'static {
    /// Negotiate the channel after connecting.
    async fn handshake(&mut self) -> Result<()>;

    /// Write one command.
    async fn send(&mut self, command: &DriverCommand) -> Result<()>;

    /// Read the next message.
    ///
    /// # Errors
    /// Any error is treated as a broken channel.
    async fn recv(&mut self) -> Result<ChannelMessage>;
}

/// Runner tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long the handshake may take before `InitFailed` is posted.
    pub handshake_timeout: Duration,
    /// Attempts per command, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

enum Request {
    Run(DriverSession),
    Quit,
}

/// Handle to a running session runner.
///
/// Dropping the handle closes the request queue; the runner finishes the
/// session in flight and exits.
#[derive(Debug)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Run(session) => write!(f, "Run({})", session.label()),
            Request::Quit => f.write_str("Quit"),
        }
    }
}

impl SessionHandle {
    /// Spawn a runner owning `channel`, reporting into `events`.
    pub fn spawn<C: CommandChannel>(
        channel: C,
        events: EventSender,
        config: SessionConfig,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let runner = Runner {
            channel,
            events,
            requests: rx,
            config,
        };
        let task = tokio::spawn(runner.run());
        Self { requests, task }
    }

    /// Queue a session behind all previously submitted ones.
    ///
    /// # Errors
    /// Returns [`VmError::SessionClosed`] if the runner has stopped.
    pub fn submit(&self, session: DriverSession) -> Result<()> {
        self.requests
            .send(Request::Run(session))
            .map_err(|_| VmError::SessionClosed)
    }

    /// Ask the runner to stop after the session in flight.
    pub fn quit(&self) {
        let _ = self.requests.send(Request::Quit);
    }

    /// Whether the runner task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the runner immediately, abandoning any session in flight.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Outcome of a single command exchange.
enum Exchange {
    Done,
    Failed(String),
    GuestExited,
}

/// Why the runner stopped processing sessions.
enum Halt {
    Quit,
    GuestExited,
    Broken(VmError),
}

struct Runner<C> {
    channel: C,
    events: EventSender,
    requests: mpsc::UnboundedReceiver<Request>,
    config: SessionConfig,
}

impl<C: CommandChannel> Runner<C> {
    async fn run(mut self) {
        let mut buffered = VecDeque::new();

        match self.handshake(&mut buffered).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("session runner quit during handshake");
                return;
            }
            Err(reason) => {
                tracing::error!(%reason, "control channel handshake failed");
                post(&self.events, VmEvent::InitFailed { reason });
                return;
            }
        }

        tracing::debug!(buffered = buffered.len(), "control channel ready");
        while let Some(session) = buffered.pop_front() {
            if let Err(halt) = self.run_session(session).await {
                self.halt(halt);
                return;
            }
        }

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Run(session)) => {
                        if let Err(halt) = self.run_session(session).await {
                            self.halt(halt);
                            return;
                        }
                    }
                    Some(Request::Quit) | None => {
                        self.halt(Halt::Quit);
                        return;
                    }
                },
                message = self.channel.recv() => match message {
                    Ok(ChannelMessage::Shutdown) => {
                        self.halt(Halt::GuestExited);
                        return;
                    }
                    Ok(ChannelMessage::Event { name, .. }) => {
                        tracing::debug!(event = %name, "unsolicited control channel event");
                    }
                    Ok(other) => {
                        tracing::warn!(message = ?other, "reply received with no command in flight");
                    }
                    Err(e) => {
                        self.halt(Halt::Broken(e));
                        return;
                    }
                },
            }
        }
    }

    /// Run the handshake, buffering sessions submitted meanwhile.
    ///
    /// Returns `Ok(false)` if the runner was asked to quit first.
    async fn handshake(
        &mut self,
        buffered: &mut VecDeque<DriverSession>,
    ) -> std::result::Result<bool, String> {
        let timeout = self.config.handshake_timeout;
        let handshake = tokio::time::timeout(timeout, self.channel.handshake());
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                biased;

                outcome = &mut handshake => {
                    return match outcome {
                        Ok(Ok(())) => Ok(true),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("handshake timed out after {timeout:?}")),
                    };
                }
                request = self.requests.recv() => match request {
                    Some(Request::Run(session)) => {
                        tracing::trace!(callback = session.label(), "buffering session until handshake completes");
                        buffered.push_back(session);
                    }
                    Some(Request::Quit) | None => return Ok(false),
                },
            }
        }
    }

    /// Run every command of one session, then post its callback.
    async fn run_session(&mut self, session: DriverSession) -> std::result::Result<(), Halt> {
        let start = std::time::Instant::now();
        tracing::debug!(
            callback = session.label(),
            commands = session.commands.len(),
            "running driver session"
        );

        for command in &session.commands {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.exchange(command).await? {
                    Exchange::Done => break,
                    Exchange::GuestExited => return Err(Halt::GuestExited),
                    Exchange::Failed(reason) if attempt < self.config.max_attempts => {
                        tracing::warn!(
                            command = %command.execute,
                            attempt,
                            %reason,
                            "driver command failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                    Exchange::Failed(reason) => {
                        tracing::error!(
                            command = %command.execute,
                            attempts = attempt,
                            %reason,
                            "driver session failed"
                        );
                        if let Some(callback) = session.callback {
                            post(&self.events, callback.into_device_failure(reason));
                        }
                        return Ok(());
                    }
                }
            }
        }

        tracing::debug!(
            callback = session.label(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "driver session finished"
        );
        if let Some(callback) = session.callback {
            post(&self.events, callback);
        }
        Ok(())
    }

    async fn exchange(&mut self, command: &DriverCommand) -> std::result::Result<Exchange, Halt> {
        self.channel.send(command).await.map_err(Halt::Broken)?;
        loop {
            match self.channel.recv().await.map_err(Halt::Broken)? {
                ChannelMessage::Return(_) => return Ok(Exchange::Done),
                ChannelMessage::Error(reason) => return Ok(Exchange::Failed(reason)),
                ChannelMessage::Shutdown => return Ok(Exchange::GuestExited),
                ChannelMessage::Event { name, .. } => {
                    tracing::debug!(event = %name, command = %command.execute, "event while awaiting reply");
                }
            }
        }
    }

    fn halt(&self, halt: Halt) {
        match halt {
            Halt::Quit => tracing::debug!("session runner stopped"),
            Halt::GuestExited => {
                tracing::info!("hypervisor reported guest shutdown");
                post(&self.events, VmEvent::VmExit);
            }
            Halt::Broken(e) => {
                tracing::error!(error = %e, "control channel broken");
                post(
                    &self.events,
                    VmEvent::Interrupted {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }
}
