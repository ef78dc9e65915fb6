//! The tracker: one control loop serializing every registry mutation.
//!
//! ```text
//!  TrackerHandle ──commands──▶ ┌──────────────┐ ◀──inbox── launch / stop tasks
//!                              │ control loop │ ◀──inbox── channel readers
//!  snapshots ◀──watch───────── │  registry    │ ◀──inbox── audit task
//!  events    ◀──broadcast───── │  channels    │
//!                              └──────────────┘
//! ```
//!
//! Execution service calls and channel I/O run in spawned tasks and report
//! back through the inbox; only the loop touches the registry or the channel
//! map. Events from one channel reach the loop in transport order.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tether_core::{
    store, ApplicationId, ChannelState, ProcessHandle, ProcessId, RegistrySnapshot, StopCause,
    TrackerError,
};

use crate::channel::{classify, terminal_error, ChannelEvent, ChannelManager, Signal, StatusConnector};
use crate::error::ExecutionError;
use crate::execution::{ExecutionService, ProcessStatus};
use crate::registry::ProcessRegistry;

const EVENT_BUFFER: usize = 256;

/// Notifications for subscribers (UI layers, the daemon socket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    Started {
        application_id: ApplicationId,
        process_id: ProcessId,
    },
    Stopped {
        application_id: ApplicationId,
        process_id: ProcessId,
        cause: StopCause,
    },
    ChannelStateChanged {
        application_id: ApplicationId,
        process_id: ProcessId,
        state: ChannelState,
    },
    /// An opaque status channel payload, forwarded as received.
    Output {
        application_id: ApplicationId,
        process_id: ProcessId,
        payload: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct TrackerOptions {
    /// Periodic liveness audit against the execution service; off when `None`.
    pub audit_interval: Option<Duration>,
}

/// Requests from handles.
pub(crate) enum Command {
    Start {
        application_id: ApplicationId,
        respond_to: oneshot::Sender<Result<ProcessHandle, TrackerError>>,
    },
    Stop {
        application_id: ApplicationId,
        respond_to: oneshot::Sender<Result<(), TrackerError>>,
    },
    OpenChannel {
        process_id: ProcessId,
        application_id: ApplicationId,
    },
    ListChannels {
        respond_to: oneshot::Sender<Vec<(ProcessId, ApplicationId)>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Continuations posted back by tasks the loop spawned.
pub(crate) enum Inbound {
    LaunchCompleted {
        application_id: ApplicationId,
        result: Result<ProcessId, ExecutionError>,
        respond_to: oneshot::Sender<Result<ProcessHandle, TrackerError>>,
    },
    StopCompleted {
        application_id: ApplicationId,
        result: Result<(), ExecutionError>,
        respond_to: oneshot::Sender<Result<(), TrackerError>>,
    },
    Channel {
        process_id: ProcessId,
        generation: u64,
        event: ChannelEvent,
    },
    AuditCompleted {
        results: Vec<(ApplicationId, ProcessId, Result<ProcessStatus, ExecutionError>)>,
    },
}

/// Cloneable entry point to a running tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Arc<RegistrySnapshot>>,
    events: broadcast::Sender<TrackerEvent>,
}

impl TrackerHandle {
    /// Launch `application_id` and start tracking it.
    pub async fn start(&self, application_id: ApplicationId) -> Result<ProcessHandle, TrackerError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Start {
            application_id,
            respond_to,
        })?;
        response.await.map_err(|_| TrackerError::TrackerUnavailable)?
    }

    /// Stop `application_id` through the execution service and stop tracking it.
    pub async fn stop(&self, application_id: ApplicationId) -> Result<(), TrackerError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Stop {
            application_id,
            respond_to,
        })?;
        response.await.map_err(|_| TrackerError::TrackerUnavailable)?
    }

    /// Ask the channel manager to open a channel; a no-op if one exists.
    pub fn open_channel(
        &self,
        process_id: ProcessId,
        application_id: ApplicationId,
    ) -> Result<(), TrackerError> {
        self.send(Command::OpenChannel {
            process_id,
            application_id,
        })
    }

    /// Open channels as `(process_id, application_id)`, sorted.
    pub async fn channels(&self) -> Result<Vec<(ProcessId, ApplicationId)>, TrackerError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::ListChannels { respond_to })?;
        response.await.map_err(|_| TrackerError::TrackerUnavailable)
    }

    /// Latest registry snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshots.borrow().clone()
    }

    /// A receiver that wakes on every registry change.
    pub fn watch(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Close every channel and stop the control loop. Persisted state is kept.
    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        let (respond_to, response) = oneshot::channel();
        self.send(Command::Shutdown { respond_to })?;
        response.await.map_err(|_| TrackerError::TrackerUnavailable)
    }

    fn send(&self, command: Command) -> Result<(), TrackerError> {
        self.commands
            .send(command)
            .map_err(|_| TrackerError::TrackerUnavailable)
    }
}

/// Reconcile from the store under `home`, then run the control loop.
///
/// Must be called inside a tokio runtime. Reconciliation finishes before this
/// returns, so the first command a caller sends already sees restored state.
pub fn spawn(
    home: PathBuf,
    options: TrackerOptions,
    service: Arc<dyn ExecutionService>,
    connector: Arc<dyn StatusConnector>,
) -> (TrackerHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let persisted = match store::load_at(&home) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(error = %err, "cannot read persisted process map; starting empty");
            Default::default()
        }
    };

    let (registry, snapshots) = ProcessRegistry::new(home);
    let mut control = ControlLoop {
        registry,
        channels: ChannelManager::new(connector, inbox_tx.clone()),
        service,
        pending_launches: HashSet::new(),
        inbox: inbox_tx,
        events: events.clone(),
        audit_in_flight: false,
    };
    for (process_id, application_id) in control.registry.reconcile(persisted) {
        control.claim_channel(process_id, application_id);
    }

    let task = tokio::spawn(control.run(commands_rx, inbox_rx, options.audit_interval));
    let handle = TrackerHandle {
        commands: commands_tx,
        snapshots,
        events,
    };
    (handle, task)
}

pub(crate) struct ControlLoop {
    pub(crate) registry: ProcessRegistry,
    pub(crate) channels: ChannelManager,
    pub(crate) service: Arc<dyn ExecutionService>,
    /// Applications with a launch request in flight.
    pub(crate) pending_launches: HashSet<ApplicationId>,
    pub(crate) inbox: mpsc::UnboundedSender<Inbound>,
    pub(crate) events: broadcast::Sender<TrackerEvent>,
    audit_in_flight: bool,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
        audit_interval: Option<Duration>,
    ) {
        let mut audit = audit_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        if let Some(interval) = audit.as_mut() {
            interval.tick().await; // consume the immediate first tick
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    // `None`: every handle is gone.
                    let Some(command) = command else { break };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(message) = inbox.recv() => self.handle_inbound(message),
                _ = tick(&mut audit) => self.begin_audit(),
            }
        }

        self.channels.close_all();
        tracing::info!("tracker control loop stopped");
    }

    /// Returns `false` once the loop should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start {
                application_id,
                respond_to,
            } => self.begin_start(application_id, respond_to),
            Command::Stop {
                application_id,
                respond_to,
            } => self.begin_stop(application_id, respond_to),
            Command::OpenChannel {
                process_id,
                application_id,
            } => {
                self.channels.open(process_id, application_id);
            }
            Command::ListChannels { respond_to } => {
                let _ = respond_to.send(self.channels.list());
            }
            Command::Shutdown { respond_to } => {
                self.channels.close_all();
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::LaunchCompleted {
                application_id,
                result,
                respond_to,
            } => self.finish_start(application_id, result, respond_to),
            Inbound::StopCompleted {
                application_id,
                result,
                respond_to,
            } => self.finish_stop(application_id, result, respond_to),
            Inbound::Channel {
                process_id,
                generation,
                event,
            } => self.on_channel_event(process_id, generation, event),
            Inbound::AuditCompleted { results } => self.finish_audit(results),
        }
    }

    fn on_channel_event(&mut self, process_id: ProcessId, generation: u64, event: ChannelEvent) {
        let Some(application_id) = self.channels.owner(&process_id, generation).cloned() else {
            tracing::debug!(process_id = %process_id, "dropping event from retired channel");
            return;
        };

        if let Some(error) = terminal_error(&event) {
            tracing::info!(
                application_id = %application_id,
                process_id = %process_id,
                error = %error,
                "status channel failed; treating process as stopped",
            );
        }

        match classify(event) {
            Signal::Opened => {
                tracing::debug!(process_id = %process_id, "status channel open");
                self.update_channel_state(&application_id, &process_id, ChannelState::Open);
            }
            Signal::Passthrough(payload) => {
                self.registry.touch(&application_id, &process_id);
                self.emit(TrackerEvent::Output {
                    application_id,
                    process_id,
                    payload,
                });
            }
            Signal::Terminal(cause) => {
                self.channels.retire(&process_id, generation);
                if matches!(cause, StopCause::TransportError | StopCause::AbnormalClose) {
                    self.update_channel_state(&application_id, &process_id, ChannelState::Errored);
                }
                self.forget(&application_id, &process_id, cause);
            }
            Signal::ClosedNormally { code, reason } => {
                self.channels.retire(&process_id, generation);
                tracing::info!(
                    application_id = %application_id,
                    process_id = %process_id,
                    code = ?code,
                    reason = %reason,
                    "status channel closed; process left tracked",
                );
                self.update_channel_state(&application_id, &process_id, ChannelState::Closed);
            }
        }
    }

    /// Open the channel for `process_id` on behalf of `application_id`.
    ///
    /// A process id has a single owner. Another application still holding it
    /// is untracked first, so its handle cannot outlive the channel.
    pub(crate) fn claim_channel(&mut self, process_id: ProcessId, application_id: ApplicationId) {
        let previous = self
            .channels
            .holder(&process_id)
            .filter(|holder| **holder != application_id)
            .cloned();
        if let Some(previous) = previous {
            tracing::warn!(
                process_id = %process_id,
                previous = %previous,
                application_id = %application_id,
                "process id changed owner",
            );
            self.forget(&previous, &process_id, StopCause::Replaced);
        }
        self.channels.open(process_id, application_id);
    }

    /// Drop `application_id` if it still tracks `process_id`; the second of
    /// two racing removals finds nothing and does nothing. The channel is
    /// closed only when `application_id` holds it.
    pub(crate) fn forget(
        &mut self,
        application_id: &ApplicationId,
        process_id: &ProcessId,
        cause: StopCause,
    ) {
        if self.channels.holder(process_id) == Some(application_id) {
            self.channels.close(process_id);
        }
        if self
            .registry
            .remove_if_owned(application_id, process_id)
            .is_none()
        {
            return;
        }
        tracing::info!(
            application_id = %application_id,
            process_id = %process_id,
            cause = ?cause,
            "process no longer tracked",
        );
        self.emit(TrackerEvent::Stopped {
            application_id: application_id.clone(),
            process_id: process_id.clone(),
            cause,
        });
    }

    fn update_channel_state(
        &mut self,
        application_id: &ApplicationId,
        process_id: &ProcessId,
        state: ChannelState,
    ) {
        if self
            .registry
            .set_channel_state(application_id, process_id, state)
        {
            self.emit(TrackerEvent::ChannelStateChanged {
                application_id: application_id.clone(),
                process_id: process_id.clone(),
                state,
            });
        }
    }

    fn begin_audit(&mut self) {
        if self.audit_in_flight || self.registry.is_empty() {
            return;
        }
        self.audit_in_flight = true;

        let tracked = self.registry.tracked();
        let service = self.service.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(tracked.len());
            for (application_id, process_id) in tracked {
                let status = service.status(&application_id).await;
                results.push((application_id, process_id, status));
            }
            let _ = inbox.send(Inbound::AuditCompleted { results });
        });
    }

    fn finish_audit(
        &mut self,
        results: Vec<(ApplicationId, ProcessId, Result<ProcessStatus, ExecutionError>)>,
    ) {
        self.audit_in_flight = false;
        for (application_id, process_id, status) in results {
            match status {
                Ok(status) if status.is_gone() => {
                    self.forget(&application_id, &process_id, StopCause::Audit);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(
                    application_id = %application_id,
                    error = %err,
                    "liveness audit could not reach execution service",
                ),
            }
        }
    }

    pub(crate) fn emit(&self, event: TrackerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn tick(audit: &mut Option<tokio::time::Interval>) {
    match audit {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
