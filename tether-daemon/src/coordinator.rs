//! Launch coordination: start and stop requests against the execution service.
//!
//! Each request is split in two halves that both run on the control loop: the
//! `begin_*` half validates and spawns the service call, the `finish_*` half
//! applies the outcome when the call reports back. Nothing blocks the loop
//! while the service is working.

use tokio::sync::oneshot;

use tether_core::{ApplicationId, ProcessHandle, ProcessId, StopCause, TrackerError};

use crate::error::ExecutionError;
use crate::tracker::{ControlLoop, Inbound, TrackerEvent};

impl ControlLoop {
    pub(crate) fn begin_start(
        &mut self,
        application_id: ApplicationId,
        respond_to: oneshot::Sender<Result<ProcessHandle, TrackerError>>,
    ) {
        if self.registry.contains(&application_id)
            || self.pending_launches.contains(&application_id)
        {
            tracing::warn!(application_id = %application_id, "rejecting duplicate launch");
            let _ = respond_to.send(Err(TrackerError::DuplicateLaunch(application_id)));
            return;
        }

        self.pending_launches.insert(application_id.clone());
        let service = self.service.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = service.launch(&application_id).await;
            let _ = inbox.send(Inbound::LaunchCompleted {
                application_id,
                result,
                respond_to,
            });
        });
    }

    pub(crate) fn finish_start(
        &mut self,
        application_id: ApplicationId,
        result: Result<ProcessId, ExecutionError>,
        respond_to: oneshot::Sender<Result<ProcessHandle, TrackerError>>,
    ) {
        self.pending_launches.remove(&application_id);

        let process_id = match result {
            Ok(process_id) => process_id,
            Err(err) => {
                tracing::error!(application_id = %application_id, error = %err, "launch failed");
                let _ = respond_to.send(Err(TrackerError::LaunchFailed {
                    application_id,
                    message: err.to_string(),
                }));
                return;
            }
        };

        let handle = ProcessHandle::connecting(application_id.clone(), process_id.clone());
        // Last writer wins on the application key: a handle that appeared while
        // the launch was in flight is replaced, never duplicated.
        if let Some(previous) = self.registry.insert(handle.clone()) {
            if previous.process_id != process_id {
                if self.channels.holder(&previous.process_id) == Some(&application_id) {
                    self.channels.close(&previous.process_id);
                }
                self.emit(TrackerEvent::Stopped {
                    application_id: application_id.clone(),
                    process_id: previous.process_id,
                    cause: StopCause::Replaced,
                });
            }
        }
        self.claim_channel(process_id.clone(), application_id.clone());

        tracing::info!(
            application_id = %application_id,
            process_id = %process_id,
            "process launched",
        );
        self.emit(TrackerEvent::Started {
            application_id,
            process_id,
        });
        let _ = respond_to.send(Ok(handle));
    }

    pub(crate) fn begin_stop(
        &mut self,
        application_id: ApplicationId,
        respond_to: oneshot::Sender<Result<(), TrackerError>>,
    ) {
        let service = self.service.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = service.terminate(&application_id).await;
            let _ = inbox.send(Inbound::StopCompleted {
                application_id,
                result,
                respond_to,
            });
        });
    }

    pub(crate) fn finish_stop(
        &mut self,
        application_id: ApplicationId,
        result: Result<(), ExecutionError>,
        respond_to: oneshot::Sender<Result<(), TrackerError>>,
    ) {
        if let Err(err) = result {
            tracing::error!(application_id = %application_id, error = %err, "stop failed");
            let _ = respond_to.send(Err(TrackerError::StopFailed {
                application_id,
                message: err.to_string(),
            }));
            return;
        }

        match self.registry.get(&application_id).map(|h| h.process_id.clone()) {
            Some(process_id) => self.forget(&application_id, &process_id, StopCause::Requested),
            None => tracing::debug!(
                application_id = %application_id,
                "stop succeeded for an untracked application",
            ),
        }
        let _ = respond_to.send(Ok(()));
    }
}
