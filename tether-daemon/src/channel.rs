//! Live status channels: one streaming connection per tracked process.
//!
//! The [`ChannelManager`] owns the `process_id → channel` map and is only
//! touched from the tracker's control loop. Each channel is a reader task that
//! pumps transport events into the loop's inbox, tagged with the channel's
//! generation so events from a channel that has since been closed or replaced
//! are recognised and dropped.
//!
//! Only one payload means anything here: the literal `stopped`. Everything
//! else is forwarded to subscribers untouched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use tether_core::{ApplicationId, ProcessId, StopCause, TrackerConfig, TrackerError};

use crate::tracker::Inbound;

/// The only payload with defined meaning on a status channel.
pub const TERMINAL_MESSAGE: &str = "stopped";

/// Close code reported when a connection drops without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Raw events a status channel produces, in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection was established.
    Opened,
    Message(String),
    TransportError(String),
    Closed { code: Option<u16>, reason: String },
}

impl ChannelEvent {
    /// No further events follow this one.
    pub fn ends_stream(&self) -> bool {
        matches!(
            self,
            ChannelEvent::TransportError(_) | ChannelEvent::Closed { .. }
        )
    }
}

/// What a [`ChannelEvent`] means for the tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Opened,
    /// Opaque payload for subscribers; not a state transition.
    Passthrough(String),
    /// The process is considered no longer running.
    Terminal(StopCause),
    /// The stream ended deliberately; the process may still be running.
    ClosedNormally { code: Option<u16>, reason: String },
}

pub fn classify(event: ChannelEvent) -> Signal {
    match event {
        ChannelEvent::Opened => Signal::Opened,
        ChannelEvent::Message(payload) if payload.trim() == TERMINAL_MESSAGE => {
            Signal::Terminal(StopCause::TerminalMessage)
        }
        ChannelEvent::Message(payload) => Signal::Passthrough(payload),
        ChannelEvent::TransportError(_) => Signal::Terminal(StopCause::TransportError),
        ChannelEvent::Closed { code, .. } if code == Some(ABNORMAL_CLOSURE) => {
            Signal::Terminal(StopCause::AbnormalClose)
        }
        ChannelEvent::Closed { code, reason } => Signal::ClosedNormally { code, reason },
    }
}

/// The error a terminal channel event stands for, for logging.
pub fn terminal_error(event: &ChannelEvent) -> Option<TrackerError> {
    match event {
        ChannelEvent::TransportError(message) => {
            Some(TrackerError::ChannelTransportError(message.clone()))
        }
        ChannelEvent::Closed { code, .. } if *code == Some(ABNORMAL_CLOSURE) => {
            Some(TrackerError::ChannelAbnormalClose { code: *code })
        }
        _ => None,
    }
}

pub type StatusStream = BoxStream<'static, ChannelEvent>;

/// Opens the status stream of one process.
///
/// The returned stream yields `Message`, `TransportError` and `Closed` events;
/// a stream that simply ends is reported by the manager as an abnormal close.
#[async_trait]
pub trait StatusConnector: Send + Sync {
    async fn connect(&self, process_id: &ProcessId) -> Result<StatusStream, String>;
}

/// [`StatusConnector`] over websockets.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: Arc<TrackerConfig>,
}

impl WebSocketConnector {
    pub fn new(config: Arc<TrackerConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StatusConnector for WebSocketConnector {
    async fn connect(&self, process_id: &ProcessId) -> Result<StatusStream, String> {
        let url = self.config.status_url(process_id);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| format!("connect {url}: {err}"))?;
        Ok(socket
            .filter_map(|message| async move { translate(message) })
            .boxed())
    }
}

fn translate(message: Result<Message, WsError>) -> Option<ChannelEvent> {
    match message {
        Ok(Message::Text(text)) => Some(ChannelEvent::Message(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => Some(ChannelEvent::Message(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Ok(Message::Close(frame)) => Some(match frame {
            Some(frame) => ChannelEvent::Closed {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.as_str().to_owned(),
            },
            None => ChannelEvent::Closed {
                code: None,
                reason: String::new(),
            },
        }),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
            Some(ChannelEvent::Closed {
                code: Some(ABNORMAL_CLOSURE),
                reason: "connection reset without closing handshake".to_string(),
            })
        }
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => None,
        Err(err) => Some(ChannelEvent::TransportError(err.to_string())),
    }
}

struct ChannelEntry {
    application_id: ApplicationId,
    generation: u64,
    reader: JoinHandle<()>,
}

/// Owns every open status channel, keyed by process id.
pub struct ChannelManager {
    connector: Arc<dyn StatusConnector>,
    inbox: mpsc::UnboundedSender<Inbound>,
    channels: HashMap<ProcessId, ChannelEntry>,
    next_generation: u64,
}

impl ChannelManager {
    pub(crate) fn new(
        connector: Arc<dyn StatusConnector>,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            connector,
            inbox,
            channels: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Start a channel for `process_id` unless one already exists.
    ///
    /// Returns `false` when the call was a no-op.
    pub fn open(&mut self, process_id: ProcessId, application_id: ApplicationId) -> bool {
        if self.channels.contains_key(&process_id) {
            tracing::debug!(process_id = %process_id, "status channel already open");
            return false;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let reader = tokio::spawn(pump(
            self.connector.clone(),
            process_id.clone(),
            generation,
            self.inbox.clone(),
        ));
        tracing::info!(
            process_id = %process_id,
            application_id = %application_id,
            "opening status channel",
        );
        self.channels.insert(
            process_id,
            ChannelEntry {
                application_id,
                generation,
                reader,
            },
        );
        true
    }

    /// Close and unregister the channel for `process_id`, if any.
    pub fn close(&mut self, process_id: &ProcessId) -> Option<ApplicationId> {
        let entry = self.channels.remove(process_id)?;
        entry.reader.abort();
        tracing::debug!(process_id = %process_id, "status channel closed");
        Some(entry.application_id)
    }

    /// The owner of `process_id`'s channel, if `generation` is still the live one.
    pub fn owner(&self, process_id: &ProcessId, generation: u64) -> Option<&ApplicationId> {
        self.channels
            .get(process_id)
            .filter(|entry| entry.generation == generation)
            .map(|entry| &entry.application_id)
    }

    /// Unregister a channel whose reader has finished on its own.
    pub fn retire(&mut self, process_id: &ProcessId, generation: u64) -> Option<ApplicationId> {
        if self.owner(process_id, generation).is_none() {
            return None;
        }
        self.close(process_id)
    }

    /// The application whose channel is open for `process_id`, whatever its generation.
    pub fn holder(&self, process_id: &ProcessId) -> Option<&ApplicationId> {
        self.channels
            .get(process_id)
            .map(|entry| &entry.application_id)
    }

    /// `(process_id, application_id)` for every open channel, sorted.
    pub fn list(&self) -> Vec<(ProcessId, ApplicationId)> {
        let mut channels: Vec<_> = self
            .channels
            .iter()
            .map(|(pid, entry)| (pid.clone(), entry.application_id.clone()))
            .collect();
        channels.sort();
        channels
    }

    pub fn close_all(&mut self) {
        for (_, entry) in self.channels.drain() {
            entry.reader.abort();
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Reader task: forwards one channel's events to the control loop in order.
async fn pump(
    connector: Arc<dyn StatusConnector>,
    process_id: ProcessId,
    generation: u64,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let send = |event: ChannelEvent| {
        inbox
            .send(Inbound::Channel {
                process_id: process_id.clone(),
                generation,
                event,
            })
            .is_ok()
    };

    let mut stream = match connector.connect(&process_id).await {
        Ok(stream) => stream,
        Err(message) => {
            send(ChannelEvent::TransportError(message));
            return;
        }
    };
    if !send(ChannelEvent::Opened) {
        return;
    }

    while let Some(event) = stream.next().await {
        let ends = event.ends_stream();
        if !send(event) || ends {
            return;
        }
    }

    send(ChannelEvent::Closed {
        code: Some(ABNORMAL_CLOSURE),
        reason: "status stream ended without a close frame".to_string(),
    });
}
