//! Tether daemon: the tracker control loop, its service clients and the
//! Unix-socket request server.

mod channel;
mod coordinator;
mod error;
mod execution;
pub mod paths;
pub mod protocol;
mod registry;
mod runtime;
mod tracker;

pub use channel::{
    ChannelEvent, StatusConnector, StatusStream, WebSocketConnector, ABNORMAL_CLOSURE,
    TERMINAL_MESSAGE,
};
pub use error::{DaemonError, ExecutionError};
pub use execution::{ExecutionService, HttpExecutionService, ProcessStatus};
pub use protocol::{
    request_shutdown, request_start, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking};
pub use tracker::{spawn, TrackerEvent, TrackerHandle, TrackerOptions};
