//! Tether core library: domain types, durable process store, config, errors.
//!
//! - [`types`]: identifiers, [`ProcessHandle`], [`RegistrySnapshot`]
//! - [`error`]: [`TrackerError`], [`StoreError`], [`ConfigError`]
//! - [`store`]: load / save of the `{application_id: process_id}` map
//! - [`config`]: `~/.tether/config.yaml`

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::TrackerConfig;
pub use error::{ConfigError, StoreError, TrackerError};
pub use store::PersistedState;
pub use types::{
    ApplicationId, ChannelState, ProcessHandle, ProcessId, RegistrySnapshot, StopCause,
};
