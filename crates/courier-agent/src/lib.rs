//! Device side of the courier: keeps one leased automation surface in sync with the
//! manager and executes the commands it hands out, one at a time.

pub mod channel;
pub mod client;
pub mod config;
pub mod dedup;
pub mod delivery;
pub mod persist;
pub mod runtime;
pub mod status;
pub mod surface;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{LeaseAuth, ManagerApi, ManagerClient};
pub use config::{AgentConfig, DeliveryTimings, Indicator, SelectorCatalog};
pub use delivery::{DeliveryState, DeliveryStateMachine};
pub use persist::{PersistError, PersistedAgentState, PersistedLease, StateFile};
pub use runtime::AgentRuntime;
pub use status::StatusDetector;
pub use surface::{AutomationSurface, SurfaceError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Credential unknown or revoked; the device has to be paired again.
    #[error("device credential rejected")]
    Unauthenticated,
    #[error("lease held by {current_device_name}")]
    LeaseConflict { current_device_name: String },
    #[error("lease expired")]
    LeaseExpired,
    /// The manager closed the session: takeover by another device or revocation.
    #[error("session invalidated: {reason}")]
    Invalidated { reason: String },
    #[error("device is not paired")]
    NotPaired,
    #[error("no lease held")]
    NoLease,
    #[error("manager returned {status} {error}: {message:?}")]
    Api {
        status: u16,
        error: String,
        message: Option<String>,
    },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push channel error: {0}")]
    Channel(String),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    /// Errors after which the current lease can no longer be used.
    pub fn loses_lease(&self) -> bool {
        matches!(self, AgentError::LeaseExpired | AgentError::Unauthenticated)
    }
}
