//! Manager side of the courier: device pairing, per-moderator leases, command delivery
//! over push and poll, and the message processor that turns queued patient messages into
//! commands for the leased browser surface.

pub mod channel;
pub mod clock;
pub mod commands;
pub mod config;
pub mod leases;
pub mod log_throttle;
pub mod metrics;
pub mod processor;
pub mod routes;
pub mod secrets;
pub mod state;
pub mod store;
pub mod telemetry;

pub use routes::build_router;
pub use state::AppState;
