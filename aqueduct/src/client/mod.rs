//! Client-side driver proxy: the shared-memory control plane as seen
//! from a client process.

pub mod events;
pub mod proxy;

pub use events::{DriverEventDispatcher, DriverListener, DriverResponse};
pub use proxy::DriverProxy;

use thiserror::Error;

use crate::buffer::mapped::MappedFileError;
use crate::concurrent::broadcast::BroadcastError;
use crate::concurrent::ring::RingError;
use crate::protocol::control::ControlError;

/// Default time a client waits for a driver response before declaring
/// the driver dead.
pub const DRIVER_TIMEOUT_DEFAULT: std::time::Duration = std::time::Duration::from_secs(10);

/// Errors raised on the client side of the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Map(#[from] MappedFileError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("driver unresponsive for {0:?}")]
    DriverTimeout(std::time::Duration),
    #[error("event stream lapped; events were lost")]
    Lapped,
}
