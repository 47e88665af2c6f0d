//! ZeroMQ transport driver.
//!
//! Three logical channels connect a coordinator and its workers:
//!
//! - **job**: dispatch and status frames
//! - **backend**: chunked file transfers and coordination notices
//! - **heartbeat**: liveness
//!
//! The coordinator binds ROUTER sockets; workers connect DEALER sockets
//! whose zmq identity is the worker hostname, so the coordinator addresses
//! a worker by prefixing frames with that identity.

pub mod auth;
pub mod driver;
mod zap;

pub use auth::{AuthConfig, AuthMode, KeyPairFiles};
pub use driver::{Channel, Driver, DriverConfig, Role};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("zmq failure: {0}")]
    Zmq(#[from] zmq::Error),

    #[error(transparent)]
    Protocol(#[from] directord_protocol::ProtocolError),

    #[error("authentication key missing: {0}")]
    MissingKey(String),

    #[error("authentication key invalid: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
