//! Wire protocol for Directord coordinator <-> worker messaging.
//!
//! A message is a seven-field multipart frame:
//!
//! ```text
//! [MSG_ID][CONTROL][COMMAND][DATA][INFO][STDERR][STDOUT]
//! ```
//!
//! Unused fields carry the single null byte `0x00`. When a coordinator
//! addresses a specific worker, the transport prepends the worker identity
//! as an extra leading frame; the identity is stripped again on receive.
//!
//! Control characters are single bytes drawn from a fixed vocabulary, see
//! [`Control`].

pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod job;
pub mod manage;
pub mod records;

pub use error::ProtocolError;
pub use fingerprint::{file_sha3_224, job_sha3_224, object_sha3_224};
pub use frame::{Frame, NULL_FIELD};
pub use job::{JobItem, VerbPayload, DEFAULT_JOB_TIMEOUT_SECS};
pub use manage::{ManageEnvelope, ManageRequest};
pub use records::{JobRecord, WorkerRecord};

use std::fmt;

/// Default chunk size for backend file transfers, in bytes.
pub const TRANSFER_CHUNK_SIZE: usize = 131_072;

/// Heartbeat cadence in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// A worker is live for `heartbeat interval x liveness` past its last beat.
pub const HEARTBEAT_LIVENESS: u64 = 3;

/// Single-byte control vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Control {
    /// Placeholder / terminal-equivalent success.
    Null = 0x00,
    /// Worker joins a channel.
    Ready = 0x01,
    /// Request or begin a chunked transfer.
    TransferStart = 0x02,
    /// End of a chunked transfer.
    TransferEnd = 0x03,
    /// Successful terminal state.
    JobEnd = 0x04,
    /// Heartbeat.
    Notice = 0x05,
    /// Job received.
    JobAck = 0x06,
    /// Cross-worker barrier failed.
    CoordinationFailed = 0x07,
    /// Cross-worker barrier acknowledged.
    CoordinationAck = 0x10,
    /// Cross-worker barrier notice.
    CoordinationNotice = 0x11,
    /// Failed terminal state.
    JobFailed = 0x15,
    /// Job in progress.
    JobProcessing = 0x16,
}

impl Control {
    pub fn from_byte(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Control::Null),
            0x01 => Ok(Control::Ready),
            0x02 => Ok(Control::TransferStart),
            0x03 => Ok(Control::TransferEnd),
            0x04 => Ok(Control::JobEnd),
            0x05 => Ok(Control::Notice),
            0x06 => Ok(Control::JobAck),
            0x07 => Ok(Control::CoordinationFailed),
            0x10 => Ok(Control::CoordinationAck),
            0x11 => Ok(Control::CoordinationNotice),
            0x15 => Ok(Control::JobFailed),
            0x16 => Ok(Control::JobProcessing),
            other => Err(ProtocolError::InvalidControl(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// True for the two terminal job states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Control::JobEnd | Control::JobFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Control::Null => "NULL",
            Control::Ready => "READY",
            Control::TransferStart => "TRANSFER_START",
            Control::TransferEnd => "TRANSFER_END",
            Control::JobEnd => "JOB_END",
            Control::Notice => "NOTICE",
            Control::JobAck => "JOB_ACK",
            Control::CoordinationFailed => "COORDINATION_FAILED",
            Control::CoordinationAck => "COORDINATION_ACK",
            Control::CoordinationNotice => "COORDINATION_NOTICE",
            Control::JobFailed => "JOB_FAILED",
            Control::JobProcessing => "JOB_PROCESSING",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Return the current unix time as f64 seconds.
pub fn current_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Return a fresh v4 UUID string, the canonical job id format.
pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
