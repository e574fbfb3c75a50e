//! Error taxonomy shared by every UMS operation.
//!
//! Errors are reported synchronously to the caller of a command; the engine
//! never retries them internally. The only internal retries are wakeup
//! deliveries, which are invisible at this level.

use thiserror::Error;

use crate::process::ProcessId;
use crate::worker::WorkerId;

/// Status returned by the control channel on success.
pub const SUCCESS: i64 = 0;

/// Errors produced by the UMS registries, engine and control channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UmsError {
    /// The calling process never attached, or already detached.
    #[error("process {0} is not registered with UMS")]
    ProcessNotRegistered(ProcessId),
    /// The process already has a live UMS record.
    #[error("process {0} is already attached")]
    AlreadyAttached(ProcessId),
    /// A payload was missing or carried a reserved value.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A length-prefixed array declared a bad element count.
    #[error("bad length: declared {declared}, available {available}")]
    BadLength { declared: u64, available: usize },
    /// The control channel received a request code it does not know.
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    /// The caller broke the dispatch/yield/exit protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// A worker with this id is already registered in the process.
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),
    /// The calling thread already registered itself as a scheduler.
    #[error("calling thread is already a scheduler")]
    DuplicateScheduler,
    /// A diagnostics path did not resolve.
    #[error("no diagnostics entry at {0:?}")]
    NotFound(String),
    /// Writes to the diagnostics surface are rejected.
    #[error("diagnostics are read-only")]
    ReadOnly,
}

impl UmsError {
    /// Negative status code reported through the control channel.
    pub fn code(&self) -> i64 {
        match self {
            Self::ProcessNotRegistered(_) => -1,
            Self::AlreadyAttached(_) => -2,
            Self::InvalidArgument(_) => -3,
            Self::BadLength { .. } => -4,
            Self::UnknownCommand(_) => -5,
            Self::ProtocolViolation(_) => -6,
            Self::DuplicateWorker(_) => -7,
            Self::DuplicateScheduler => -8,
            Self::NotFound(_) => -9,
            Self::ReadOnly => -10,
        }
    }
}

pub type Result<T> = core::result::Result<T, UmsError>;
