//! Binary trace records emitted by the engine.
//!
//! A [`TraceHook`] receives one record per protocol event. Payloads are
//! little-endian ids: process ids as `u32`, worker and scheduler ids as `u64`.

use std::sync::Arc;

use thiserror::Error;

/// Errors a trace sink may report back to the engine.
///
/// The engine logs a failed record at `warn` and carries on; tracing never
/// fails a scheduling operation.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The record does not fit the sink's frame; carries the payload length.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    /// The sink's transport rejected the record.
    #[error("trace sink failed: {0}")]
    Sink(String),
}

pub type TraceResult = Result<(), TraceError>;

/// Hook invoked with `(record_type, payload, with_timestamp)`.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> TraceResult + Send + Sync>;

/// Canonical record identifiers.
pub mod records {
    /// Process attached (`pid`).
    pub const ATTACH: u8 = 96;
    /// Process detached (`pid`, workers dropped, schedulers dropped).
    pub const DETACH: u8 = 97;
    /// Worker registered and parked (`pid`, `worker`).
    pub const WORKER_REGISTER: u8 = 98;
    /// Scheduler registered (`pid`, `scheduler`, `list len`).
    pub const SCHEDULER_REGISTER: u8 = 99;
    /// Worker handed the carrier (`pid`, `scheduler`, `worker`).
    pub const DISPATCH: u8 = 100;
    /// Dispatch target was not parked (`pid`, `scheduler`, `worker`).
    pub const DISPATCH_SKIPPED: u8 = 101;
    /// Scheduler regained control (`pid`, `scheduler`).
    pub const RESUME: u8 = 102;
    /// Worker yielded (`pid`, `worker`, `scheduler`).
    pub const YIELD: u8 = 103;
    /// Worker exited (`pid`, `worker`, `scheduler`).
    pub const EXIT: u8 = 104;
    /// Readiness query answered (`pid`, `ready`, `passes`).
    pub const DEQUEUE: u8 = 105;
}

/// Little-endian payload builder for trace records.
#[derive(Debug, Default)]
pub(crate) struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn u64(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
