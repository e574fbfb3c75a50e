//! # ums - User-Mode Scheduling
//!
//! Two-level cooperative scheduling on top of OS threads: a few scheduler
//! threads take turns lending their carrier to many worker threads, with the
//! choice of which worker runs next made entirely by user policy code.
//!
//! ## Architecture
//!
//! **Registries**: one [`ProcessRegistry`] maps each attached process to its
//! Worker Registry and Scheduler Registry. Entries are keyed by id and
//! reverse-indexed by OS thread; back-references are ids, never pointers.
//!
//! **Context-switch engine**: [`Ums::dispatch`], [`Ums::yield_now`] and
//! [`Ums::worker_exit`] hand the carrier back and forth with park/unpark.
//! A per-process choice lock serializes dispatch decisions; wakeups are
//! retried until delivered.
//!
//! **Readiness**: [`Ums::query_readiness`] filters a [`CompletionList`] down
//! to the workers a scheduler may dispatch right now.
//!
//! ## Module Overview
//!
//! - [`engine`] - the [`Ums`] service and its builder
//! - [`channel`] - per-process command session with a 64-bit wire payload
//! - [`diag`] - read-only snapshots and their text rendering
//! - [`completion`] - completion lists
//! - [`process`], [`scheduler`], [`worker`] - registries
//! - [`park`] - parking slots and wakeup delivery
//! - [`config`], [`error`], [`trace`] - ambient plumbing

pub mod channel;
pub mod completion;
pub mod config;
pub mod diag;
pub mod engine;
pub mod error;
pub mod park;
pub mod process;
pub mod scheduler;
pub mod trace;
pub mod worker;

pub use channel::{Command, Session};
pub use completion::{CompletionItem, CompletionList, Priority};
pub use config::{UmsConfig, UmsConfigBuilder};
pub use diag::{Diagnostics, ProcessSnapshot, SchedulerSnapshot, WorkerSnapshot};
pub use engine::{DispatchOutcome, Ums, UmsBuilder};
pub use error::{Result, UmsError};
pub use process::{ProcessId, ProcessRegistry, Teardown};
pub use scheduler::{SchedulerId, SchedulerState};
pub use trace::{TraceError, TraceHook};
pub use worker::{WorkerId, WorkerState};
