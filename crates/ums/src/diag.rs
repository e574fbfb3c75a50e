//! Read-only diagnostics.
//!
//! Snapshots are plain data copied out under the registry locks; rendering
//! never holds a lock. [`Diagnostics`] exposes them as a hierarchical,
//! path-addressed text surface:
//!
//! ```text
//! <pid>                                   process summary
//! <pid>/schedulers                        scheduler ids, one per line
//! <pid>/schedulers/<sid>/info             scheduler statistics
//! <pid>/schedulers/<sid>/workers          worker summary indices
//! <pid>/schedulers/<sid>/workers/<index>  one worker summary
//! ```
//!
//! Every write is rejected.

use core::fmt;
use std::sync::Arc;

use crate::engine::Ums;
use crate::error::{Result, UmsError};
use crate::process::ProcessId;
use crate::scheduler::{SchedulerId, SchedulerState};
use crate::worker::{WorkerId, WorkerState};

/// Scheduler-side view of one worker it may dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WorkerSummarySnapshot {
    pub index: usize,
    pub worker: WorkerId,
    pub running: bool,
    pub switches: u64,
}

/// Statistics of one scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SchedulerSnapshot {
    pub id: SchedulerId,
    pub state: SchedulerState,
    pub running: Option<WorkerId>,
    pub switches: u64,
    pub last_switch_ns: u64,
    pub avg_switch_ns: u64,
    pub workers: Vec<WorkerSummarySnapshot>,
}

/// Registry entry of one live worker.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub state: WorkerState,
    pub scheduler: Option<SchedulerId>,
}

/// Everything one process owns.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProcessSnapshot {
    pub pid: ProcessId,
    pub schedulers: Vec<SchedulerSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
}

impl ProcessSnapshot {
    pub fn scheduler(&self, id: SchedulerId) -> Option<&SchedulerSnapshot> {
        self.schedulers.iter().find(|s| s.id == id)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Dispatching => "running",
        })
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitingFirstDispatch => "waiting",
            Self::Running => "running",
            Self::Yielded => "yielded",
            Self::Exited => "exited",
        })
    }
}

impl fmt::Display for WorkerSummarySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "worker id: {}", self.index)?;
        writeln!(f, "ums id: {}", self.worker)?;
        writeln!(f, "state: {}", if self.running { "running" } else { "idle" })?;
        writeln!(f, "number of switches: {}", self.switches)
    }
}

impl fmt::Display for SchedulerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ID: {}", self.id)?;
        writeln!(f, "switches: {}", self.switches)?;
        writeln!(f, "state: {}", self.state)?;
        match self.running {
            Some(worker) => writeln!(f, "running: {worker}")?,
            None => writeln!(f, "running: none")?,
        }
        writeln!(f, "last switch time[ns]: {}", self.last_switch_ns)?;
        writeln!(f, "avg switch time[ns]: {}", self.avg_switch_ns)?;
        writeln!(f, "completion list:")?;
        for summary in &self.workers {
            writeln!(f, "worker id: {}, ums id: {}", summary.index, summary.worker)?;
        }
        Ok(())
    }
}

impl fmt::Display for ProcessSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "process: {}", self.pid)?;
        writeln!(f, "schedulers: {}", self.schedulers.len())?;
        for scheduler in &self.schedulers {
            let running = scheduler
                .running
                .map_or_else(|| "none".to_string(), |w| w.to_string());
            writeln!(
                f,
                "  scheduler {}: {} switches={} running={}",
                scheduler.id, scheduler.state, scheduler.switches, running
            )?;
        }
        writeln!(f, "workers: {}", self.workers.len())?;
        for worker in &self.workers {
            match worker.scheduler {
                Some(sid) => writeln!(f, "  worker {}: {} on {sid}", worker.id, worker.state)?,
                None => writeln!(f, "  worker {}: {}", worker.id, worker.state)?,
            }
        }
        Ok(())
    }
}

/// Path-addressed, read-only view over a [`Ums`] instance.
#[derive(Clone)]
pub struct Diagnostics {
    ums: Arc<Ums>,
}

impl Diagnostics {
    pub fn new(ums: Arc<Ums>) -> Self {
        Self { ums }
    }

    /// Top-level entries: one per attached process.
    pub fn list(&self) -> Vec<String> {
        self.ums
            .processes()
            .ids()
            .into_iter()
            .map(|pid| pid.to_string())
            .collect()
    }

    /// Renders the entry at `path`.
    pub fn read(&self, path: &str) -> Result<String> {
        let not_found = || UmsError::NotFound(path.to_string());
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        let (pid, rest) = segments.split_first().ok_or_else(not_found)?;
        let pid = pid.parse().map(ProcessId).map_err(|_| not_found())?;
        let process = self.ums.snapshot(pid).map_err(|_| not_found())?;

        match rest {
            [] => Ok(process.to_string()),
            ["schedulers"] => Ok(process
                .schedulers
                .iter()
                .map(|s| format!("{}\n", s.id))
                .collect()),
            ["schedulers", sid, tail @ ..] => {
                let sid = sid.parse().map(SchedulerId).map_err(|_| not_found())?;
                let scheduler = process.scheduler(sid).ok_or_else(not_found)?;
                match tail {
                    ["info"] => Ok(scheduler.to_string()),
                    ["workers"] => Ok(scheduler
                        .workers
                        .iter()
                        .map(|w| format!("{}\n", w.index))
                        .collect()),
                    ["workers", index] => {
                        let index: usize = index.parse().map_err(|_| not_found())?;
                        scheduler
                            .workers
                            .get(index)
                            .map(ToString::to_string)
                            .ok_or_else(not_found)
                    }
                    _ => Err(not_found()),
                }
            }
            _ => Err(not_found()),
        }
    }

    /// The surface is read-only.
    pub fn write(&self, path: &str, _data: &[u8]) -> Result<usize> {
        log::warn!("rejected diagnostics write to {path}");
        Err(UmsError::ReadOnly)
    }
}
