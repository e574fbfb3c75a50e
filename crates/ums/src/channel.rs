//! Per-process control channel.
//!
//! A [`Session`] is bound to one process id and accepts the fixed command set
//! as `(request code, payload)` pairs, the way a character device accepts
//! ioctls. Payloads are slices of 64-bit words:
//!
//! - no payload: `ProcessAttach`, `ProcessDetach`, `Yield`, `WorkerExit`;
//! - one value in word 0: `WorkerRegister`, `Dispatch`;
//! - a length-prefixed id array (`[count, id0, id1, ...]`):
//!   `SchedulerRegister`, `QueryReadiness`.
//!
//! `QueryReadiness` rewrites the array in place: each id slot keeps its id
//! when the worker is ready and is zeroed otherwise. `SchedulerRegister`
//! leaves the array untouched and returns the new scheduler id as its
//! status. Every other command returns [`SUCCESS`] on success. Failures
//! return the negative [`UmsError::code`].

use std::sync::Arc;

use crate::completion::{CompletionItem, CompletionList};
use crate::engine::{DispatchOutcome, Ums};
use crate::error::{Result, UmsError, SUCCESS};
use crate::process::ProcessId;
use crate::scheduler::SchedulerId;
use crate::worker::WorkerId;

/// Status of a `Dispatch` request whose target was not parked.
pub const DISPATCH_SKIPPED: i64 = 1;

/// Control channel request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    ProcessAttach = 0,
    ProcessDetach = 1,
    WorkerRegister = 3,
    SchedulerRegister = 4,
    Dispatch = 5,
    Yield = 6,
    WorkerExit = 7,
    QueryReadiness = 8,
}

impl Command {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = UmsError;

    fn try_from(code: u32) -> Result<Self> {
        Ok(match code {
            0 => Self::ProcessAttach,
            1 => Self::ProcessDetach,
            3 => Self::WorkerRegister,
            4 => Self::SchedulerRegister,
            5 => Self::Dispatch,
            6 => Self::Yield,
            7 => Self::WorkerExit,
            8 => Self::QueryReadiness,
            other => return Err(UmsError::UnknownCommand(other)),
        })
    }
}

/// Builds the length-prefixed wire array for `ids`.
pub fn encode_ids(ids: &[WorkerId]) -> Vec<u64> {
    let mut words = Vec::with_capacity(ids.len() + 1);
    words.push(ids.len() as u64);
    words.extend(ids.iter().map(|id| id.get()));
    words
}

/// Validates a length-prefixed array and returns its declared id slots.
pub fn decode_ids(words: &mut [u64]) -> Result<&mut [u64]> {
    let (count, rest) = words
        .split_first_mut()
        .ok_or(UmsError::InvalidArgument("missing id array"))?;
    let declared = *count;
    let len = usize::try_from(declared).unwrap_or(usize::MAX);
    if declared == 0 || len > rest.len() {
        return Err(UmsError::BadLength {
            declared,
            available: rest.len(),
        });
    }
    Ok(&mut rest[..len])
}

fn single_value(payload: Option<&mut [u64]>) -> Result<u64> {
    payload
        .and_then(|words| words.first().copied())
        .ok_or(UmsError::InvalidArgument("missing value payload"))
}

fn id_array(payload: Option<&mut [u64]>) -> Result<&mut [u64]> {
    decode_ids(payload.ok_or(UmsError::InvalidArgument("missing id array"))?)
}

fn to_ids(words: &[u64]) -> Vec<WorkerId> {
    words.iter().copied().map(WorkerId).collect()
}

/// Control session of one process.
#[derive(Clone)]
pub struct Session {
    ums: Arc<Ums>,
    pid: ProcessId,
}

impl Session {
    /// Session for the current OS process.
    pub fn open(ums: Arc<Ums>) -> Self {
        Self::with_pid(ums, ProcessId::current())
    }

    /// Session bound to an explicit process id.
    pub fn with_pid(ums: Arc<Ums>, pid: ProcessId) -> Self {
        Self { ums, pid }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn ums(&self) -> &Arc<Ums> {
        &self.ums
    }

    /// Raw request entry point. Returns a non-negative status on success and
    /// a negative error code on failure.
    pub fn ioctl(&self, request: u32, payload: Option<&mut [u64]>) -> i64 {
        match self.execute(request, payload) {
            Ok(status) => status,
            Err(err) => {
                log::debug!("process {}: request {request} failed: {err}", self.pid);
                err.code()
            }
        }
    }

    /// Same as [`ioctl`](Self::ioctl) with the error kept typed.
    pub fn execute(&self, request: u32, payload: Option<&mut [u64]>) -> Result<i64> {
        let pid = self.pid;
        match Command::try_from(request)? {
            Command::ProcessAttach => self.ums.attach(pid).map(|_| SUCCESS),
            Command::ProcessDetach => self.ums.detach(pid).map(|_| SUCCESS),
            Command::WorkerRegister => {
                let id = single_value(payload)?;
                self.ums.register_worker(pid, WorkerId(id)).map(|_| SUCCESS)
            }
            Command::SchedulerRegister => {
                let slots = id_array(payload)?;
                if slots.contains(&0) {
                    return Err(UmsError::InvalidArgument("worker id 0 is reserved"));
                }
                let id = self.ums.register_scheduler(pid, &to_ids(slots))?;
                i64::try_from(id.0).map_err(|_| UmsError::InvalidArgument("scheduler id overflow"))
            }
            Command::Dispatch => {
                let id = single_value(payload)?;
                match self.ums.dispatch(pid, WorkerId(id))? {
                    DispatchOutcome::Completed => Ok(SUCCESS),
                    DispatchOutcome::Skipped => Ok(DISPATCH_SKIPPED),
                }
            }
            Command::Yield => self.ums.yield_now(pid).map(|_| SUCCESS),
            Command::WorkerExit => self.ums.worker_exit(pid).map(|_| SUCCESS),
            Command::QueryReadiness => {
                let slots = id_array(payload)?;
                let mask = self.ums.readiness_mask(pid, &to_ids(slots))?;
                for (slot, ready) in slots.iter_mut().zip(mask) {
                    if !ready {
                        *slot = 0;
                    }
                }
                Ok(SUCCESS)
            }
        }
    }

    pub fn attach(&self) -> Result<()> {
        self.execute(Command::ProcessAttach.code(), None).map(drop)
    }

    pub fn detach(&self) -> Result<()> {
        self.execute(Command::ProcessDetach.code(), None).map(drop)
    }

    /// Registers the calling thread as worker `id`; returns on first dispatch.
    pub fn register_worker(&self, id: WorkerId) -> Result<()> {
        let mut word = [id.get()];
        self.execute(Command::WorkerRegister.code(), Some(&mut word[..]))
            .map(drop)
    }

    /// Registers the calling thread as a scheduler over `list`.
    pub fn register_scheduler(&self, list: &CompletionList) -> Result<SchedulerId> {
        let mut words = encode_ids(&list.ids());
        let status = self.execute(Command::SchedulerRegister.code(), Some(&mut words[..]))?;
        Ok(SchedulerId(status.unsigned_abs()))
    }

    pub fn dispatch(&self, id: WorkerId) -> Result<DispatchOutcome> {
        let mut word = [id.get()];
        let status = self.execute(Command::Dispatch.code(), Some(&mut word[..]))?;
        Ok(if status == DISPATCH_SKIPPED {
            DispatchOutcome::Skipped
        } else {
            DispatchOutcome::Completed
        })
    }

    pub fn yield_now(&self) -> Result<()> {
        self.execute(Command::Yield.code(), None).map(drop)
    }

    pub fn worker_exit(&self) -> Result<()> {
        self.execute(Command::WorkerExit.code(), None).map(drop)
    }

    /// Ready entries of `list`, priorities preserved. Goes through the wire
    /// encoding like any external caller.
    pub fn dequeue(&self, list: &CompletionList) -> Result<CompletionList> {
        let items = list.items();
        let ids: Vec<WorkerId> = items.iter().map(|item| item.worker).collect();
        let mut words = encode_ids(&ids);
        self.execute(Command::QueryReadiness.code(), Some(&mut words[..]))?;

        let ready: Vec<CompletionItem> = items
            .into_iter()
            .zip(words.into_iter().skip(1))
            .filter_map(|(item, word)| (word != 0).then_some(item))
            .collect();
        Ok(CompletionList::from_items(ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(pid: u32) -> Session {
        Session::with_pid(Arc::new(Ums::new()), ProcessId(pid))
    }

    #[test]
    fn command_codes_round_trip() {
        for command in [
            Command::ProcessAttach,
            Command::ProcessDetach,
            Command::WorkerRegister,
            Command::SchedulerRegister,
            Command::Dispatch,
            Command::Yield,
            Command::WorkerExit,
            Command::QueryReadiness,
        ] {
            assert_eq!(Command::try_from(command.code()), Ok(command));
        }
        assert_eq!(Command::try_from(2), Err(UmsError::UnknownCommand(2)));
        assert_eq!(Command::try_from(99), Err(UmsError::UnknownCommand(99)));
    }

    #[test]
    fn encode_prefixes_count() {
        assert_eq!(encode_ids(&[WorkerId(7), WorkerId(9)]), vec![2, 7, 9]);
    }

    #[test]
    fn decode_checks_declared_length() {
        let mut empty: [u64; 0] = [];
        assert!(matches!(
            decode_ids(&mut empty),
            Err(UmsError::InvalidArgument(_))
        ));

        let mut zero = [0, 5];
        assert_eq!(
            decode_ids(&mut zero).unwrap_err(),
            UmsError::BadLength {
                declared: 0,
                available: 1
            }
        );

        let mut short = [3, 5, 6];
        assert_eq!(
            decode_ids(&mut short).unwrap_err(),
            UmsError::BadLength {
                declared: 3,
                available: 2
            }
        );

        let mut longer = [1, 5, 6];
        assert_eq!(decode_ids(&mut longer).unwrap(), &[5]);
    }

    #[test]
    fn unknown_request_reports_code() {
        let session = session(1);
        assert_eq!(session.ioctl(42, None), UmsError::UnknownCommand(42).code());
    }

    #[test]
    fn attach_then_detach_status() {
        let session = session(2);
        assert_eq!(session.ioctl(Command::ProcessAttach.code(), None), SUCCESS);
        assert_eq!(
            session.ioctl(Command::ProcessAttach.code(), None),
            UmsError::AlreadyAttached(ProcessId(2)).code()
        );
        assert_eq!(session.ioctl(Command::ProcessDetach.code(), None), SUCCESS);
        assert_eq!(
            session.ioctl(Command::ProcessDetach.code(), None),
            UmsError::ProcessNotRegistered(ProcessId(2)).code()
        );
    }

    #[test]
    fn value_commands_require_payload() {
        let session = session(3);
        session.attach().unwrap();
        assert!(matches!(
            session.execute(Command::WorkerRegister.code(), None),
            Err(UmsError::InvalidArgument(_))
        ));
        let mut empty: [u64; 0] = [];
        assert!(matches!(
            session.execute(Command::Dispatch.code(), Some(&mut empty[..])),
            Err(UmsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn scheduler_register_returns_sequential_ids() {
        let session = session(4);
        session.attach().unwrap();

        let mut words = vec![2, 7, 9];
        assert_eq!(
            session.ioctl(Command::SchedulerRegister.code(), Some(&mut words[..])),
            0
        );
        assert_eq!(words, vec![2, 7, 9]);

        let other = session.clone();
        let status = std::thread::spawn(move || {
            let mut words = vec![1, 4];
            other.ioctl(Command::SchedulerRegister.code(), Some(&mut words[..]))
        })
        .join()
        .unwrap();
        assert_eq!(status, 1);
    }

    #[test]
    fn readiness_zeroes_unknown_ids() {
        let session = session(5);
        session.attach().unwrap();

        let mut words = vec![2, 7, 9, 123];
        assert_eq!(
            session.ioctl(Command::QueryReadiness.code(), Some(&mut words[..])),
            SUCCESS
        );
        assert_eq!(words, vec![2, 0, 0, 123]);
    }
}
