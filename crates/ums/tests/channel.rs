//! Control channel requests driven from real threads.

mod common;

use std::sync::Arc;
use std::thread;

use common::wait_for;
use ums::channel::{encode_ids, DISPATCH_SKIPPED};
use ums::error::SUCCESS;
use ums::{
    Command, CompletionItem, CompletionList, DispatchOutcome, ProcessId, Session, Ums, UmsError,
    WorkerId, WorkerState,
};

fn attached(pid: u32) -> Session {
    let session = Session::with_pid(Arc::new(Ums::new()), ProcessId(pid));
    session.attach().unwrap();
    session
}

fn spawn_raw_worker(session: &Session, id: u64, yields: usize) -> thread::JoinHandle<Vec<i64>> {
    let session = session.clone();
    thread::spawn(move || {
        let mut statuses = Vec::new();
        let mut word = [id];
        statuses.push(session.ioctl(Command::WorkerRegister.code(), Some(&mut word[..])));
        for _ in 0..yields {
            statuses.push(session.ioctl(Command::Yield.code(), None));
        }
        statuses.push(session.ioctl(Command::WorkerExit.code(), None));
        statuses
    })
}

fn wait_registered(session: &Session, id: u64) {
    wait_for("worker registration", || {
        session
            .ums()
            .worker_state(session.pid(), WorkerId(id))
            .unwrap()
            .is_some()
    });
}

#[test]
fn raw_requests_drive_a_full_cycle() {
    let session = attached(200);
    let worker = spawn_raw_worker(&session, 21, 1);
    wait_registered(&session, 21);

    let mut ids = encode_ids(&[WorkerId(21)]);
    assert_eq!(
        session.ioctl(Command::SchedulerRegister.code(), Some(&mut ids[..])),
        0
    );

    for _ in 0..2 {
        wait_for("worker to park", || {
            let mut query = vec![1, 21];
            session.ioctl(Command::QueryReadiness.code(), Some(&mut query[..])) == SUCCESS
                && query == vec![1, 21]
        });
        let mut word = [21];
        assert_eq!(
            session.ioctl(Command::Dispatch.code(), Some(&mut word[..])),
            SUCCESS
        );
    }

    assert_eq!(worker.join().unwrap(), vec![SUCCESS; 3]);

    let mut word = [21];
    assert_eq!(
        session.ioctl(Command::Dispatch.code(), Some(&mut word[..])),
        DISPATCH_SKIPPED
    );
    assert_eq!(session.ioctl(Command::ProcessDetach.code(), None), SUCCESS);
}

#[test]
fn dequeue_overwrites_in_place() {
    let session = attached(201);
    let worker = spawn_raw_worker(&session, 4, 0);
    wait_registered(&session, 4);

    let mut words = vec![3, 4, 99, 4];
    wait_for("readiness", || {
        words = vec![3, 4, 99, 4];
        session.ioctl(Command::QueryReadiness.code(), Some(&mut words[..])) == SUCCESS
            && words[1] == 4
    });
    assert_eq!(words, vec![3, 4, 0, 4]);

    let list = CompletionList::from_items([
        CompletionItem::new(WorkerId(99), 1),
        CompletionItem::new(WorkerId(4), 6),
    ]);
    let ready = session.dequeue(&list).unwrap();
    assert_eq!(ready.items(), vec![CompletionItem::new(WorkerId(4), 6)]);

    session.register_scheduler(&list).unwrap();
    assert_eq!(session.dispatch(WorkerId(4)).unwrap(), DispatchOutcome::Completed);
    assert_eq!(worker.join().unwrap(), vec![SUCCESS; 2]);
}

#[test]
fn malformed_payloads_are_rejected() {
    let session = attached(202);

    let cases: Vec<(Command, Option<Vec<u64>>, i64)> = vec![
        (
            Command::SchedulerRegister,
            None,
            UmsError::InvalidArgument("").code(),
        ),
        (
            Command::SchedulerRegister,
            Some(vec![0]),
            UmsError::BadLength {
                declared: 0,
                available: 0,
            }
            .code(),
        ),
        (
            Command::QueryReadiness,
            Some(vec![4, 1, 2]),
            UmsError::BadLength {
                declared: 4,
                available: 2,
            }
            .code(),
        ),
        (
            Command::SchedulerRegister,
            Some(vec![2, 5, 0]),
            UmsError::InvalidArgument("").code(),
        ),
        (
            Command::SchedulerRegister,
            Some(vec![2, 7, 7]),
            UmsError::InvalidArgument("").code(),
        ),
        (
            Command::WorkerRegister,
            Some(vec![0]),
            UmsError::InvalidArgument("").code(),
        ),
        (
            Command::Yield,
            None,
            UmsError::ProtocolViolation("").code(),
        ),
        (
            Command::WorkerExit,
            None,
            UmsError::ProtocolViolation("").code(),
        ),
        (
            Command::Dispatch,
            Some(vec![1]),
            UmsError::ProtocolViolation("").code(),
        ),
    ];

    for (command, payload, expected) in cases {
        let mut payload = payload;
        let status = session.ioctl(command.code(), payload.as_deref_mut());
        assert_eq!(status, expected, "{command:?}");
    }
}

#[test]
fn requests_before_attach_fail() {
    let session = Session::with_pid(Arc::new(Ums::new()), ProcessId(203));
    let code = UmsError::ProcessNotRegistered(ProcessId(203)).code();

    assert_eq!(session.ioctl(Command::Yield.code(), None), code);
    assert_eq!(session.ioctl(Command::ProcessDetach.code(), None), code);
    let mut word = [3];
    assert_eq!(
        session.ioctl(Command::WorkerRegister.code(), Some(&mut word[..])),
        code
    );
    assert_eq!(
        session.ums().worker_state(ProcessId(203), WorkerId(3)),
        Err(UmsError::ProcessNotRegistered(ProcessId(203)))
    );
}

#[test]
fn session_for_current_process() {
    let ums = Arc::new(Ums::new());
    let session = Session::open(Arc::clone(&ums));
    assert_eq!(session.pid(), ProcessId::current());

    session.attach().unwrap();
    let worker = {
        let session = session.clone();
        thread::spawn(move || {
            session.register_worker(WorkerId(1)).unwrap();
            session.worker_exit().unwrap();
        })
    };
    wait_for("registration", || {
        ums.worker_state(session.pid(), WorkerId(1)).unwrap()
            == Some(WorkerState::WaitingFirstDispatch)
    });
    let list = CompletionList::new();
    list.add(WorkerId(1), 0);
    session.register_scheduler(&list).unwrap();
    assert_eq!(session.dispatch(WorkerId(1)).unwrap(), DispatchOutcome::Completed);
    worker.join().unwrap();
    session.detach().unwrap();
}
