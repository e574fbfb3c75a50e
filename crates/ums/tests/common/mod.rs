//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ums::trace::TraceHook;
use ums::{CompletionList, ProcessId, Ums, WorkerId};

const DEADLINE: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds, failing the test after a deadline.
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Spawns a worker thread that registers as `id`, yields `yields` times and
/// exits. Returns the number of times it ran.
pub fn spawn_worker(ums: &Arc<Ums>, pid: ProcessId, id: u64, yields: usize) -> JoinHandle<usize> {
    let ums = Arc::clone(ums);
    thread::spawn(move || {
        ums.register_worker(pid, WorkerId(id)).expect("register worker");
        let mut runs = 1;
        for _ in 0..yields {
            ums.yield_now(pid).expect("yield");
            runs += 1;
        }
        ums.worker_exit(pid).expect("worker exit");
        runs
    })
}

/// Waits until every id in `ids` is in the worker registry.
pub fn wait_registered(ums: &Ums, pid: ProcessId, ids: &[u64]) {
    wait_for("worker registration", || {
        ids.iter()
            .all(|id| matches!(ums.worker_state(pid, WorkerId(*id)), Ok(Some(_))))
    });
}

/// Polls readiness until it reports exactly `expected`, in list order.
pub fn wait_ready(ums: &Ums, pid: ProcessId, list: &CompletionList, expected: &[u64]) -> CompletionList {
    let expected: Vec<WorkerId> = expected.iter().copied().map(WorkerId).collect();
    let mut last = CompletionList::new();
    wait_for("readiness", || {
        last = ums.query_readiness(pid, list).expect("query readiness");
        last.ids() == expected
    });
    last
}

/// Trace hook recording every emitted record.
pub fn capture_hook() -> (TraceHook, Arc<Mutex<Vec<(u8, Vec<u8>)>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);
    let hook: TraceHook = Arc::new(move |record, payload, _timestamp| {
        sink.lock().push((record, payload.to_vec()));
        Ok(())
    });
    (hook, records)
}
