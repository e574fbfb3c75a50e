use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use ums::trace::TraceHook;
use ums::{
    CompletionList, Diagnostics, DispatchOutcome, ProcessId, Session, Ums, UmsConfig, WorkerId,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive user-mode scheduling through the control channel")]
struct Opts {
    /// Number of scheduler threads.
    #[arg(long, default_value_t = 2, value_name = "N")]
    schedulers: usize,

    /// Number of worker threads, spread round-robin across schedulers.
    #[arg(long, default_value_t = 8, value_name = "M")]
    workers: usize,

    /// Yields each worker performs before exiting.
    #[arg(long, default_value_t = 5)]
    yields: usize,

    /// Cap on readiness passes per query.
    #[arg(long, value_name = "PASSES")]
    max_passes: Option<u32>,

    /// Print the diagnostics snapshot as JSON.
    #[arg(long)]
    json: bool,
}

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();
    if opts.schedulers == 0 || opts.workers == 0 {
        bail!("need at least one scheduler and one worker");
    }

    let records = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&records);
    let hook: TraceHook = Arc::new(move |_record, _payload, _timestamp| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });

    let mut config = UmsConfig::builder().name("umsctl");
    if let Some(passes) = opts.max_passes {
        config = config.max_readiness_passes(passes);
    }
    let ums = Arc::new(Ums::builder().config(config.build()).with_trace_hook(hook).build());
    let session = Session::open(Arc::clone(&ums));
    session.attach().context("attach")?;
    log::info!("process {} attached", session.pid());

    let workers: Vec<_> = (1..=opts.workers as u64)
        .map(|id| spawn_worker(session.clone(), WorkerId(id), opts.yields))
        .collect();
    wait_registered(&ums, session.pid(), opts.workers as u64)?;

    let carriers = opts.schedulers.min(opts.workers);
    let schedulers: Vec<_> = (0..carriers)
        .map(|slot| {
            let ids: Vec<WorkerId> = (1..=opts.workers as u64)
                .filter(|id| (*id as usize - 1) % carriers == slot)
                .map(WorkerId)
                .collect();
            spawn_scheduler(session.clone(), ids)
        })
        .collect();

    let mut dispatched = 0;
    for handle in schedulers {
        dispatched += join(handle, "scheduler")??;
    }
    for handle in workers {
        join(handle, "worker")??;
    }

    let snapshot = ums.snapshot(session.pid()).context("snapshot")?;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        let diag = Diagnostics::new(Arc::clone(&ums));
        let pid = session.pid();
        print!("{}", diag.read(&pid.to_string())?);
        for scheduler in &snapshot.schedulers {
            println!();
            print!("{}", diag.read(&format!("{pid}/schedulers/{}/info", scheduler.id))?);
        }
        println!();
        println!(
            "{dispatched} dispatches, {} trace records",
            records.load(Ordering::Relaxed)
        );
    }

    session.detach().context("detach")?;
    Ok(())
}

fn spawn_worker(session: Session, id: WorkerId, yields: usize) -> JoinHandle<Result<()>> {
    thread::spawn(move || {
        session
            .register_worker(id)
            .with_context(|| format!("register worker {id}"))?;
        let mut acc: u64 = id.get();
        for round in 0..yields {
            acc = acc.wrapping_mul(31).wrapping_add(round as u64);
            log::debug!("worker {id} round {round} acc={acc}");
            session.yield_now().with_context(|| format!("yield worker {id}"))?;
        }
        session
            .worker_exit()
            .with_context(|| format!("exit worker {id}"))
    })
}

fn spawn_scheduler(session: Session, ids: Vec<WorkerId>) -> JoinHandle<Result<u64>> {
    thread::spawn(move || {
        let list = CompletionList::new();
        for (slot, id) in ids.iter().enumerate() {
            list.add(*id, slot as i32);
        }
        let sid = session.register_scheduler(&list).context("register scheduler")?;
        log::info!("scheduler {sid} owns {} workers", ids.len());

        let ums = Arc::clone(session.ums());
        let mut dispatched = 0;
        loop {
            let ready = session.dequeue(&list)?;
            if let Some(item) = ready.highest_priority() {
                if session.dispatch(item.worker)? == DispatchOutcome::Completed {
                    dispatched += 1;
                }
                continue;
            }
            let mut alive = false;
            for id in &ids {
                alive |= ums.worker_state(session.pid(), *id)?.is_some();
            }
            if !alive {
                break;
            }
            thread::yield_now();
        }
        log::info!("scheduler {sid} done after {dispatched} dispatches");
        Ok(dispatched)
    })
}

fn wait_registered(ums: &Ums, pid: ProcessId, count: u64) -> Result<()> {
    let deadline = Instant::now() + REGISTRATION_TIMEOUT;
    for id in 1..=count {
        while ums.worker_state(pid, WorkerId(id))?.is_none() {
            if Instant::now() >= deadline {
                bail!("worker {id} did not register in time");
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

fn join<T>(handle: JoinHandle<T>, what: &str) -> Result<T> {
    handle.join().map_err(|_| anyhow!("{what} thread panicked"))
}
