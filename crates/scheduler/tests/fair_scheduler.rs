use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use colex_common::error::ERR_PRIMITIVE_SERVER;
use colex_common::{ColexError, MetricsRegistry, StepId, TxnId, UniqueId};
use colex_scheduler::{functor, BlockedThreads, FairScheduler, Job, JobStatus};
use colex_wire::{MemoryConnection, Message, OutputConnection};

const TIMEOUT: Duration = Duration::from_secs(5);

fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Job that occupies a worker until the returned sender fires.
fn blocker(id: u32) -> (Job, Receiver<()>, Sender<()>) {
    let (started_tx, started_rx) = channel::<()>();
    let (release_tx, release_rx) = channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let job = Job::new(
        UniqueId(id),
        StepId(0),
        TxnId(0),
        functor(move || {
            let _ = started_tx.send(());
            let _ = release_rx.lock().expect("gate").recv_timeout(TIMEOUT);
            Ok(JobStatus::Done)
        }),
    );
    (job, started_rx, release_tx)
}

fn recording(
    label: u32,
    txn: u32,
    weight: u32,
    log: &Arc<Mutex<Vec<u32>>>,
    done: &Sender<u32>,
) -> Job {
    let log = Arc::clone(log);
    let done = done.clone();
    Job::new(
        UniqueId(label),
        StepId(label),
        TxnId(txn),
        functor(move || {
            log.lock().expect("log").push(label);
            let _ = done.send(label);
            Ok(JobStatus::Done)
        }),
    )
    .with_weight(weight)
}

#[test]
fn transactions_are_served_by_accumulated_weight() {
    let scheduler = FairScheduler::new("fair", 1, MetricsRegistry::new());
    let (block, started, release) = blocker(100);
    scheduler.add_job(block);
    started.recv_timeout(TIMEOUT).expect("blocker started");

    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = channel();
    scheduler.add_job(recording(1, 1, 1, &log, &done_tx));
    scheduler.add_job(recording(2, 1, 2, &log, &done_tx));
    scheduler.add_job(recording(3, 1, 1, &log, &done_tx));
    scheduler.add_job(recording(4, 2, 1, &log, &done_tx));
    assert_eq!(scheduler.queue_size(), 4);

    release.send(()).expect("release");
    for _ in 0..4 {
        done_rx.recv_timeout(TIMEOUT).expect("job finished");
    }
    assert_eq!(*log.lock().expect("log"), vec![1, 4, 2, 3]);
    assert_eq!(scheduler.queue_size(), 0);
}

#[test]
fn remove_jobs_cancels_only_queued_matches() {
    let scheduler = FairScheduler::new("cancel", 1, MetricsRegistry::new());
    let (block, started, release) = blocker(7);
    scheduler.add_job(block);
    started.recv_timeout(TIMEOUT).expect("blocker started");

    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = channel();
    scheduler.add_job(recording(7, 1, 1, &log, &done_tx));
    scheduler.add_job(recording(7, 2, 1, &log, &done_tx));
    scheduler.add_job(recording(8, 2, 1, &log, &done_tx));
    scheduler.remove_jobs(7);
    assert_eq!(scheduler.queue_size(), 1);
    assert_eq!(scheduler.jobs_running(), 1);

    release.send(()).expect("release");
    assert_eq!(done_rx.recv_timeout(TIMEOUT).expect("survivor"), 8);
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(*log.lock().expect("log"), vec![8]);
}

#[test]
fn rescheduled_job_reenters_with_its_own_weight() {
    let scheduler = FairScheduler::new("resched", 1, MetricsRegistry::new());
    let (block, started, release) = blocker(100);
    scheduler.add_job(block);
    started.recv_timeout(TIMEOUT).expect("blocker started");

    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = channel();
    let runs = Arc::new(AtomicUsize::new(0));
    let a = {
        let log = Arc::clone(&log);
        let runs = Arc::clone(&runs);
        let done = done_tx.clone();
        Job::new(
            UniqueId(1),
            StepId(1),
            TxnId(5),
            functor(move || {
                log.lock().expect("log").push(1);
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Ok(JobStatus::Reschedule);
                }
                let _ = done.send(1);
                Ok(JobStatus::Done)
            }),
        )
    };
    scheduler.add_job(a);
    scheduler.add_job(recording(2, 3, 2, &log, &done_tx));

    release.send(()).expect("release");
    for _ in 0..2 {
        done_rx.recv_timeout(TIMEOUT).expect("job finished");
    }
    // A's second run competes at weight 1 again, ahead of B at 2.
    assert_eq!(*log.lock().expect("log"), vec![1, 1, 2]);
}

#[test]
fn faulted_worker_reports_and_is_replaced() {
    let scheduler = FairScheduler::new("faults", 1, MetricsRegistry::new());
    let conn = Arc::new(MemoryConnection::new(1));
    let sock: Arc<dyn OutputConnection> = conn.clone();

    scheduler.add_job(
        Job::new(
            UniqueId(9),
            StepId(4),
            TxnId(1),
            functor(|| panic!("corrupt block")),
        )
        .with_sock(Arc::clone(&sock)),
    );
    assert!(wait_until(|| scheduler.thread_count() == 0));
    assert!(wait_until(|| conn.frame_count() == 1));

    scheduler.add_job(
        Job::new(
            UniqueId(10),
            StepId(4),
            TxnId(1),
            functor(|| Err(ColexError::Execution("bad state".to_string()))),
        )
        .with_sock(sock),
    );
    assert!(wait_until(|| conn.frame_count() == 2));
    assert!(wait_until(|| scheduler.thread_count() == 0));

    let messages = conn.messages().expect("decode");
    for (msg, unique) in messages.iter().zip([9, 10]) {
        let Message::BatchResult(result) = msg else {
            panic!("expected a result message");
        };
        assert_eq!(result.status(), ERR_PRIMITIVE_SERVER);
        assert_eq!(result.header.unique, UniqueId(unique));
        assert_eq!(result.header.step, StepId(4));
    }

    let (done_tx, done_rx) = channel();
    let log = Arc::new(Mutex::new(Vec::new()));
    scheduler.add_job(recording(11, 1, 1, &log, &done_tx));
    assert_eq!(done_rx.recv_timeout(TIMEOUT).expect("replacement ran"), 11);
    assert_eq!(scheduler.thread_count(), 1);
}

#[test]
fn extra_threads_follow_blocked_senders() {
    let scheduler = FairScheduler::new("extra", 1, MetricsRegistry::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = channel();

    scheduler.inc_blocked_threads();
    scheduler.add_job(recording(1, 1, 1, &log, &done_tx));
    assert_eq!(scheduler.extra_thread_count(), 1);
    assert_eq!(scheduler.thread_count(), 2);
    done_rx.recv_timeout(TIMEOUT).expect("job ran");

    scheduler.dec_blocked_threads();
    scheduler.add_job(recording(2, 1, 1, &log, &done_tx));
    done_rx.recv_timeout(TIMEOUT).expect("job ran");
    assert!(wait_until(|| scheduler.extra_thread_count() == 0));
    assert_eq!(scheduler.thread_count(), 1);
}
