use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use colex_common::{ColexError, ConnectionId, MetricsRegistry, ProcessorConfig, UniqueId};
use colex_dispatch::{Dispatcher, ResultMessage};
use colex_scheduler::BlockedThreads;
use colex_wire::{MemoryConnection, OutputConnection};
use parking_lot::{Condvar, Mutex};

const FRAME: usize = 64;

#[derive(Default)]
struct CountingBlocked {
    now: AtomicUsize,
    total: AtomicUsize,
}

impl BlockedThreads for CountingBlocked {
    fn inc_blocked_threads(&self) {
        self.now.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_blocked_threads(&self) {
        self.now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connection whose writes block until the gate opens.
struct GatedConnection {
    inner: MemoryConnection,
    open: Mutex<bool>,
    cond: Condvar,
}

impl GatedConnection {
    fn new(id: u64) -> Self {
        Self {
            inner: MemoryConnection::new(id),
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

impl OutputConnection for GatedConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn write_frame(&self, frame: &[u8]) -> colex_common::Result<()> {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        drop(open);
        self.inner.write_frame(frame)
    }
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn frame(tag: u8) -> Bytes {
    Bytes::from(vec![tag; FRAME])
}

fn dispatcher(config: ProcessorConfig, blocked: Arc<CountingBlocked>) -> Dispatcher {
    Dispatcher::new(UniqueId(1), &config, blocked, MetricsRegistry::new()).expect("dispatcher")
}

#[test]
fn enqueuers_block_at_the_byte_cap_and_resume_in_order() {
    let blocked = Arc::new(CountingBlocked::default());
    let config = ProcessorConfig {
        max_send_queue_bytes: 5 * FRAME as u64,
        ..ProcessorConfig::default()
    };
    let dispatcher = Arc::new(dispatcher(config, Arc::clone(&blocked)));
    let conn = Arc::new(GatedConnection::new(1));
    let sent = Arc::new(AtomicUsize::new(0));

    let producer = {
        let dispatcher = Arc::clone(&dispatcher);
        let conn: Arc<dyn OutputConnection> = conn.clone();
        let sent = Arc::clone(&sent);
        thread::spawn(move || {
            for tag in 0..20_u8 {
                dispatcher
                    .send_result(ResultMessage::new(frame(tag), Arc::clone(&conn), 0), tag == 0)
                    .expect("send");
                sent.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    assert!(wait_until(|| blocked.now.load(Ordering::SeqCst) == 1));
    assert!(sent.load(Ordering::SeqCst) < 20);
    assert!(dispatcher.queued_bytes() >= 5 * FRAME as u64);

    conn.open();
    producer.join().expect("producer");
    assert!(dispatcher.wait_drained(Duration::from_secs(5)));
    assert_eq!(blocked.now.load(Ordering::SeqCst), 0);
    assert!(blocked.total.load(Ordering::SeqCst) >= 1);

    let tags: Vec<u8> = conn.inner.frames().iter().map(|f| f[0]).collect();
    assert_eq!(tags, (0..20).collect::<Vec<u8>>());
}

#[test]
fn credits_meter_delivery() {
    let dispatcher = dispatcher(ProcessorConfig::default(), Arc::default());
    let conn = Arc::new(MemoryConnection::new(1));
    let sock: Arc<dyn OutputConnection> = conn.clone();

    dispatcher.send_more(0);
    for tag in 0..8 {
        dispatcher
            .send_result(ResultMessage::new(frame(tag), Arc::clone(&sock), 0), tag == 0)
            .expect("send");
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(conn.frame_count(), 0);

    dispatcher.send_more(5);
    assert!(wait_until(|| conn.frame_count() == 5));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(conn.frame_count(), 5);

    dispatcher.send_more(-1);
    assert!(wait_until(|| conn.frame_count() == 8));
    assert!(dispatcher.wait_drained(Duration::from_secs(5)));
}

#[test]
fn disabling_flow_control_is_permanent() {
    let dispatcher = dispatcher(ProcessorConfig::default(), Arc::default());
    let conn = Arc::new(MemoryConnection::new(2));
    let sock: Arc<dyn OutputConnection> = conn.clone();

    dispatcher.send_more(-1);
    dispatcher.send_more(0);
    for tag in 0..3 {
        dispatcher
            .send_result(ResultMessage::new(frame(tag), Arc::clone(&sock), 0), tag == 0)
            .expect("send");
    }
    assert!(wait_until(|| conn.frame_count() == 3));
    assert!(dispatcher.wait_drained(Duration::from_secs(5)));
}

#[test]
fn write_failure_surfaces_on_next_send() {
    let dispatcher = dispatcher(ProcessorConfig::default(), Arc::default());
    let conn = Arc::new(MemoryConnection::new(3));
    conn.set_failing(true);
    let sock: Arc<dyn OutputConnection> = conn.clone();

    let surfaced = wait_until(|| {
        matches!(
            dispatcher.send_result(ResultMessage::new(frame(1), Arc::clone(&sock), 0), true),
            Err(ColexError::Transport(_))
        )
    });
    assert!(surfaced);
    assert!(dispatcher.is_aborted());
    assert!(!dispatcher.wait_drained(Duration::from_millis(10)));
}

#[test]
fn results_rotate_over_known_connections() {
    let config = ProcessorConfig {
        connections_per_consumer: 2,
        ..ProcessorConfig::default()
    };
    let dispatcher = dispatcher(config, Arc::default());
    let a = Arc::new(MemoryConnection::new(10));
    let b = Arc::new(MemoryConnection::new(11));
    let sock_a: Arc<dyn OutputConnection> = a.clone();
    let sock_b: Arc<dyn OutputConnection> = b.clone();

    dispatcher
        .send_result(ResultMessage::new(frame(0), Arc::clone(&sock_a), 0), true)
        .expect("send");
    dispatcher
        .send_result(ResultMessage::new(frame(1), Arc::clone(&sock_b), 1), true)
        .expect("send");
    for (tag, idx) in [(2, 0), (3, 1), (4, 0), (5, 1)] {
        dispatcher
            .send_result(ResultMessage::new(frame(tag), Arc::clone(&sock_a), idx), false)
            .expect("send");
    }
    assert!(dispatcher.wait_drained(Duration::from_secs(5)));

    let tags = |c: &MemoryConnection| c.frames().iter().map(|f| f[0]).collect::<Vec<u8>>();
    assert_eq!(tags(&a), vec![0, 2, 4]);
    assert_eq!(tags(&b), vec![1, 3, 5]);
}

#[test]
fn abort_releases_blocked_enqueuers() {
    let blocked = Arc::new(CountingBlocked::default());
    let config = ProcessorConfig {
        max_send_queue_bytes: FRAME as u64,
        ..ProcessorConfig::default()
    };
    let dispatcher = Arc::new(dispatcher(config, Arc::clone(&blocked)));
    let conn = Arc::new(GatedConnection::new(1));

    let producer = {
        let dispatcher = Arc::clone(&dispatcher);
        let conn: Arc<dyn OutputConnection> = conn.clone();
        thread::spawn(move || {
            for tag in 0..10_u8 {
                dispatcher
                    .send_result(ResultMessage::new(frame(tag), Arc::clone(&conn), 0), false)
                    .expect("send");
            }
        })
    };
    assert!(wait_until(|| blocked.now.load(Ordering::SeqCst) == 1));
    dispatcher.abort();
    producer.join().expect("producer");
    assert_eq!(dispatcher.queued_messages(), 0);
    conn.open();
}
