use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use colex_common::{ColexError, MetricsRegistry, ProcessorConfig, Result, UniqueId};
use colex_scheduler::BlockedThreads;
use colex_wire::OutputConnection;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Messages the sender thread takes off the queue per pass.
pub const SEND_BATCH_LIMIT: usize = 20;

/// Enqueuers only block once more than this many messages are queued.
const MIN_QUEUED_BEFORE_BLOCKING: usize = 3;

/// One encoded result frame and where it goes.
pub struct ResultMessage {
    pub payload: Bytes,
    /// Connection the result arrived for; used until every consumer
    /// connection of the query is known.
    pub sock: Arc<dyn OutputConnection>,
    /// Round-robin slot among the consumer's connections.
    pub sock_index: usize,
}

impl ResultMessage {
    pub fn new(payload: Bytes, sock: Arc<dyn OutputConnection>, sock_index: usize) -> Self {
        Self {
            payload,
            sock,
            sock_index,
        }
    }

    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<ResultMessage>,
    /// Bytes queued or taken by the sender and not yet written.
    bytes: u64,
    conns: Vec<Arc<dyn OutputConnection>>,
    saw_all_conns: bool,
    flow_control: bool,
    /// Set by a `-1` grant; flow control stays off for the dispatcher's life.
    flow_control_disabled: bool,
    credits: i64,
    dead: bool,
    error: Option<String>,
}

struct Shared {
    unique_id: UniqueId,
    max_bytes: u64,
    size_threshold: usize,
    conns_per_consumer: usize,
    blocked: Arc<dyn BlockedThreads>,
    metrics: MetricsRegistry,
    state: Mutex<SendState>,
    /// Wakes the sender: new messages, credits, abort.
    sender_wake: Condvar,
    /// Wakes enqueuers waiting for the byte total to drop.
    ok_to_send: Condvar,
}

/// Queue plus sender thread for one batch group's results.
pub struct Dispatcher {
    shared: Arc<Shared>,
    sender: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        unique_id: UniqueId,
        config: &ProcessorConfig,
        blocked: Arc<dyn BlockedThreads>,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            unique_id,
            max_bytes: config.max_send_queue_bytes,
            size_threshold: config.send_queue_msg_threshold,
            conns_per_consumer: config.connections_per_consumer.max(1),
            blocked,
            metrics,
            state: Mutex::new(SendState::default()),
            sender_wake: Condvar::new(),
            ok_to_send: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let sender = thread::Builder::new()
            .name(format!("colex-send-{unique_id}"))
            .spawn(move || worker.send_loop())
            .map_err(|e| ColexError::Execution(format!("failed to start sender thread: {e}")))?;
        Ok(Self {
            shared,
            sender: Some(sender),
        })
    }

    /// Queue a result, blocking while the queue is over its byte cap.
    ///
    /// `is_new_connection` marks the first result for a consumer connection;
    /// once `connections_per_consumer` of them were seen, results are spread
    /// over those connections by `sock_index`. A write failure seen by the
    /// sender is returned here. After an abort, results are discarded.
    pub fn send_result(&self, msg: ResultMessage, is_new_connection: bool) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if shared.over_cap(&st) {
            shared.blocked.inc_blocked_threads();
            let started = Instant::now();
            while shared.over_cap(&st) {
                shared.ok_to_send.wait(&mut st);
            }
            shared.blocked.dec_blocked_threads();
            shared
                .metrics
                .observe_dispatch_blocked(shared.unique_id.0, started.elapsed().as_secs_f64());
        }
        if let Some(err) = &st.error {
            return Err(ColexError::Transport(err.clone()));
        }
        if st.dead {
            return Ok(());
        }

        if is_new_connection && !st.saw_all_conns {
            let id = msg.sock.id();
            if !st.conns.iter().any(|c| c.id() == id) {
                st.conns.push(Arc::clone(&msg.sock));
            }
            if st.conns.len() >= shared.conns_per_consumer {
                st.saw_all_conns = true;
                debug!(unique_id = %shared.unique_id, conns = st.conns.len(), "all consumer connections known");
            }
        }
        st.bytes += msg.len();
        st.queue.push_back(msg);
        drop(st);
        shared.sender_wake.notify_one();
        Ok(())
    }

    /// Whether a producer should back off instead of adding more results.
    pub fn size_too_big(&self) -> bool {
        let st = self.shared.state.lock();
        st.queue.len() > self.shared.size_threshold
            || (st.bytes >= self.shared.max_bytes && st.queue.len() > MIN_QUEUED_BEFORE_BLOCKING)
    }

    /// Grant delivery credits: `-1` turns flow control off for good, `0`
    /// turns it on with no credits, a positive count adds credits. Grants
    /// after a `-1` are ignored.
    pub fn send_more(&self, credits: i32) {
        let mut st = self.shared.state.lock();
        if st.flow_control_disabled {
            return;
        }
        match credits {
            c if c < 0 => {
                st.flow_control = false;
                st.flow_control_disabled = true;
            }
            0 => {
                st.flow_control = true;
                st.credits = 0;
            }
            c => st.credits += i64::from(c),
        }
        drop(st);
        self.shared.sender_wake.notify_all();
    }

    /// Drop queued results and release every waiter.
    pub fn abort(&self) {
        let mut st = self.shared.state.lock();
        if st.dead {
            return;
        }
        st.dead = true;
        let dropped = st.queue.len();
        st.queue.clear();
        drop(st);
        debug!(unique_id = %self.shared.unique_id, dropped, "dispatcher aborted");
        self.shared.sender_wake.notify_all();
        self.shared.ok_to_send.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().dead
    }

    pub fn queued_messages(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.shared.state.lock().bytes
    }

    /// Wait until every queued result was written, the dispatcher died, or
    /// `timeout` passed. Returns whether the queue drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        while st.bytes > 0 && st.error.is_none() && !st.dead {
            if self
                .shared
                .ok_to_send
                .wait_until(&mut st, deadline)
                .timed_out()
            {
                break;
            }
        }
        st.bytes == 0 && st.queue.is_empty()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.abort();
        if let Some(sender) = self.sender.take() {
            if sender.join().is_err() {
                warn!(unique_id = %self.shared.unique_id, "sender thread panicked");
            }
        }
    }
}

impl Shared {
    fn over_cap(&self, st: &SendState) -> bool {
        st.bytes >= self.max_bytes
            && st.queue.len() > MIN_QUEUED_BEFORE_BLOCKING
            && !st.dead
            && st.error.is_none()
    }

    fn send_loop(&self) {
        loop {
            let batch: Vec<ResultMessage> = {
                let mut st = self.state.lock();
                while st.queue.is_empty() && !st.dead {
                    self.sender_wake.wait(&mut st);
                }
                if st.dead {
                    return;
                }
                let n = st.queue.len().min(SEND_BATCH_LIMIT);
                st.queue.drain(..n).collect()
            };

            for msg in batch {
                let target = {
                    let mut st = self.state.lock();
                    while st.flow_control && st.credits <= 0 && !st.dead {
                        self.sender_wake.wait(&mut st);
                    }
                    if st.dead {
                        return;
                    }
                    if st.saw_all_conns && !st.conns.is_empty() {
                        Arc::clone(&st.conns[msg.sock_index % st.conns.len()])
                    } else {
                        Arc::clone(&msg.sock)
                    }
                };

                let written = target.write_frame(&msg.payload);
                let mut st = self.state.lock();
                if let Err(e) = written {
                    warn!(unique_id = %self.unique_id, conn = %target.id(), error = %e, "result write failed, sender stops");
                    st.error = Some(e.to_string());
                    st.dead = true;
                    st.queue.clear();
                    drop(st);
                    self.ok_to_send.notify_all();
                    return;
                }
                if st.flow_control {
                    st.credits -= 1;
                }
                st.bytes = st.bytes.saturating_sub(msg.len());
                let below_cap = st.bytes < self.max_bytes;
                drop(st);
                self.metrics
                    .record_dispatch_send(self.unique_id.0, 1, msg.len());
                if below_cap {
                    self.ok_to_send.notify_all();
                }
            }
        }
    }
}
