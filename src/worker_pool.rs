//! Worker offload — master-side pool of worker connections.
//!
//! Blocking passdb/userdb calls are serialized to a line protocol and
//! shipped to worker processes over UNIX sockets. The pool keeps at
//! most `max_workers` connections, each with at most one request in
//! flight; waiting requests queue FIFO and are never allowed to jump
//! ahead of the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, info, warn};

use crate::lineio::{self, LineError};
use crate::metrics::Metrics;

const MAX_IDLE: Duration = Duration::from_secs(30 * 60);
const QUEUE_WARN_AGE: Duration = Duration::from_secs(3);
const QUEUE_WARN_MIN_INTERVAL: Duration = Duration::from_secs(300);
const CONNECT_RETRY_SLEEP: Duration = Duration::from_millis(100);
const CONNECT_MAX_TRIES: u32 = 50;

/// Synthesized reply payload for requests that never got a real one.
pub const INTERNAL_FAILURE_REPLY: &str = "FAIL\t-1";

struct QueuedRequest {
    created: Instant,
    data: String,
    reply_tx: oneshot::Sender<String>,
}

struct PoolState {
    total: usize,
    idle: usize,
    queue: VecDeque<QueuedRequest>,
    last_queue_warn: Option<Instant>,
    next_conn_id: u64,
}

struct Shared {
    socket_path: String,
    max_workers: usize,
    lookup_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
    state: Mutex<PoolState>,
    wake: Notify,
}

/// Point-in-time pool counters for the admin API.
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub total: usize,
    pub idle: usize,
    pub queued: usize,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(
        socket_path: String,
        max_workers: usize,
        lookup_timeout: Duration,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket_path,
                max_workers,
                lookup_timeout,
                metrics,
                state: Mutex::new(PoolState {
                    total: 0,
                    idle: 0,
                    queue: VecDeque::new(),
                    last_queue_warn: None,
                    next_conn_id: 0,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Spawn the first worker connection ahead of demand.
    pub fn prestart(&self) {
        let mut st = self.shared.state.lock().unwrap();
        if st.total == 0 && self.shared.max_workers > 0 {
            spawn_worker(&self.shared, &mut st);
        }
    }

    /// Enqueue one request line and wait for its reply payload.
    ///
    /// Returns the payload after the id prefix: `OK\t...`,
    /// `FAIL\t<code>...` or `NOTFOUND\t...`. A worker dying or timing
    /// out surfaces [`INTERNAL_FAILURE_REPLY`].
    pub async fn call(&self, data: String) -> String {
        if self.shared.max_workers == 0 {
            error!("worker call with no workers configured");
            return INTERNAL_FAILURE_REPLY.to_string();
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock().unwrap();
            st.queue.push_back(QueuedRequest {
                created: Instant::now(),
                data,
                reply_tx: tx,
            });
            // grow the pool only when the idle workers cannot cover
            // the waiters; FIFO order is preserved either way
            if st.queue.len() > st.idle && st.total < self.shared.max_workers {
                spawn_worker(&self.shared, &mut st);
            }
        }
        self.shared.wake.notify_one();
        match rx.await {
            Ok(line) => line,
            Err(_) => INTERNAL_FAILURE_REPLY.to_string(),
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.shared.state.lock().unwrap();
        PoolSnapshot {
            total: st.total,
            idle: st.idle,
            queued: st.queue.len(),
        }
    }
}

fn spawn_worker(shared: &Arc<Shared>, st: &mut PoolState) {
    st.total += 1;
    st.next_conn_id += 1;
    let conn_id = st.next_conn_id;
    let shared = Arc::clone(shared);
    tokio::spawn(worker_task(shared, conn_id));
}

/// Drop one connection from the books. With `restart`, a replacement
/// is spawned when no idle worker remains to drain the queue.
fn destroy(shared: &Arc<Shared>, restart: bool) {
    let mut st = shared.state.lock().unwrap();
    st.total -= 1;
    if let Some(m) = &shared.metrics {
        Metrics::inc(&m.worker_destroys);
    }
    if restart && st.idle == 0 && st.total < shared.max_workers {
        spawn_worker(shared, &mut st);
    }
}

async fn connect_with_retry(path: &str) -> std::io::Result<UnixStream> {
    let mut tries = 0u32;
    loop {
        match UnixStream::connect(path).await {
            Ok(s) => return Ok(s),
            Err(e) => {
                // workers may be busy or not listening yet
                tries += 1;
                if tries > CONNECT_MAX_TRIES {
                    return Err(e);
                }
                tokio::time::sleep(CONNECT_RETRY_SLEEP).await;
            }
        }
    }
}

enum IdleOutcome {
    Wake,
    Input,
    IdleTimeout,
}

async fn worker_task(shared: Arc<Shared>, conn_id: u64) {
    let stream = match connect_with_retry(&shared.socket_path).await {
        Ok(s) => s,
        Err(e) => {
            error!(conn_id, path = %shared.socket_path, error = %e,
                "connecting to auth worker socket failed");
            let mut st = shared.state.lock().unwrap();
            st.total -= 1;
            if st.total == 0 {
                // nobody left to serve the queue
                for q in st.queue.drain(..) {
                    let _ = q.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
                }
            }
            return;
        }
    };
    if let Some(m) = &shared.metrics {
        Metrics::inc(&m.worker_creates);
    }
    debug!(conn_id, "worker connection up");

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;
    let mut id_counter: u32 = 0;

    loop {
        let req = {
            let mut st = shared.state.lock().unwrap();
            let mut picked = None;
            while let Some(front) = st.queue.pop_front() {
                if front.created.elapsed() >= shared.lookup_timeout {
                    warn!(conn_id, "request expired in worker queue");
                    let _ = front.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
                    if let Some(m) = &shared.metrics {
                        Metrics::inc(&m.worker_timeouts);
                    }
                    continue;
                }
                picked = Some(front);
                break;
            }
            if picked.is_none() {
                st.idle += 1;
            }
            picked
        };

        let Some(req) = req else {
            // idle: wait for work, but keep watching the socket so a
            // SHUTDOWN or a disconnect is noticed immediately.
            // fill_buf consumes nothing, so dropping it on wake is safe.
            let outcome = tokio::select! {
                _ = shared.wake.notified() => IdleOutcome::Wake,
                res = reader.fill_buf() => match res {
                    Ok(buf) if buf.is_empty() => {
                        idle_destroy(&shared, conn_id, "worker disconnected", true);
                        return;
                    }
                    Ok(_) => IdleOutcome::Input,
                    Err(e) => {
                        idle_destroy(&shared, conn_id, &format!("read failed: {e}"), true);
                        return;
                    }
                },
                _ = tokio::time::sleep(MAX_IDLE) => IdleOutcome::IdleTimeout,
            };
            match outcome {
                IdleOutcome::Wake => {
                    let mut st = shared.state.lock().unwrap();
                    st.idle -= 1;
                    continue;
                }
                IdleOutcome::Input => match lineio::read_line(&mut reader).await {
                    Ok(line) if line == "SHUTDOWN" => {
                        idle_destroy(&shared, conn_id, "Max requests limit", true);
                        return;
                    }
                    Ok(_) => {
                        error!(conn_id, "BUG: Worker sent reply, none was expected");
                        idle_destroy(&shared, conn_id, "Worker is buggy", true);
                        return;
                    }
                    Err(_) => {
                        idle_destroy(&shared, conn_id, "Worker process died unexpectedly", true);
                        return;
                    }
                },
                IdleOutcome::IdleTimeout => {
                    let mut st = shared.state.lock().unwrap();
                    st.idle -= 1;
                    if st.idle >= 1 {
                        // keep one spare worker alive
                        st.total -= 1;
                        debug!(conn_id, "idle worker reaped");
                        if let Some(m) = &shared.metrics {
                            Metrics::inc(&m.worker_destroys);
                        }
                        return;
                    }
                    continue;
                }
            }
        };

        // queue-age warning, rate limited
        let queued_for = req.created.elapsed();
        if queued_for >= QUEUE_WARN_AGE {
            let mut st = shared.state.lock().unwrap();
            let warn_due = st
                .last_queue_warn
                .is_none_or(|t| t.elapsed() >= QUEUE_WARN_MIN_INTERVAL);
            if warn_due {
                st.last_queue_warn = Some(Instant::now());
                warn!(
                    queued_secs = queued_for.as_secs(),
                    queue_left = st.queue.len(),
                    "auth workers: request was queued too long"
                );
            }
        }

        id_counter += 1;
        if let Some(m) = &shared.metrics {
            Metrics::inc(&m.worker_requests);
        }
        match run_request(&shared, conn_id, &mut reader, &mut writer, id_counter, req).await {
            RequestOutcome::Served => continue,
            RequestOutcome::ServedThenRetire => {
                info!(conn_id, "worker requested shutdown");
                destroy(&shared, true);
                return;
            }
            RequestOutcome::ConnectionDead => return,
        }
    }
}

fn idle_destroy(shared: &Arc<Shared>, conn_id: u64, reason: &str, restart: bool) {
    debug!(conn_id, reason, "worker connection closed while idle");
    {
        let mut st = shared.state.lock().unwrap();
        st.idle -= 1;
    }
    destroy(shared, restart);
}

enum RequestOutcome {
    Served,
    /// worker sent SHUTDOWN during the exchange; destroy once idle
    ServedThenRetire,
    ConnectionDead,
}

async fn run_request(
    shared: &Arc<Shared>,
    conn_id: u64,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    id: u32,
    req: QueuedRequest,
) -> RequestOutcome {
    let line = format!("{id}\t{}\n", req.data);
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        error!(conn_id, error = %e, "Aborted: Worker process died unexpectedly");
        let _ = req.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
        destroy(shared, true);
        return RequestOutcome::ConnectionDead;
    }

    let deadline = tokio::time::Instant::now() + shared.lookup_timeout;
    let mut retire = false;
    loop {
        let line = tokio::select! {
            l = lineio::read_line(reader) => l,
            _ = tokio::time::sleep_until(deadline) => {
                error!(conn_id, "Aborted: Lookup timed out");
                if let Some(m) = &shared.metrics {
                    Metrics::inc(&m.worker_timeouts);
                }
                let _ = req.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
                destroy(shared, true);
                return RequestOutcome::ConnectionDead;
            }
        };
        let line = match line {
            Ok(l) => l,
            Err(LineError::TooLong) => {
                error!(
                    conn_id,
                    "BUG: Auth worker sent us more than {} bytes",
                    lineio::MAX_LINE_LENGTH
                );
                let _ = req.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
                destroy(shared, true);
                return RequestOutcome::ConnectionDead;
            }
            Err(_) => {
                error!(conn_id, "Aborted: Worker process died unexpectedly");
                let _ = req.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
                destroy(shared, true);
                return RequestOutcome::ConnectionDead;
            }
        };

        if line == "SHUTDOWN" {
            retire = true;
            continue;
        }
        let Some((id_str, payload)) = line.split_once('\t') else {
            continue;
        };
        match id_str.parse::<u32>() {
            Ok(reply_id) if reply_id == id => {
                let _ = req.reply_tx.send(payload.to_string());
                return if retire {
                    RequestOutcome::ServedThenRetire
                } else {
                    RequestOutcome::Served
                };
            }
            _ => {
                error!(conn_id, reply_id = id_str, expected = id,
                    "BUG: Worker sent reply with unexpected id");
                let _ = req.reply_tx.send(INTERNAL_FAILURE_REPLY.to_string());
                destroy(shared, true);
                return RequestOutcome::ConnectionDead;
            }
        }
    }
}
