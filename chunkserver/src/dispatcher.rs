// Copyright 2024 Oxide Computer Company

//! Worker thread pool that multiplexes client connections.
//!
//! Each worker owns a single-threaded runtime driving the socket tasks of
//! its connections. Producers anywhere in the server hand work across the
//! lock boundary through three per-worker queues (new connections,
//! pending completions, remote-sync work) and wake the worker only on the
//! empty-to-nonempty transition of its wakeup counter.
//!
//! Frame parsing and payload hashing happen on the owning worker before
//! the server lock is taken; every state mutation happens under it.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use slog::{debug, error, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::sleep_until;

use ferrite_common::{deadline_secs, integrity_hash};
use ferrite_protocol::{is_msg_avail, parse_command};

use crate::client_sm::{Event, PreParsed};
use crate::conn::{ConnShared, ConnState, Expect};
use crate::remote_sync;
use crate::server::{dispatch_client_event, ServerInner};
use crate::{ClientId, SyncId, WorkerId};

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// The worker on whose behalf this thread currently holds the server
/// lock, if any. Lets completion producers pick between delivering inline
/// and queueing a cross-thread hand-off.
pub(crate) fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(|c| c.get())
}

pub(crate) fn set_current_worker(w: Option<WorkerId>) {
    CURRENT_WORKER.with(|c| c.set(w));
}

/// Producer-visible half of one worker: the wake signal. The queues
/// themselves live in the locked server state.
#[derive(Debug, Default)]
pub struct WorkerShared {
    notify: Notify,
    wakeup_cnt: AtomicU32,
}

impl WorkerShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bumps the wakeup counter; only the zero-to-one transition signals
    /// the worker, so a burst of producers costs one wakeup.
    pub fn wake(&self) {
        if self.wakeup_cnt.fetch_add(1, Ordering::SeqCst) == 0 {
            self.notify.notify_one();
        }
    }

    fn take_wakeups(&self) -> u32 {
        self.wakeup_cnt.swap(0, Ordering::SeqCst)
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// A connection accepted by the listener, parked until the owning worker
/// attaches it to its event loop.
pub(crate) struct NewConn {
    pub id: ClientId,
    pub stream: TcpStream,
    pub shared: Arc<ConnShared>,
}

/// Hand-off queues of one worker. Appended under the server lock; drained
/// by the owning worker's tick.
#[derive(Default)]
pub struct WorkerQueues {
    pub(crate) add: Vec<NewConn>,
    pub(crate) run: Vec<ClientId>,
    pub(crate) sync: Vec<SyncId>,
    pub(crate) shutdown: bool,
}

/// Starts the worker threads. Each runs its own current-thread runtime
/// until shutdown is requested through its queue.
pub(crate) fn spawn_workers(
    inner: &Arc<ServerInner>,
    count: usize,
) -> anyhow::Result<Vec<std::thread::JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let inner = Arc::clone(inner);
        let handle = std::thread::Builder::new()
            .name(format!("client-worker-{}", i))
            .spawn(move || worker_main(inner, WorkerId(i)))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_main(inner: Arc<ServerInner>, wid: WorkerId) {
    let log = inner.ctx.log.new(slog::o!("worker" => wid.0));
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(log, "failed to build worker runtime: {:?}", e);
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, worker_loop(inner, wid, log));
}

async fn worker_loop(inner: Arc<ServerInner>, wid: WorkerId, log: Logger) {
    let shared = Arc::clone(&inner.wakers[wid.0]);
    loop {
        shared.notified().await;
        if shared.take_wakeups() == 0 {
            continue;
        }
        let mut flush_list: Vec<Arc<ConnShared>> = Vec::new();
        let shutdown;
        {
            let mut state = inner.lock_as(Some(wid));
            let q = &mut state.workers[wid.0];
            let adds = std::mem::take(&mut q.add);
            let runs = std::mem::take(&mut q.run);
            let syncs = std::mem::take(&mut q.sync);
            shutdown = q.shutdown;
            for nc in adds {
                spawn_connection(&inner, wid, nc);
            }
            for cid in runs {
                let Some(csm) = state.clients.get_mut(&cid) else {
                    continue;
                };
                let (mut done_ops, granted) = csm.take_run_pending();
                flush_list.push(csm.conn_shared());
                while let Some(op) = done_ops.pop_front() {
                    dispatch_client_event(
                        &mut state,
                        &inner,
                        cid,
                        Event::CmdDone(op),
                    );
                }
                if granted {
                    dispatch_client_event(&mut state, &inner, cid, Event::Granted);
                }
            }
            for sid in syncs {
                remote_sync::run_pending(&mut state, &inner, sid);
            }
            if shutdown {
                let owned: Vec<ClientId> = state
                    .clients
                    .iter()
                    .filter(|(_, c)| c.worker() == wid)
                    .map(|(id, _)| *id)
                    .collect();
                for id in owned {
                    dispatch_client_event(&mut state, &inner, id, Event::NetError);
                }
            }
        }
        // flushes are started with the lock dropped
        for conn in &flush_list {
            conn.flush.notify_one();
        }
        if shutdown {
            debug!(log, "worker shut down");
            return;
        }
    }
}

fn spawn_connection(inner: &Arc<ServerInner>, wid: WorkerId, nc: NewConn) {
    let (rd, wr) = nc.stream.into_split();
    tokio::task::spawn_local(connection_reader(
        Arc::clone(inner),
        wid,
        nc.id,
        rd,
        Arc::clone(&nc.shared),
    ));
    tokio::task::spawn_local(connection_writer(
        Arc::clone(inner),
        wid,
        nc.id,
        wr,
        nc.shared,
    ));
}

fn deliver(inner: &Arc<ServerInner>, wid: WorkerId, id: ClientId, ev: Event) {
    let mut state = inner.lock_as(Some(wid));
    dispatch_client_event(&mut state, inner, id, ev);
}

/// Builds the next read event if the buffered bytes are actionable,
/// parsing the header frame or hashing the payload while the server lock
/// is not held.
fn prepare_event(s: &ConnState) -> Option<Event> {
    match s.expect {
        Expect::Header => match is_msg_avail(&s.in_buf) {
            Ok(Some(n)) => {
                let parsed = parse_command(&s.in_buf[..n])
                    .ok()
                    .map(|header| PreParsed { cmd_len: n, header });
                Some(Event::NetRead {
                    parsed,
                    payload_hash: None,
                })
            }
            Ok(None) => None,
            // oversized frame; hand it to the state machine to reject
            Err(_) => Some(Event::NetRead {
                parsed: None,
                payload_hash: None,
            }),
        },
        Expect::Payload { need, hash } => {
            if s.in_buf.len() >= need {
                let payload_hash = if hash {
                    Some(integrity_hash(&[&s.in_buf[..need]]))
                } else {
                    None
                };
                Some(Event::NetRead {
                    parsed: None,
                    payload_hash,
                })
            } else {
                None
            }
        }
        Expect::Discard => {
            if s.in_buf.is_empty() {
                None
            } else {
                Some(Event::NetRead {
                    parsed: None,
                    payload_hash: None,
                })
            }
        }
    }
}

/// How many bytes the reader should pull from the socket right now.
fn read_budget(s: &ConnState) -> usize {
    if s.max_read_ahead == 0 {
        return 0;
    }
    match s.expect {
        Expect::Header => s.max_read_ahead,
        Expect::Payload { need, .. } => {
            need.saturating_sub(s.in_buf.len()).max(1)
        }
        Expect::Discard => s.max_read_ahead,
    }
}

async fn connection_reader(
    inner: Arc<ServerInner>,
    wid: WorkerId,
    id: ClientId,
    mut rd: OwnedReadHalf,
    shared: Arc<ConnShared>,
) {
    let mut scratch = vec![0u8; 64 * 1024];
    loop {
        let (budget, timeout_secs, stop, pending) = {
            let s = shared.state.lock().unwrap();
            if s.closed || s.dead {
                (0, 0, true, None)
            } else {
                let budget = read_budget(&s);
                // a paused connection gets no events, or a parked state
                // machine would see an endless run of spurious reads
                let pending = if budget > 0 { prepare_event(&s) } else { None };
                (budget, s.timeout_secs, false, pending)
            }
        };
        if stop {
            return;
        }
        if let Some(ev) = pending {
            deliver(&inner, wid, id, ev);
            continue;
        }
        if budget == 0 {
            // reads are paused; the inactivity clock still runs
            tokio::select! {
                _ = shared.plan.notified() => {}
                _ = sleep_until(deadline_secs(timeout_secs.max(1))) => {
                    deliver(&inner, wid, id, Event::InactivityTimeout);
                }
            }
            continue;
        }
        let want = budget.min(scratch.len());
        tokio::select! {
            res = rd.read(&mut scratch[..want]) => {
                match res {
                    Ok(0) => {
                        deliver(&inner, wid, id, Event::NetError);
                        return;
                    }
                    Ok(n) => {
                        shared
                            .state
                            .lock()
                            .unwrap()
                            .in_buf
                            .extend_from_slice(&scratch[..n]);
                    }
                    Err(_) => {
                        deliver(&inner, wid, id, Event::NetError);
                        return;
                    }
                }
            }
            _ = shared.plan.notified() => {}
            _ = sleep_until(deadline_secs(timeout_secs.max(1))) => {
                deliver(&inner, wid, id, Event::InactivityTimeout);
            }
        }
    }
}

async fn connection_writer(
    inner: Arc<ServerInner>,
    wid: WorkerId,
    id: ClientId,
    mut wr: OwnedWriteHalf,
    shared: Arc<ConnShared>,
) {
    loop {
        shared.flush.notified().await;
        loop {
            let chunk = {
                let mut s = shared.state.lock().unwrap();
                if s.dead {
                    return;
                }
                if s.out_buf.is_empty() {
                    if s.closed {
                        return;
                    }
                    break;
                }
                let c = s.out_buf.split().freeze();
                s.inflight_write = c.len();
                c
            };
            let res = wr.write_all(&chunk).await;
            {
                let mut s = shared.state.lock().unwrap();
                s.inflight_write = 0;
            }
            match res {
                Ok(()) => deliver(&inner, wid, id, Event::NetWrote),
                Err(_) => {
                    deliver(&inner, wid, id, Event::NetError);
                    return;
                }
            }
        }
    }
}
