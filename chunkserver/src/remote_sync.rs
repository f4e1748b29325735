// Copyright 2024 Oxide Computer Company

//! Per-peer forwarding queues for daisy-chained writes.
//!
//! Each replication peer has one entry holding ops queued for forwarding
//! and a finish request. Work queued from a non-owning thread drains on
//! the owning worker's tick; once the peer has failed, everything left
//! completes back to its client with host-unreachable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ferrite_common::status;

use crate::dispatcher::{current_worker, WorkerQueues, WorkerShared};
use crate::ops::Op;
use crate::server::{post_op_done, ServerInner, ServerState};
use crate::{SyncId, WorkerId};

/// Session with one replication peer; implemented by the peer connection
/// layer, mocked in tests.
pub trait SyncTarget: Send + Sync {
    /// Hands the op to the peer session. On success the session owns the
    /// op and will post its completion; on failure the op comes back for
    /// host-unreachable handling.
    fn forward(&self, op: Box<Op>) -> Result<(), Box<Op>>;
}

pub(crate) struct RemoteSyncEntry {
    worker: WorkerId,
    target: Arc<dyn SyncTarget>,
    pending: VecDeque<Box<Op>>,
    /// Set once the owner asked for teardown; the registry keeps the
    /// entry alive until the queued work has drained.
    finish_requested: bool,
    in_sync_queue: bool,
    failed: bool,
}

#[derive(Default)]
pub struct SyncRegistry {
    entries: HashMap<SyncId, RemoteSyncEntry>,
    next: u64,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(
        &mut self,
        worker: WorkerId,
        target: Arc<dyn SyncTarget>,
    ) -> SyncId {
        let id = SyncId(self.next);
        self.next += 1;
        self.entries.insert(
            id,
            RemoteSyncEntry {
                worker,
                target,
                pending: VecDeque::new(),
                finish_requested: false,
                in_sync_queue: false,
                failed: false,
            },
        );
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn mark_failed(&mut self, sid: SyncId) {
        if let Some(e) = self.entries.get_mut(&sid) {
            e.failed = true;
        }
    }
}

/// Queues an op for forwarding. The owning worker with nothing pending
/// forwards directly; everyone else queues and wakes the owner.
pub(crate) fn enqueue(
    state: &mut ServerState,
    inner: &ServerInner,
    sid: SyncId,
    op: Box<Op>,
) {
    let mut unreachable = None;
    match state.syncs.entries.get_mut(&sid) {
        None => unreachable = Some(op),
        Some(e) if e.finish_requested || e.failed => unreachable = Some(op),
        Some(e) if current_worker() == Some(e.worker) && e.pending.is_empty() => {
            if let Err(op) = e.target.forward(op) {
                e.failed = true;
                unreachable = Some(op);
            }
        }
        Some(e) => {
            let first = e.pending.is_empty();
            e.pending.push_back(op);
            if first && !e.in_sync_queue {
                e.in_sync_queue = true;
                let w = e.worker;
                state.workers[w.0].sync.push(sid);
                inner.wakers[w.0].wake();
            }
        }
    }
    return_unreachable(state, inner, unreachable);
}

fn return_unreachable(
    state: &mut ServerState,
    inner: &ServerInner,
    op: Option<Box<Op>>,
) {
    if let Some(mut op) = op {
        op.status = -status::EHOSTUNREACH;
        op.status_msg = "lost connection to peer".to_string();
        post_op_done(state, inner, op);
    }
}

/// Requests teardown of a peer entry. With nothing queued on the owning
/// worker the entry retires on the spot; otherwise the finish request
/// rides the sync queue behind the queued ops.
pub(crate) fn finish(
    syncs: &mut SyncRegistry,
    workers: &mut [WorkerQueues],
    wakers: &[Arc<WorkerShared>],
    sid: SyncId,
) {
    let Some(e) = syncs.entries.get_mut(&sid) else {
        return;
    };
    if current_worker() == Some(e.worker)
        && e.pending.is_empty()
        && !e.in_sync_queue
    {
        syncs.entries.remove(&sid);
        return;
    }
    if e.finish_requested {
        return;
    }
    e.finish_requested = true;
    if !e.in_sync_queue {
        e.in_sync_queue = true;
        let w = e.worker;
        workers[w.0].sync.push(sid);
        wakers[w.0].wake();
    }
}

/// Drains a peer entry on its owning worker's tick: forward queued ops
/// until the peer fails, complete the rest with host-unreachable, then
/// apply a pending finish.
pub(crate) fn run_pending(
    state: &mut ServerState,
    inner: &ServerInner,
    sid: SyncId,
) {
    let (ops, finish_now, mut ok) = {
        let Some(e) = state.syncs.entries.get_mut(&sid) else {
            return;
        };
        e.in_sync_queue = false;
        (
            std::mem::take(&mut e.pending),
            e.finish_requested,
            !e.failed,
        )
    };
    let mut failed_ops = Vec::new();
    for op in ops {
        if !ok {
            failed_ops.push(op);
            continue;
        }
        let target = state
            .syncs
            .entries
            .get(&sid)
            .map(|e| Arc::clone(&e.target));
        match target {
            Some(t) => {
                if let Err(op) = t.forward(op) {
                    ok = false;
                    if let Some(e) = state.syncs.entries.get_mut(&sid) {
                        e.failed = true;
                    }
                    failed_ops.push(op);
                }
            }
            None => failed_ops.push(op),
        }
    }
    for mut op in failed_ops {
        op.status = -status::EHOSTUNREACH;
        op.status_msg = "lost connection to peer".to_string();
        post_op_done(state, inner, op);
    }
    if finish_now {
        state.syncs.entries.remove(&sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_sm::Event;
    use crate::server::dispatch_client_event;
    use crate::test_util::{encode_request, mock_server};
    use ferrite_protocol::{Request, RequestHeader, ResponseDecoder};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio_util::codec::Decoder;

    struct MockTarget {
        refuse: AtomicBool,
        sent: Mutex<Vec<Box<Op>>>,
    }

    impl MockTarget {
        fn new() -> Arc<Self> {
            Arc::new(MockTarget {
                refuse: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl SyncTarget for MockTarget {
        fn forward(&self, op: Box<Op>) -> Result<(), Box<Op>> {
            if self.refuse.load(Ordering::SeqCst) {
                Err(op)
            } else {
                self.sent.lock().unwrap().push(op);
                Ok(())
            }
        }
    }

    /// Runs a forwarded write prepare through a hand-driven client so the
    /// op is a genuine queue entry held by the mock executor.
    fn submitted_write(
        server: &crate::server::Server,
    ) -> (crate::ClientId, Arc<crate::conn::ConnShared>) {
        let (cid, shared) = server.test_add_client(WorkerId(0));
        let payload = b"forwarded write payload";
        let frame = encode_request(&RequestHeader {
            seq: 31,
            max_wait_ms: 0,
            body: Request::WritePrepareFwd {
                chunk_id: 12,
                chunk_version: 1,
                offset: 0,
                num_bytes: payload.len() as i64,
                hash: ferrite_common::integrity_hash(&[payload]),
                reply_requested: true,
                forward: vec!["127.0.0.1:20100".parse().unwrap()],
            },
        });
        {
            let mut s = shared.state.lock().unwrap();
            s.in_buf.extend_from_slice(&frame);
            s.in_buf.extend_from_slice(payload);
        }
        server.test_with_state(Some(WorkerId(0)), |state, inner| {
            dispatch_client_event(
                state,
                inner,
                cid,
                Event::NetRead {
                    parsed: None,
                    payload_hash: None,
                },
            );
        });
        (cid, shared)
    }

    #[test]
    fn non_owning_enqueue_parks_until_tick() {
        let (server, executor, _appender, _counters) = mock_server(1 << 20);
        let (cid, _shared) = submitted_write_parts(&server, &executor);
        let target = MockTarget::new();
        let sid = server.add_sync_peer(cid, target.clone()).unwrap();
        let op = executor.take().pop().unwrap();

        server.test_with_state(None, |state, inner| {
            enqueue(state, inner, sid, op);
            assert_eq!(state.workers[0].sync, vec![sid]);
        });
        assert!(target.sent.lock().unwrap().is_empty());

        server.test_with_state(Some(WorkerId(0)), |state, inner| {
            let syncs = std::mem::take(&mut state.workers[0].sync);
            for sid in syncs {
                run_pending(state, inner, sid);
            }
        });
        assert_eq!(target.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn owning_thread_forwards_directly() {
        let (server, executor, _appender, _counters) = mock_server(1 << 20);
        let (cid, _shared) = submitted_write_parts(&server, &executor);
        let target = MockTarget::new();
        let sid = server.add_sync_peer(cid, target.clone()).unwrap();
        let op = executor.take().pop().unwrap();

        server.test_with_state(Some(WorkerId(0)), |state, inner| {
            enqueue(state, inner, sid, op);
            assert!(state.workers[0].sync.is_empty());
        });
        assert_eq!(target.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_peer_completes_ops_with_ehostunreach() {
        let (server, executor, _appender, _counters) = mock_server(1 << 20);
        let (cid, shared) = submitted_write_parts(&server, &executor);
        let target = MockTarget::new();
        target.refuse.store(true, Ordering::SeqCst);
        let sid = server.add_sync_peer(cid, target).unwrap();
        let op = executor.take().pop().unwrap();

        server.test_with_state(None, |state, inner| {
            enqueue(state, inner, sid, op);
        });
        server.test_with_state(Some(WorkerId(0)), |state, inner| {
            let syncs = std::mem::take(&mut state.workers[0].sync);
            for sid in syncs {
                run_pending(state, inner, sid);
            }
        });
        // the op completed back to its client with host unreachable
        let mut out = shared.state.lock().unwrap().out_buf.split();
        let resp = ResponseDecoder::new().decode(&mut out).unwrap().unwrap();
        assert_eq!(resp.0.seq, 31);
        assert_eq!(resp.0.status, -status::EHOSTUNREACH);
    }

    #[test]
    fn finish_rides_behind_queued_work() {
        let (server, executor, _appender, _counters) = mock_server(1 << 20);
        let (cid, _shared) = submitted_write_parts(&server, &executor);
        let target = MockTarget::new();
        let sid = server.add_sync_peer(cid, target.clone()).unwrap();
        let op = executor.take().pop().unwrap();

        server.test_with_state(None, |state, inner| {
            enqueue(state, inner, sid, op);
            finish(&mut state.syncs, &mut state.workers, &inner.wakers, sid);
            // queued exactly once despite op then finish
            assert_eq!(state.workers[0].sync, vec![sid]);
            assert_eq!(state.syncs.len(), 1);
        });
        server.test_with_state(Some(WorkerId(0)), |state, inner| {
            run_pending(state, inner, sid);
            assert!(state.syncs.is_empty());
        });
        // the queued op still made it out before the finish applied
        assert_eq!(target.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn disconnect_retires_idle_peer_entry() {
        let (server, executor, _appender, _counters) = mock_server(1 << 20);
        let (cid, shared) = submitted_write_parts(&server, &executor);
        let target = MockTarget::new();
        let _sid = server.add_sync_peer(cid, target).unwrap();

        // retire the in-flight write first so teardown can finish
        let op = executor.take().pop().unwrap();
        server.test_with_state(Some(WorkerId(0)), |state, inner| {
            dispatch_client_event(state, inner, cid, Event::CmdDone(op));
            dispatch_client_event(state, inner, cid, Event::NetError);
            assert!(state.syncs.is_empty());
            assert!(!state.clients.contains_key(&cid));
        });
        assert!(shared.state.lock().unwrap().dead);
    }

    fn submitted_write_parts(
        server: &crate::server::Server,
        executor: &crate::test_util::MockExecutor,
    ) -> (crate::ClientId, Arc<crate::conn::ConnShared>) {
        let (cid, shared) = submitted_write(server);
        assert_eq!(executor.len(), 1);
        (cid, shared)
    }
}
