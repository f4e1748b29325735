// Copyright 2024 Oxide Computer Company

//! Per-connection protocol state machine.
//!
//! One `ClientSM` drives a client connection from framed request to
//! ordered response: parse, admit against the buffer pools, submit to the
//! executor, reply in FIFO order, and clean up on failure. All methods
//! run under the server lock; socket bytes come and go through the
//! connection's own [`ConnState`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use slog::{debug, error, info, Logger};
use tokio_util::codec::Encoder;

use ferrite_common::{integrity_hash, status};
use ferrite_protocol::{
    is_msg_avail, parse_command, ChunkId, Request, RequestHeader, RpcEncoder,
    MAX_RPC_HEADER_LEN,
};

use crate::admission::{exceeds_max_wait, io_request_bytes};
use crate::buffer_pool::{BufferPool, DevicePools, GrantEvent};
use crate::conn::{ConnShared, ConnState, Expect};
use crate::context::{ServerContext, Submit};
use crate::dispatcher::{WorkerQueues, WorkerShared};
use crate::ops::{show_op, Op};
use crate::remote_sync::{self, SyncRegistry};
use crate::{ClientId, DeviceId, SyncId, WorkerId};

/// Header parsed off the server lock by the connection's reader.
#[derive(Debug)]
pub(crate) struct PreParsed {
    pub cmd_len: usize,
    pub header: RequestHeader,
}

#[derive(Debug)]
pub(crate) enum Event {
    NetRead {
        parsed: Option<PreParsed>,
        payload_hash: Option<u64>,
    },
    NetWrote,
    CmdDone(Box<Op>),
    Granted,
    InactivityTimeout,
    NetError,
}

/// Mutable server state an event dispatch may touch, split out so the
/// borrow of the client map stays separate.
pub(crate) struct Env<'a> {
    pub buffers: &'a mut BufferPool,
    pub dev_buffers: &'a mut DevicePools,
    pub syncs: &'a mut SyncRegistry,
    pub workers: &'a mut [WorkerQueues],
    pub wakers: &'a [Arc<WorkerShared>],
    /// Deferred-grant callbacks produced during this dispatch; routed to
    /// their owners once the current event completes.
    pub grants: &'a mut Vec<GrantEvent>,
    pub ctx: &'a ServerContext,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SmState {
    Active,
    /// Connection is gone; retire in-flight ops, then self destruct.
    Terminating,
    Dead,
}

/// A submitted op awaiting its turn to respond.
#[derive(Debug)]
struct InFlight {
    seq: u64,
    /// Bytes held from the global pool for this op.
    reserved: i64,
    depending: bool,
    /// The completion, once the executor hands the op back.
    op: Option<Box<Op>>,
}

/// A write sync parked until its predecessor completes.
#[derive(Debug)]
struct OpPair {
    pred_seq: u64,
    dependent: Box<Op>,
}

enum WriteAttempt {
    Ready(Box<Op>),
    Parked,
    Rejected,
}

pub(crate) struct ClientSM {
    id: ClientId,
    worker: WorkerId,
    instance: u64,
    shared: Arc<ConnShared>,
    good: bool,
    state: SmState,

    /// An op blocked on buffers or on more payload bytes. At most one.
    cur_op: Option<Box<Op>>,
    /// Device pool currently blocking `cur_op`, if the device tier is the
    /// one that deferred us.
    dev_buf_mgr: Option<DeviceId>,

    ops: VecDeque<InFlight>,
    pending_ops: VecDeque<OpPair>,
    pending_submit: VecDeque<Box<Op>>,
    /// Completions produced inline (admission failures, synchronous
    /// executor returns), drained at the top of the dispatch loop.
    ready: VecDeque<Box<Op>>,

    reservations: HashMap<(ChunkId, i64), i64>,
    remote_syncers: Vec<SyncId>,

    prev_num_to_write: i64,
    recursion_cnt: u32,
    discard_byte_cnt: i64,

    // dispatcher hand-off, mutated by producers under the server lock
    queued_done: VecDeque<Box<Op>>,
    granted_flag: bool,
    in_run_queue: bool,

    log: Logger,
}

impl ClientSM {
    pub(crate) fn new(
        id: ClientId,
        worker: WorkerId,
        instance: u64,
        shared: Arc<ConnShared>,
        log: Logger,
    ) -> Self {
        ClientSM {
            id,
            worker,
            instance,
            shared,
            good: true,
            state: SmState::Active,
            cur_op: None,
            dev_buf_mgr: None,
            ops: VecDeque::new(),
            pending_ops: VecDeque::new(),
            pending_submit: VecDeque::new(),
            ready: VecDeque::new(),
            reservations: HashMap::new(),
            remote_syncers: Vec::new(),
            prev_num_to_write: 0,
            recursion_cnt: 0,
            discard_byte_cnt: 0,
            queued_done: VecDeque::new(),
            granted_flag: false,
            in_run_queue: false,
            log,
        }
    }

    pub(crate) fn worker(&self) -> WorkerId {
        self.worker
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    pub(crate) fn conn_shared(&self) -> Arc<ConnShared> {
        self.shared.clone()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state == SmState::Dead
    }

    pub(crate) fn attach_syncer(&mut self, sid: SyncId) {
        self.remote_syncers.push(sid);
    }

    // Dispatcher hand-off: a completion queued by a non-owning thread.
    // Returns true when this is the first pending item and no granted
    // callback already put us on the run queue.
    pub(crate) fn enqueue_done(&mut self, op: Box<Op>) -> bool {
        let first = self.queued_done.is_empty() && !self.granted_flag;
        self.queued_done.push_back(op);
        first
    }

    pub(crate) fn set_granted(&mut self) -> bool {
        if self.granted_flag {
            return false;
        }
        self.granted_flag = true;
        self.queued_done.is_empty()
    }

    pub(crate) fn has_queued_done(&self) -> bool {
        !self.queued_done.is_empty()
    }

    pub(crate) fn in_run_queue(&self) -> bool {
        self.in_run_queue
    }

    pub(crate) fn set_in_run_queue(&mut self, v: bool) {
        self.in_run_queue = v;
    }

    pub(crate) fn take_run_pending(&mut self) -> (VecDeque<Box<Op>>, bool) {
        self.in_run_queue = false;
        let granted = self.granted_flag;
        self.granted_flag = false;
        (std::mem::take(&mut self.queued_done), granted)
    }

    /// Generic event entry point. Inline completions drain here instead
    /// of by recursing, and the flush-and-timeout tail runs only at the
    /// outermost level.
    pub(crate) fn handle_event(
        &mut self,
        ev: Event,
        io: &mut ConnState,
        env: &mut Env<'_>,
    ) {
        self.recursion_cnt += 1;
        self.dispatch_inner(ev, io, env);
        if self.recursion_cnt == 1 {
            while let Some(op) = self.ready.pop_front() {
                self.dispatch_inner(Event::CmdDone(op), io, env);
            }
            self.finish_dispatch(io, env);
        }
        self.recursion_cnt -= 1;
    }

    fn dispatch_inner(&mut self, ev: Event, io: &mut ConnState, env: &mut Env<'_>) {
        match self.state {
            SmState::Active => self.active_event(ev, io, env),
            SmState::Terminating | SmState::Dead => {
                self.terminate_event(ev, io, env)
            }
        }
    }

    fn active_event(&mut self, ev: Event, io: &mut ConnState, env: &mut Env<'_>) {
        match ev {
            Event::NetRead {
                parsed,
                payload_hash,
            } => self.net_read(parsed, payload_hash, io, env),
            Event::NetWrote => self.net_wrote(io, env),
            Event::CmdDone(op) => self.cmd_done(op, io, env),
            Event::Granted => self.handle_granted(io, env),
            Event::InactivityTimeout => {
                self.net_error("inactivity timeout", io, env)
            }
            Event::NetError => self.net_error("network error", io, env),
        }
    }

    fn close_connection(&mut self, io: &mut ConnState) {
        self.good = false;
        io.closed = true;
    }

    fn net_read(
        &mut self,
        mut parsed: Option<PreParsed>,
        mut payload_hash: Option<u64>,
        io: &mut ConnState,
        env: &mut Env<'_>,
    ) {
        if env.buffers.is_waiting(self.id) || self.dev_buf_mgr.is_some() {
            debug!(
                self.log,
                "spurious read: cur op: {} buffers: {} waiting for {}io buffers",
                show_op(&self.cur_op),
                env.buffers.byte_count(self.id),
                if self.dev_buf_mgr.is_some() { "dev. " } else { "" }
            );
            io.max_read_ahead = 0;
            return;
        }
        let mut cmd_len = 0usize;
        let mut got_cmd = false;
        let mut oversize = false;
        loop {
            if self.cur_op.is_none() {
                cmd_len = match is_msg_avail(&io.in_buf) {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        cmd_len = 0;
                        break;
                    }
                    Err(_) => {
                        oversize = true;
                        break;
                    }
                };
            } else {
                cmd_len = 0;
            }
            got_cmd =
                self.handle_client_cmd(cmd_len, parsed.take(), payload_hash.take(), io, env);
            if !got_cmd {
                break;
            }
            cmd_len = 0;
        }
        if self.cur_op.is_none() {
            if oversize || io.in_buf.len() > MAX_RPC_HEADER_LEN {
                error!(
                    self.log,
                    "exceeded max request header size: {} limit: {}, closing connection",
                    io.in_buf.len(),
                    MAX_RPC_HEADER_LEN
                );
                env.ctx.counters.bad_request_header();
            } else if cmd_len > 0 && !got_cmd {
                error!(
                    self.log,
                    "failed to parse request, closing connection; header size: {} read available: {}",
                    cmd_len,
                    io.in_buf.len()
                );
                env.ctx.counters.bad_request();
            } else {
                return;
            }
            io.in_buf.clear();
            self.close_connection(io);
        }
    }

    /// Parses one command out of the input buffer, or resumes the parked
    /// one, and runs it through admission and submission. Returns false
    /// when parsing failed or the op parked again.
    fn handle_client_cmd(
        &mut self,
        cmd_len: usize,
        pre_parsed: Option<PreParsed>,
        payload_hash: Option<u64>,
        io: &mut ConnState,
        env: &mut Env<'_>,
    ) -> bool {
        let resuming = self.cur_op.is_some();
        debug_assert!(if resuming { cmd_len == 0 } else { cmd_len > 0 });
        let mut op: Box<Op> = match self.cur_op.take() {
            Some(op) => op,
            None => {
                let header = match pre_parsed {
                    Some(p) if p.cmd_len == cmd_len => Ok(p.header),
                    _ => parse_command(&io.in_buf[..cmd_len]),
                };
                let header = match header {
                    Ok(h) => h,
                    Err(e) => {
                        error!(
                            self.log,
                            "invalid request: {:#} header size: {}", e, cmd_len
                        );
                        io.in_buf.advance(cmd_len);
                        return false;
                    }
                };
                io.in_buf.advance(cmd_len);
                Box::new(Op::new(header, env.ctx.clock.now_usec()))
            }
        };
        if !resuming && env.ctx.config.trace_request_response {
            debug!(self.log, "request: {}", op);
        }

        enum Collect {
            No,
            Write { align: usize, n: i64, fwd: bool },
        }
        let collect = match &op.body {
            Request::WritePrepare {
                offset, num_bytes, ..
            }
            | Request::WritePrepareFwd {
                offset, num_bytes, ..
            }
            | Request::Write {
                offset, num_bytes, ..
            } => Collect::Write {
                align: offset.rem_euclid(crate::buffer_pool::DEFAULT_BUFFER_SIZE)
                    as usize,
                n: *num_bytes,
                fwd: false,
            },
            Request::RecordAppend {
                num_bytes, chunk_id, ..
            } => {
                let (align, fwd) = if resuming {
                    (0, false)
                } else {
                    env.ctx.appender.alignment_and_forward_flag(*chunk_id)
                };
                Collect::Write {
                    align,
                    n: *num_bytes,
                    fwd,
                }
            }
            _ => Collect::No,
        };

        let mut buffer_bytes: i64 = -1;
        if let Collect::Write { align, n, fwd } = collect {
            op = match self.get_write_op(op, align, n, fwd, resuming, payload_hash, io, env)
            {
                WriteAttempt::Ready(op) => op,
                WriteAttempt::Parked | WriteAttempt::Rejected => return false,
            };
            buffer_bytes = if op.status >= 0 {
                io_request_bytes(n, fwd)
            } else {
                0
            };
        }

        debug!(self.log, "got: {}", op);
        let mut submit_response = op.status < 0;

        // Chunk reads hold their requested bytes plus one buffer for the
        // reply header.
        if !submit_response && buffer_bytes < 0 {
            if let Some((req_bytes, chunk_id)) = op.chunk_read_info() {
                if req_bytes >= 0 {
                    buffer_bytes = req_bytes + io_request_bytes(0, false);
                    let now = env.ctx.clock.now_usec();
                    if !resuming || self.dev_buf_mgr.is_some() {
                        if !resuming {
                            self.dev_buf_mgr = env.dev_buffers.device_with_pool(
                                env.ctx.chunks.device_of(chunk_id),
                            );
                            let over = env.buffers.is_over_quota(self.id, buffer_bytes)
                                || self.dev_buf_mgr.map_or(false, |d| {
                                    env.dev_buffers.is_over_quota(
                                        d,
                                        self.id,
                                        buffer_bytes,
                                    )
                                });
                            if over {
                                error!(
                                    self.log,
                                    "bad read request size: {} buffers: {} over buffer quota {}",
                                    buffer_bytes,
                                    env.buffers.byte_count(self.id),
                                    op
                                );
                                op.fail(-status::EAGAIN, "over io buffers quota");
                                self.dev_buf_mgr = None;
                                submit_response = true;
                                // nothing was reserved; only the reply
                                // bytes will be charged
                                buffer_bytes = 0;
                            } else {
                                op.pending_reserve = buffer_bytes;
                                if let Some(d) = self.dev_buf_mgr {
                                    if env
                                        .dev_buffers
                                        .get_for_disk_io(d, self.id, buffer_bytes, now)
                                        .unwrap_or(true)
                                    {
                                        op.dev_charge = Some(d);
                                        self.dev_buf_mgr = None;
                                    }
                                }
                                let granted = self.dev_buf_mgr.is_none()
                                    && env.buffers.get_for_disk_io(
                                        self.id,
                                        buffer_bytes,
                                        now,
                                    );
                                if !granted {
                                    submit_response = self
                                        .fail_if_exceeds_wait(&mut op, buffer_bytes, env);
                                    self.log_denied(&op, buffer_bytes, submit_response, env);
                                    if !submit_response {
                                        self.cur_op = Some(op);
                                        io.max_read_ahead = 0;
                                        return false;
                                    }
                                    buffer_bytes = 0;
                                }
                            }
                        } else {
                            // device tier granted while we were parked;
                            // record the hold, then try the global tier
                            op.dev_charge = self.dev_buf_mgr.take();
                            op.pending_reserve = buffer_bytes;
                            if !env.buffers.get_for_disk_io(self.id, buffer_bytes, now) {
                                submit_response =
                                    self.fail_if_exceeds_wait(&mut op, buffer_bytes, env);
                                self.log_denied(&op, buffer_bytes, submit_response, env);
                                if !submit_response {
                                    self.cur_op = Some(op);
                                    io.max_read_ahead = 0;
                                    return false;
                                }
                                buffer_bytes = 0;
                            }
                        }
                    }
                    io.max_read_ahead = MAX_RPC_HEADER_LEN;
                    if !submit_response && !env.ctx.chunks.is_chunk_readable(chunk_id) {
                        // no dirty reads
                        error!(
                            self.log,
                            "read request for chunk: {} denied: chunk not readable",
                            chunk_id
                        );
                        op.fail(-status::EAGAIN, "chunk not readable");
                        submit_response = true;
                    }
                }
            }
        }

        // Everything else holds one buffer, so a client that queues many
        // small requests without reading replies cannot run the server
        // out of memory. Append status inquiries on a completely idle
        // connection ride free to speed up append recovery.
        if buffer_bytes < 0 {
            let free_pass = matches!(op.body, Request::GetRecordAppendStatus { .. })
                && !resuming
                && self.ops.is_empty()
                && env.buffers.byte_count(self.id) <= 0
                && !env.buffers.is_waiting(self.id)
                && io.out_buf.is_empty()
                && io.inflight_write == 0
                && io.in_buf.is_empty();
            buffer_bytes = if free_pass {
                0
            } else {
                io_request_bytes(0, false)
            };
            if !resuming {
                let now = env.ctx.clock.now_usec();
                op.pending_reserve = buffer_bytes;
                if !env.buffers.get(self.id, buffer_bytes, now) {
                    submit_response =
                        self.fail_if_exceeds_wait(&mut op, buffer_bytes, env);
                    self.log_denied(&op, buffer_bytes, submit_response, env);
                    if !submit_response {
                        self.cur_op = Some(op);
                        io.max_read_ahead = 0;
                        return false;
                    }
                    buffer_bytes = 0;
                }
            }
            io.max_read_ahead = MAX_RPC_HEADER_LEN;
        }

        if matches!(op.body, Request::WriteSync { .. }) && !submit_response {
            // a write sync rides behind the last unreplied write
            let pred = self
                .ops
                .iter()
                .rev()
                .find(|e| e.depending)
                .map(|e| e.seq);
            if let Some(pred_seq) = pred {
                debug!(
                    self.log,
                    "keeping write-sync ({}) pending and depends on {}",
                    op.seq,
                    pred_seq
                );
                op.client = Some(self.id);
                // the dependent re-enters the queue with no reservation,
                // so give its admission hold back now
                let now = env.ctx.clock.now_usec();
                let grants = env.buffers.put(self.id, buffer_bytes, now);
                env.grants.extend(grants);
                self.pending_ops.push_back(OpPair {
                    pred_seq,
                    dependent: op,
                });
                return true;
            }
            debug!(
                self.log,
                "write-sync is being pushed down; no writes left, {} ops left",
                self.ops.len()
            );
        }

        op.client = Some(self.id);
        let depending = op.is_depending_type();
        env.ctx.counters.op_inserted();
        self.ops.push_back(InFlight {
            seq: op.seq,
            reserved: buffer_bytes,
            depending,
            op: None,
        });
        if submit_response {
            self.ready.push_back(op);
        } else {
            self.submit_op(op, env);
        }
        true
    }

    /// Admits a write-family op and collects its payload out of the input
    /// buffer. May park (buffers or bytes outstanding), reject fatally,
    /// or switch into discard mode for an oversize-wait failure.
    #[allow(clippy::too_many_arguments)]
    fn get_write_op(
        &mut self,
        mut op: Box<Op>,
        align: usize,
        num_bytes: i64,
        forward: bool,
        resuming: bool,
        payload_hash: Option<u64>,
        io: &mut ConnState,
        env: &mut Env<'_>,
    ) -> WriteAttempt {
        let n_avail = io.in_buf.len() as i64;
        let now = env.ctx.clock.now_usec();
        if !resuming || self.dev_buf_mgr.is_some() {
            let buffer_bytes = io_request_bytes(num_bytes, forward);
            if !resuming {
                self.dev_buf_mgr = env
                    .dev_buffers
                    .device_with_pool(env.ctx.chunks.device_of(op.body.chunk_id()));
                let dev_quota = self
                    .dev_buf_mgr
                    .and_then(|d| env.dev_buffers.max_client_quota(d))
                    .unwrap_or(1 << 31);
                let limit = dev_quota
                    .min(env.buffers.max_client_quota())
                    .min(env.ctx.chunks.max_io_request_size());
                let over_quota = env.ctx.config.close_write_on_pending_over_quota
                    && (env.buffers.is_over_quota(self.id, buffer_bytes)
                        || self.dev_buf_mgr.map_or(false, |d| {
                            env.dev_buffers.is_over_quota(d, self.id, buffer_bytes)
                        }));
                if num_bytes < 0 || num_bytes > limit || over_quota {
                    // Over quota can occur if the quota is set unreasonably
                    // low, or if a client mixes reads and writes on one
                    // connection.
                    error!(
                        self.log,
                        "seq: {} invalid write request size: {} buffers: {}{}, closing connection",
                        op.seq,
                        buffer_bytes,
                        env.buffers.byte_count(self.id),
                        if over_quota { " over quota" } else { "" }
                    );
                    self.dev_buf_mgr = None;
                    return WriteAttempt::Rejected;
                }
                self.discard_byte_cnt = 0;
                op.pending_reserve = buffer_bytes;
                if let Some(d) = self.dev_buf_mgr {
                    if env
                        .dev_buffers
                        .get_for_disk_io(d, self.id, buffer_bytes, now)
                        .unwrap_or(true)
                    {
                        op.dev_charge = Some(d);
                        self.dev_buf_mgr = None;
                    }
                }
            } else {
                // the device tier granted while we were parked
                op.dev_charge = self.dev_buf_mgr.take();
                op.pending_reserve = buffer_bytes;
            }
            let granted = self.dev_buf_mgr.is_none()
                && env.buffers.get_for_disk_io(self.id, buffer_bytes, now);
            if !granted {
                let fail = num_bytes
                    <= env.ctx.config.max_req_size_discard - n_avail
                    && self.fail_if_exceeds_wait(&mut op, buffer_bytes, env);
                self.log_denied(&op, buffer_bytes, fail, env);
                if fail {
                    self.discard_byte_cnt = num_bytes;
                } else {
                    self.cur_op = Some(op);
                    io.max_read_ahead = 0;
                    return WriteAttempt::Parked;
                }
            }
        }
        if self.discard_byte_cnt > 0 {
            let take = self.discard_byte_cnt.min(io.in_buf.len() as i64) as usize;
            io.in_buf.advance(take);
            self.discard_byte_cnt -= take as i64;
            if self.discard_byte_cnt > 0 {
                io.max_read_ahead = self
                    .discard_byte_cnt
                    .min(2 * MAX_RPC_HEADER_LEN as i64)
                    as usize;
                io.expect = Expect::Discard;
                self.cur_op = Some(op);
                return WriteAttempt::Parked;
            }
            if op.status >= 0 {
                op.status = -status::ESERVERBUSY;
            }
            io.expect = Expect::Header;
            io.max_read_ahead = MAX_RPC_HEADER_LEN;
            return WriteAttempt::Ready(op);
        }
        let avail = io.in_buf.len() as i64;
        if avail < num_bytes {
            io.max_read_ahead = (num_bytes - avail) as usize;
            io.expect = Expect::Payload {
                need: num_bytes as usize,
                hash: op.wants_payload_hash(),
            };
            self.cur_op = Some(op);
            return WriteAttempt::Parked;
        }
        // Full payload buffered. Stage it at its checksum block offset so
        // block boundaries line up, then step past the pad.
        let n = num_bytes.max(0) as usize;
        let mut staged = BytesMut::with_capacity(align + n);
        staged.resize(align, 0);
        staged.extend_from_slice(&io.in_buf[..n]);
        io.in_buf.advance(n);
        let mut data = staged.freeze();
        data.advance(align);
        if let Some(expected) = op.expected_payload_hash() {
            let actual =
                payload_hash.unwrap_or_else(|| integrity_hash(&[&data[..]]));
            if expected != actual && op.status >= 0 {
                error!(
                    self.log,
                    "seq: {} payload hash mismatch: expected {:x} actual {:x}",
                    op.seq,
                    expected,
                    actual
                );
                op.fail(-status::EBADRPC, "payload integrity hash mismatch");
                // the failed op enters the queue with no reservation, so
                // its admission hold goes back now
                if let Some(d) = op.dev_charge.take() {
                    let grants =
                        env.dev_buffers.put(d, self.id, op.pending_reserve, now);
                    env.grants.extend(grants);
                }
                let grants = env.buffers.put(self.id, op.pending_reserve, now);
                env.grants.extend(grants);
            }
        }
        op.payload = Some(data);
        io.expect = Expect::Header;
        io.max_read_ahead = MAX_RPC_HEADER_LEN;
        WriteAttempt::Ready(op)
    }

    /// Fails the op with server-busy when the observed buffer wait exceeds
    /// its budget, withdrawing whatever reservation state it holds.
    fn fail_if_exceeds_wait(
        &mut self,
        op: &mut Op,
        buffer_bytes: i64,
        env: &mut Env<'_>,
    ) -> bool {
        if !env.ctx.config.enforce_max_wait || op.max_wait_ms <= 0 {
            return false;
        }
        let max_wait = op.max_wait_ms * 1000;
        let dev_wait = self
            .dev_buf_mgr
            .map_or(0, |d| env.dev_buffers.waiting_avg_usecs(d));
        let cur_wait = env.buffers.waiting_avg_usecs() + dev_wait;
        let now = env.ctx.clock.now_usec();
        if !exceeds_max_wait(cur_wait, max_wait, op.start_time, now) {
            return false;
        }
        debug!(
            self.log,
            "exceeded wait: current: {} max: {} op: {}", cur_wait, max_wait, op
        );
        op.status = -status::ESERVERBUSY;
        op.status_msg = "exceeds max wait".to_string();
        if let Some(d) = self.dev_buf_mgr.take() {
            let grants = env.dev_buffers.cancel_request(d, self.id, now);
            env.grants.extend(grants);
        } else {
            if let Some(d) = op.dev_charge.take() {
                let grants = env.dev_buffers.put(d, self.id, buffer_bytes, now);
                env.grants.extend(grants);
            }
            let grants = env.buffers.cancel_request(self.id, now);
            env.grants.extend(grants);
        }
        env.ctx.counters.wait_time_exceeded();
        true
    }

    fn log_denied(&self, op: &Op, buffer_bytes: i64, failed: bool, env: &Env<'_>) {
        debug!(
            self.log,
            "seq: {} request for: {} bytes denied{} cur: {} total: {} used: {} bufs: {} op: {} {}",
            op.seq,
            buffer_bytes,
            if self.dev_buf_mgr.is_some() { " by dev." } else { "" },
            env.buffers.byte_count(self.id),
            env.buffers.total_byte_count(),
            env.buffers.used_byte_count(),
            env.buffers.free_buffer_count(),
            op,
            if failed { "exceeds max wait" } else { "waiting for buffers" }
        );
    }

    fn submit_op(&mut self, op: Box<Op>, env: &mut Env<'_>) {
        match env.ctx.executor.submit(op) {
            Submit::Pending => {}
            Submit::Done(op) => self.ready.push_back(op),
        }
    }

    /// An op finished execution. Responses go out in FIFO order, except
    /// that a completed op that is not a depending type may pass an
    /// earlier op that is still in flight.
    fn cmd_done(&mut self, done: Box<Op>, io: &mut ConnState, env: &mut Env<'_>) {
        env.ctx.counters.op_finished();
        let done_seq = done.seq;
        let depending = done.is_depending_type();
        if env.ctx.config.trace_request_response {
            debug!(self.log, "response: {:?}", done.response_header());
        }
        if done.status >= 0 {
            self.note_reservation(&done);
        }
        match self
            .ops
            .iter_mut()
            .find(|e| e.seq == done_seq && e.op.is_none())
        {
            Some(entry) => entry.op = Some(done),
            None => {
                error!(self.log, "op completion is not in the queue: {}", done);
                debug_assert!(false, "completion not in queue");
                return;
            }
        }
        // drain every completed op at the head
        loop {
            let head_done = matches!(self.ops.front(), Some(e) if e.op.is_some());
            if !head_done {
                break;
            }
            if let Some(mut entry) = self.ops.pop_front() {
                if let Some(op) = entry.op.take() {
                    let seq = op.seq;
                    self.send_response(op, entry.reserved, io, env);
                    self.op_finished(seq, env);
                }
            }
        }
        // the completed op may still be stuck behind an outstanding head
        if let Some(pos) = self
            .ops
            .iter()
            .position(|e| e.seq == done_seq && e.op.is_some())
        {
            debug_assert!(pos > 0);
            if !depending {
                debug_assert!(self
                    .pending_ops
                    .iter()
                    .all(|p| p.pred_seq != done_seq));
                if let Some(mut entry) = self.ops.remove(pos) {
                    if let Some(op) = entry.op.take() {
                        let seq = op.seq;
                        self.send_response(op, entry.reserved, io, env);
                        self.op_finished(seq, env);
                    }
                }
            } else {
                let head_seq = self.ops.front().map(|e| e.seq).unwrap_or(0);
                debug!(
                    self.log,
                    "previous op still pending: {}; deferring reply to: {}",
                    head_seq,
                    done_seq
                );
                // disk is finished with it, so the device tier can have
                // its bytes back; only the reply stays charged globally
                let now = env.ctx.clock.now_usec();
                if let Some(entry) = self.ops.get_mut(pos) {
                    let reserved = entry.reserved;
                    if let Some(op) = entry.op.as_mut() {
                        if let Some(d) = op.dev_charge.take() {
                            let grants =
                                env.dev_buffers.put(d, self.id, reserved, now);
                            env.grants.extend(grants);
                        }
                    }
                }
            }
        }
    }

    /// Writes the response into the output buffer and settles the op's
    /// buffer accounting. The reply bytes stay charged to the global pool
    /// until the socket drains them.
    fn send_response(
        &mut self,
        mut op: Box<Op>,
        reserved: i64,
        io: &mut ConnState,
        env: &mut Env<'_>,
    ) {
        let now = env.ctx.clock.now_usec();
        let timespent = (now - op.start_time).max(0);
        let too_long = timespent > 5_000_000;
        let expected = op.status >= 0
            || (matches!(op.body, Request::SpaceReserve { .. })
                && op.status == -status::ENOSPC);
        if !expected {
            error!(
                self.log,
                "seq: {} status: {} buffers: {} {} msg: {} took: {} usec.",
                op.seq,
                op.status,
                env.buffers.byte_count(self.id),
                op,
                op.status_msg,
                timespent
            );
        } else if too_long {
            info!(
                self.log,
                "seq: {} status: {} buffers: {} {} RPC too long {} usec.",
                op.seq,
                op.status,
                env.buffers.byte_count(self.id),
                op,
                timespent
            );
        } else {
            debug!(
                self.log,
                "seq: {} status: {} buffers: {} {} took: {} usec.",
                op.seq,
                op.status,
                env.buffers.byte_count(self.id),
                op,
                timespent
            );
        }

        let before = io.num_bytes_to_write();
        let header = op.response_header();
        let mut enc = RpcEncoder::new();
        if let Err(e) = enc.encode(&header, &mut io.out_buf) {
            error!(self.log, "failed to encode response: {:#}", e);
            self.close_connection(io);
        } else if let Some(data) = op.response_payload() {
            io.out_buf.extend_from_slice(data);
        }
        let resp_bytes = (io.num_bytes_to_write() - before).max(0);
        self.prev_num_to_write = io.num_bytes_to_write();
        if let Some(d) = op.dev_charge.take() {
            let grants = env.dev_buffers.put(d, self.id, reserved, now);
            env.grants.extend(grants);
        }
        let grants = env.buffers.put(self.id, reserved - resp_bytes, now);
        env.grants.extend(grants);
        env.ctx.counters.request_done(timespent as u64);
    }

    /// Promotes write syncs that were waiting on `done_seq`. The submit
    /// drain runs only in the outermost caller so a single completion
    /// cannot fan out into unbounded nesting.
    fn op_finished(&mut self, done_seq: u64, env: &mut Env<'_>) {
        let run_submit_queue = self.pending_submit.is_empty();
        while self
            .pending_ops
            .front()
            .map_or(false, |p| p.pred_seq == done_seq)
        {
            if let Some(p) = self.pending_ops.pop_front() {
                debug!(
                    self.log,
                    "submitting write-sync ({}) since {} finished",
                    p.dependent.seq,
                    done_seq
                );
                self.pending_submit.push_back(p.dependent);
            }
        }
        if !run_submit_queue {
            return;
        }
        while let Some(op) = self.pending_submit.pop_front() {
            env.ctx.counters.op_inserted();
            self.ops.push_back(InFlight {
                seq: op.seq,
                reserved: 0,
                depending: op.is_depending_type(),
                op: None,
            });
            self.submit_op(op, env);
        }
    }

    /// Mirrors the append-space reservation ledger so it can be released
    /// exactly once when the connection goes away.
    fn note_reservation(&mut self, op: &Op) {
        match op.body {
            Request::SpaceReserve {
                chunk_id,
                txn_id,
                num_bytes,
            } => {
                *self.reservations.entry((chunk_id, txn_id)).or_insert(0) +=
                    num_bytes;
            }
            Request::SpaceRelease {
                chunk_id,
                txn_id,
                num_bytes,
            } => {
                if let Some(v) = self.reservations.get_mut(&(chunk_id, txn_id)) {
                    *v -= num_bytes;
                    if *v <= 0 {
                        self.reservations.remove(&(chunk_id, txn_id));
                    }
                }
            }
            _ => {}
        }
    }

    fn net_wrote(&mut self, io: &mut ConnState, env: &mut Env<'_>) {
        let rem = io.num_bytes_to_write();
        let delta = self.prev_num_to_write - rem;
        if delta > 0 {
            let now = env.ctx.clock.now_usec();
            let grants = env.buffers.put(self.id, delta, now);
            env.grants.extend(grants);
        }
        self.prev_num_to_write = rem;
    }

    fn net_error(&mut self, reason: &str, io: &mut ConnState, env: &mut Env<'_>) {
        debug!(
            self.log,
            "closing connection due to {}, pending read: {} write: {}",
            reason,
            io.in_buf.len(),
            io.num_bytes_to_write()
        );
        self.close_connection(io);
        if let Some(mut op) = self.cur_op.take() {
            let now = env.ctx.clock.now_usec();
            if let Some(d) = self.dev_buf_mgr.take() {
                let grants = env.dev_buffers.cancel_request(d, self.id, now);
                env.grants.extend(grants);
            } else {
                if let Some(d) = op.dev_charge.take() {
                    let grants =
                        env.dev_buffers.put(d, self.id, op.pending_reserve, now);
                    env.grants.extend(grants);
                }
                let grants = env.buffers.cancel_request(self.id, now);
                env.grants.extend(grants);
            }
            self.discard_byte_cnt = 0;
        }
    }

    /// A deferred buffer request came through. Resume the parked op with
    /// the bytes it now holds; a grant that raced with completion of the
    /// op is a no-op beyond restoring read-ahead.
    fn handle_granted(&mut self, io: &mut ConnState, env: &mut Env<'_>) {
        debug!(
            self.log,
            "granted: op: {} dev mgr: {:?}",
            show_op(&self.cur_op),
            self.dev_buf_mgr
        );
        if !self.good {
            return;
        }
        if self.cur_op.is_some() {
            self.handle_client_cmd(0, None, None, io, env);
        } else {
            io.max_read_ahead = MAX_RPC_HEADER_LEN;
        }
    }

    /// The tail of every outermost dispatch: arm the right inactivity
    /// timeout while healthy, or run the one-shot teardown of peers and
    /// reservations once the connection is gone.
    fn finish_dispatch(&mut self, io: &mut ConnState, env: &mut Env<'_>) {
        if self.state != SmState::Active {
            return;
        }
        if self.good && !io.closed {
            let pending_io = !io.in_buf.is_empty()
                || self.cur_op.is_some()
                || io.num_bytes_to_write() > 0;
            io.timeout_secs = if pending_io {
                env.ctx.config.io_timeout_sec
            } else {
                env.ctx.config.idle_timeout_sec
            };
            return;
        }
        // Tear down the daisy chain; outstanding forwarded ops come back
        // as completions and retire below.
        let syncers = std::mem::take(&mut self.remote_syncers);
        for sid in syncers {
            remote_sync::finish(env.syncs, env.workers, env.wakers, sid);
        }
        for ((chunk_id, txn_id), bytes) in std::mem::take(&mut self.reservations) {
            env.ctx.appender.chunk_space_release(chunk_id, txn_id, bytes);
        }
        let dropped = self.pending_ops.len() + self.pending_submit.len();
        if dropped > 0 {
            debug!(
                self.log,
                "dropping {} never-submitted dependent ops", dropped
            );
            self.pending_ops.clear();
            self.pending_submit.clear();
        }
        self.state = SmState::Terminating;
        self.terminate_retire(io, env);
    }

    /// Terminating: only completions matter. Each one returns its buffer
    /// credit; when the queue drains the machine destroys itself.
    fn terminate_event(&mut self, ev: Event, io: &mut ConnState, env: &mut Env<'_>) {
        match ev {
            Event::CmdDone(done) => {
                env.ctx.counters.op_finished();
                if done.status >= 0 {
                    // a reservation that completed into the teardown gets
                    // released immediately, since the ledger snapshot is
                    // already gone
                    if let Request::SpaceReserve {
                        chunk_id,
                        txn_id,
                        num_bytes,
                    } = done.body
                    {
                        env.ctx.appender.chunk_space_release(
                            chunk_id, txn_id, num_bytes,
                        );
                    }
                }
                let seq = done.seq;
                match self
                    .ops
                    .iter_mut()
                    .find(|e| e.seq == seq && e.op.is_none())
                {
                    Some(entry) => entry.op = Some(done),
                    None => {
                        error!(
                            self.log,
                            "late completion is not in the queue: {}", done
                        );
                        debug_assert!(false, "completion not in queue");
                    }
                }
                self.terminate_retire(io, env);
            }
            Event::InactivityTimeout | Event::NetError => {
                self.terminate_retire(io, env);
            }
            Event::NetRead { .. } | Event::NetWrote | Event::Granted => {
                // stragglers from the event loop; nothing left to do with
                // them
            }
        }
    }

    fn terminate_retire(&mut self, io: &mut ConnState, env: &mut Env<'_>) {
        let now = env.ctx.clock.now_usec();
        loop {
            let head_done = matches!(self.ops.front(), Some(e) if e.op.is_some());
            if !head_done {
                break;
            }
            if let Some(mut entry) = self.ops.pop_front() {
                if let Some(mut op) = entry.op.take() {
                    if let Some(d) = op.dev_charge.take() {
                        let grants =
                            env.dev_buffers.put(d, self.id, entry.reserved, now);
                        env.grants.extend(grants);
                    }
                    let grants = env.buffers.put(self.id, entry.reserved, now);
                    env.grants.extend(grants);
                }
            }
        }
        if self.ops.is_empty() {
            debug_assert!(self.pending_ops.is_empty());
            self.state = SmState::Dead;
            io.closed = true;
            io.dead = true;
        }
    }

    // test introspection

    #[cfg(test)]
    pub(crate) fn ops_len(&self) -> usize {
        self.ops.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_ops_len(&self) -> usize {
        self.pending_ops.len()
    }

    #[cfg(test)]
    pub(crate) fn reserved_for(&self, seq: u64) -> Option<i64> {
        self.ops.iter().find(|e| e.seq == seq).map(|e| e.reserved)
    }

    #[cfg(test)]
    pub(crate) fn has_cur_op(&self) -> bool {
        self.cur_op.is_some()
    }

    #[cfg(test)]
    pub(crate) fn discard_remaining(&self) -> i64 {
        self.discard_byte_cnt
    }

    #[cfg(test)]
    pub(crate) fn is_terminating(&self) -> bool {
        self.state == SmState::Terminating
    }

    #[cfg(test)]
    pub(crate) fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}
