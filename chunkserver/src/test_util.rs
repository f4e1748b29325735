// Copyright 2024 Oxide Computer Company

//! Mock collaborators and a single-connection harness for state machine
//! tests, with no sockets or disks involved.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use ferrite_common::plain_logger;
use ferrite_protocol::{
    ChunkId, RequestHeader, ResponseDecoder, ResponseHeader, RpcEncoder,
};

use crate::buffer_pool::{BufferPool, DevicePools, GrantEvent, PoolTag};
use crate::client_sm::{ClientSM, Env, Event};
use crate::config::ClientSmConfig;
use crate::conn::ConnShared;
use crate::context::{
    ChunkManager, Clock, OpExecutor, RecordAppendManager, ServerContext, Submit,
};
use crate::counters::ServerCounters;
use crate::dispatcher::{WorkerQueues, WorkerShared};
use crate::ops::Op;
use crate::remote_sync::SyncRegistry;
use crate::{ClientId, DeviceId, WorkerId};

pub(crate) struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Arc<Self> {
        Arc::new(ManualClock {
            now: AtomicI64::new(start),
        })
    }

    pub fn advance(&self, usecs: i64) {
        self.now.fetch_add(usecs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockChunks {
    pub unreadable: Mutex<HashSet<ChunkId>>,
    pub device: Mutex<Option<DeviceId>>,
    pub max_io: i64,
}

impl MockChunks {
    pub fn new() -> Arc<Self> {
        Arc::new(MockChunks {
            unreadable: Mutex::new(HashSet::new()),
            device: Mutex::new(None),
            max_io: 4 << 20,
        })
    }

    pub fn set_unreadable(&self, chunk_id: ChunkId) {
        self.unreadable.lock().unwrap().insert(chunk_id);
    }

    pub fn set_device(&self, dev: Option<DeviceId>) {
        *self.device.lock().unwrap() = dev;
    }
}

impl ChunkManager for MockChunks {
    fn is_chunk_readable(&self, chunk_id: ChunkId) -> bool {
        !self.unreadable.lock().unwrap().contains(&chunk_id)
    }

    fn max_io_request_size(&self) -> i64 {
        self.max_io
    }

    fn device_of(&self, _chunk_id: ChunkId) -> Option<DeviceId> {
        *self.device.lock().unwrap()
    }
}

pub(crate) struct MockAppender {
    pub alignment: AtomicUsize,
    pub released: Mutex<Vec<(ChunkId, i64, i64)>>,
}

impl MockAppender {
    pub fn new() -> Arc<Self> {
        Arc::new(MockAppender {
            alignment: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
        })
    }

    pub fn released(&self) -> Vec<(ChunkId, i64, i64)> {
        self.released.lock().unwrap().clone()
    }
}

impl RecordAppendManager for MockAppender {
    fn alignment_and_forward_flag(&self, _chunk_id: ChunkId) -> (usize, bool) {
        (self.alignment.load(Ordering::SeqCst), false)
    }

    fn chunk_space_release(&self, chunk_id: ChunkId, txn_id: i64, bytes: i64) {
        self.released.lock().unwrap().push((chunk_id, txn_id, bytes));
    }
}

/// Records submitted ops; tests complete them by hand.
pub(crate) struct MockExecutor {
    pub submitted: Mutex<Vec<Box<Op>>>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(MockExecutor {
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub fn take(&self) -> Vec<Box<Op>> {
        std::mem::take(&mut self.submitted.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

impl OpExecutor for MockExecutor {
    fn submit(&self, op: Box<Op>) -> Submit {
        self.submitted.lock().unwrap().push(op);
        Submit::Pending
    }
}

pub(crate) fn encode_request(hdr: &RequestHeader) -> BytesMut {
    let mut buf = BytesMut::new();
    RpcEncoder::new()
        .encode(hdr, &mut buf)
        .expect("request encodes");
    buf
}

/// A full server over mock collaborators, with no worker threads
/// started; tests drive dispatch by hand.
pub(crate) fn mock_server(
    total_buffer_bytes: i64,
) -> (
    crate::server::Server,
    Arc<MockExecutor>,
    Arc<MockAppender>,
    Arc<ServerCounters>,
) {
    let log = plain_logger();
    let chunks = MockChunks::new();
    let appender = MockAppender::new();
    let executor = MockExecutor::new();
    let counters = Arc::new(ServerCounters::default());
    let ctx = ServerContext {
        chunks,
        appender: appender.clone(),
        executor: executor.clone(),
        clock: ManualClock::new(1_000_000),
        counters: Arc::clone(&counters),
        config: ClientSmConfig::default(),
        log: log.clone(),
    };
    let buffers = BufferPool::new(
        PoolTag::Global,
        total_buffer_bytes,
        total_buffer_bytes / 2,
        log,
    );
    let server =
        crate::server::Server::new(ctx, buffers, DevicePools::new(), 1);
    (server, executor, appender, counters)
}

/// One client state machine wired to mock collaborators.
pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub chunks: Arc<MockChunks>,
    pub appender: Arc<MockAppender>,
    pub executor: Arc<MockExecutor>,
    pub counters: Arc<ServerCounters>,
    pub ctx: ServerContext,
    pub buffers: BufferPool,
    pub dev_buffers: DevicePools,
    pub syncs: SyncRegistry,
    pub workers: Vec<WorkerQueues>,
    pub wakers: Vec<Arc<WorkerShared>>,
    pub grants: Vec<GrantEvent>,
    pub shared: Arc<ConnShared>,
    pub csm: ClientSM,
}

pub(crate) const TEST_CLIENT: ClientId = ClientId(1);

impl Harness {
    pub fn new(total_buffer_bytes: i64) -> Self {
        Self::with_config(total_buffer_bytes, ClientSmConfig::default())
    }

    pub fn with_config(total_buffer_bytes: i64, config: ClientSmConfig) -> Self {
        let log = plain_logger();
        let clock = ManualClock::new(1_000_000);
        let chunks = MockChunks::new();
        let appender = MockAppender::new();
        let executor = MockExecutor::new();
        let counters = Arc::new(ServerCounters::default());
        let ctx = ServerContext {
            chunks: chunks.clone(),
            appender: appender.clone(),
            executor: executor.clone(),
            clock: clock.clone(),
            counters: Arc::clone(&counters),
            config,
            log: log.clone(),
        };
        let buffers = BufferPool::new(
            PoolTag::Global,
            total_buffer_bytes,
            total_buffer_bytes / 2,
            log.clone(),
        );
        let shared = ConnShared::new(ctx.config.idle_timeout_sec);
        let csm = ClientSM::new(
            TEST_CLIENT,
            WorkerId(0),
            10000,
            Arc::clone(&shared),
            log,
        );
        Harness {
            clock,
            chunks,
            appender,
            executor,
            counters,
            ctx,
            buffers,
            dev_buffers: DevicePools::new(),
            syncs: SyncRegistry::new(),
            workers: vec![WorkerQueues::default()],
            wakers: vec![WorkerShared::new()],
            grants: Vec::new(),
            shared,
            csm,
        }
    }

    pub fn deliver(&mut self, ev: Event) {
        let shared = Arc::clone(&self.shared);
        let mut io = shared.state.lock().unwrap();
        let mut env = Env {
            buffers: &mut self.buffers,
            dev_buffers: &mut self.dev_buffers,
            syncs: &mut self.syncs,
            workers: &mut self.workers,
            wakers: &self.wakers,
            grants: &mut self.grants,
            ctx: &self.ctx,
        };
        self.csm.handle_event(ev, &mut io, &mut env);
    }

    /// Delivers the granted callbacks produced so far, the way the
    /// dispatcher would on its next tick.
    pub fn pump_grants(&mut self) {
        loop {
            let batch = std::mem::take(&mut self.grants);
            if batch.is_empty() {
                return;
            }
            let mut own = false;
            for g in batch {
                own |= g.client == TEST_CLIENT;
            }
            if own {
                self.deliver(Event::Granted);
            }
        }
    }

    /// Appends an encoded request (and payload) to the connection input.
    pub fn feed(&mut self, hdr: &RequestHeader, payload: &[u8]) {
        let buf = encode_request(hdr);
        let mut s = self.shared.state.lock().unwrap();
        s.in_buf.extend_from_slice(&buf);
        s.in_buf.extend_from_slice(payload);
    }

    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.shared
            .state
            .lock()
            .unwrap()
            .in_buf
            .extend_from_slice(bytes);
    }

    pub fn net_read(&mut self) {
        self.deliver(Event::NetRead {
            parsed: None,
            payload_hash: None,
        });
    }

    pub fn complete(&mut self, op: Box<Op>) {
        self.deliver(Event::CmdDone(op));
    }

    /// Simulates the socket draining everything queued for write, then
    /// decodes the responses that went out.
    pub fn drain_out(&mut self) -> Vec<(ResponseHeader, Bytes)> {
        let mut buf = {
            let mut s = self.shared.state.lock().unwrap();
            s.out_buf.split()
        };
        self.deliver(Event::NetWrote);
        let mut dec = ResponseDecoder::new();
        let mut out = Vec::new();
        while let Some(item) = dec.decode(&mut buf).expect("responses decode") {
            out.push(item);
        }
        out
    }

    pub fn read_ahead(&self) -> usize {
        self.shared.state.lock().unwrap().max_read_ahead
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    pub fn out_len(&self) -> usize {
        self.shared.state.lock().unwrap().out_buf.len()
    }

    pub fn in_len(&self) -> usize {
        self.shared.state.lock().unwrap().in_buf.len()
    }
}
