// Copyright 2024 Oxide Computer Company
use std::sync::Arc;

use slog::Logger;

use ferrite_protocol::ChunkId;

use crate::config::ClientSmConfig;
use crate::counters::ServerCounters;
use crate::ops::Op;
use crate::DeviceId;

/// Time source, injectable so admission deadlines are testable.
pub trait Clock: Send + Sync {
    fn now_usec(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_usec(&self) -> i64 {
        ferrite_common::microseconds()
    }
}

/// The slice of the chunk layer the connection front end needs.
pub trait ChunkManager: Send + Sync {
    /// Dirty reads are refused; a chunk is readable once its data is
    /// stable on disk.
    fn is_chunk_readable(&self, chunk_id: ChunkId) -> bool;

    fn max_io_request_size(&self) -> i64;

    /// The storage device holding the chunk, for per-device buffer
    /// accounting. `None` when placement is not yet known.
    fn device_of(&self, chunk_id: ChunkId) -> Option<DeviceId>;
}

/// The slice of the atomic record append layer the front end needs.
pub trait RecordAppendManager: Send + Sync {
    /// Alignment of the next append within its checksum block, plus
    /// whether the append must be forwarded down the chain.
    fn alignment_and_forward_flag(&self, chunk_id: ChunkId) -> (usize, bool);

    /// Returns previously reserved append space. Called once per
    /// reservation when a client disconnects.
    fn chunk_space_release(&self, chunk_id: ChunkId, txn_id: i64, bytes: i64);
}

/// Outcome of handing an op to the executor.
pub enum Submit {
    /// The executor took the op and will post a completion later.
    Pending,
    /// The op was executed synchronously; the completion is in hand.
    Done(Box<Op>),
}

/// Accepts admitted ops for execution against the storage layer.
///
/// Asynchronous completions come back through the server's completion
/// channel and are delivered to the owning connection as events.
pub trait OpExecutor: Send + Sync {
    fn submit(&self, op: Box<Op>) -> Submit;
}

/// Everything the state machines need from the rest of the server,
/// gathered so tests can swap in mock implementations.
#[derive(Clone)]
pub struct ServerContext {
    pub chunks: Arc<dyn ChunkManager>,
    pub appender: Arc<dyn RecordAppendManager>,
    pub executor: Arc<dyn OpExecutor>,
    pub clock: Arc<dyn Clock>,
    pub counters: Arc<ServerCounters>,
    pub config: ClientSmConfig,
    pub log: Logger,
}
