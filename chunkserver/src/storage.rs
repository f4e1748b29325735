// Copyright 2024 Oxide Computer Company

//! File-backed chunk storage and the executor that runs ops against it.
//!
//! Each data directory is one device with its own IO thread; a chunk
//! lives in exactly one directory, as `chunk_<id>.<version>`. This is the
//! narrow storage seam the connection front end submits into.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use slog::{debug, error, info, Logger};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use ferrite_common::{status, FerriteError};
use ferrite_protocol::{ChunkId, Request, CHECKSUM_BLOCKSIZE};

use crate::context::{ChunkManager, OpExecutor, RecordAppendManager, Submit};
use crate::ops::{Op, OpResult};
use crate::DeviceId;

/// Fixed upper bound on a chunk's size.
pub const CHUNK_SIZE_LIMIT: i64 = 64 << 20;

#[derive(Debug, Clone, Copy)]
struct ChunkMeta {
    version: i64,
    size: i64,
}

/// One file per chunk, spread across the data directories.
pub struct ChunkStore {
    dirs: Vec<PathBuf>,
    chunks: Mutex<HashMap<ChunkId, ChunkMeta>>,
    log: Logger,
}

impl ChunkStore {
    pub fn create(dirs: Vec<PathBuf>, log: Logger) -> Result<Arc<Self>, FerriteError> {
        if dirs.is_empty() {
            return Err(FerriteError::GenericError(
                "at least one data directory is required".to_string(),
            ));
        }
        for d in &dirs {
            std::fs::create_dir_all(d)?;
        }
        info!(log, "created chunk store over {} device(s)", dirs.len());
        Ok(Arc::new(ChunkStore {
            dirs,
            chunks: Mutex::new(HashMap::new()),
            log,
        }))
    }

    /// Opens existing data directories, indexing the chunks found there.
    pub fn open(dirs: Vec<PathBuf>, log: Logger) -> Result<Arc<Self>, FerriteError> {
        if dirs.is_empty() {
            return Err(FerriteError::GenericError(
                "at least one data directory is required".to_string(),
            ));
        }
        let mut chunks = HashMap::new();
        for d in &dirs {
            for entry in std::fs::read_dir(d)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some((chunk_id, version)) = parse_chunk_file_name(name) else {
                    continue;
                };
                let size = entry.metadata()?.len() as i64;
                chunks.insert(chunk_id, ChunkMeta { version, size });
            }
        }
        info!(
            log,
            "opened chunk store over {} device(s), {} chunk(s)",
            dirs.len(),
            chunks.len()
        );
        Ok(Arc::new(ChunkStore {
            dirs,
            chunks: Mutex::new(chunks),
            log,
        }))
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        (0..self.dirs.len()).map(|i| DeviceId(i as u16)).collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    fn device_index(&self, chunk_id: ChunkId) -> usize {
        (chunk_id.unsigned_abs() as usize) % self.dirs.len()
    }

    fn path(&self, chunk_id: ChunkId, version: i64) -> PathBuf {
        self.dirs[self.device_index(chunk_id)]
            .join(format!("chunk_{}.{}", chunk_id, version))
    }

    fn meta(&self, chunk_id: ChunkId) -> Option<ChunkMeta> {
        self.chunks.lock().unwrap().get(&chunk_id).copied()
    }

    fn checked_meta(
        &self,
        chunk_id: ChunkId,
        version: i64,
    ) -> Result<ChunkMeta, FerriteError> {
        let meta = self
            .meta(chunk_id)
            .ok_or(FerriteError::ChunkMissing(chunk_id))?;
        if meta.version != version {
            return Err(FerriteError::ChunkVersionMismatch(chunk_id));
        }
        Ok(meta)
    }

    pub fn size(&self, chunk_id: ChunkId) -> Result<i64, FerriteError> {
        self.meta(chunk_id)
            .map(|m| m.size)
            .ok_or(FerriteError::ChunkMissing(chunk_id))
    }

    pub fn size_or_zero(&self, chunk_id: ChunkId) -> i64 {
        self.meta(chunk_id).map_or(0, |m| m.size)
    }

    pub fn read(
        &self,
        chunk_id: ChunkId,
        version: i64,
        offset: i64,
        num_bytes: i64,
    ) -> Result<Bytes, FerriteError> {
        if offset < 0 || num_bytes < 0 {
            return Err(FerriteError::InvalidRequest(
                "negative read range".to_string(),
            ));
        }
        let meta = self.checked_meta(chunk_id, version)?;
        // short reads at the tail are allowed
        let avail = (meta.size - offset).clamp(0, num_bytes);
        if avail == 0 {
            return Ok(Bytes::new());
        }
        let mut f = File::open(self.path(chunk_id, version))?;
        f.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; avail as usize];
        f.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Writes payload at the given offset, creating the chunk on first
    /// touch. The chunk's version is pinned at creation.
    pub fn write(
        &self,
        chunk_id: ChunkId,
        version: i64,
        offset: i64,
        data: &[u8],
    ) -> Result<(), FerriteError> {
        let end = offset + data.len() as i64;
        if offset < 0 || end > CHUNK_SIZE_LIMIT {
            return Err(FerriteError::InvalidRequest(format!(
                "write range [{}, {}) outside chunk bounds",
                offset, end
            )));
        }
        {
            let mut chunks = self.chunks.lock().unwrap();
            match chunks.get(&chunk_id) {
                Some(meta) if meta.version != version => {
                    return Err(FerriteError::ChunkVersionMismatch(chunk_id));
                }
                Some(_) => {}
                None => {
                    debug!(self.log, "creating chunk {} version {}", chunk_id, version);
                    chunks.insert(chunk_id, ChunkMeta { version, size: 0 });
                }
            }
        }
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.path(chunk_id, version))?;
        f.seek(SeekFrom::Start(offset as u64))?;
        f.write_all(data)?;
        let mut chunks = self.chunks.lock().unwrap();
        if let Some(meta) = chunks.get_mut(&chunk_id) {
            meta.size = meta.size.max(end);
        }
        Ok(())
    }

    pub fn sync(&self, chunk_id: ChunkId, version: i64) -> Result<(), FerriteError> {
        self.checked_meta(chunk_id, version)?;
        let f = File::open(self.path(chunk_id, version))?;
        f.sync_all()?;
        Ok(())
    }

    /// Appends at the current end of chunk, returning the offset the
    /// record landed at.
    pub fn append(
        &self,
        chunk_id: ChunkId,
        version: i64,
        data: &[u8],
    ) -> Result<i64, FerriteError> {
        let offset = match self.meta(chunk_id) {
            Some(m) if m.version != version => {
                return Err(FerriteError::ChunkVersionMismatch(chunk_id))
            }
            Some(m) => m.size,
            None => 0,
        };
        self.write(chunk_id, version, offset, data)?;
        Ok(offset)
    }
}

fn parse_chunk_file_name(name: &str) -> Option<(ChunkId, i64)> {
    let rest = name.strip_prefix("chunk_")?;
    let (id, version) = rest.split_once('.')?;
    Some((id.parse().ok()?, version.parse().ok()?))
}

impl ChunkManager for ChunkStore {
    fn is_chunk_readable(&self, chunk_id: ChunkId) -> bool {
        self.meta(chunk_id).is_some()
    }

    fn max_io_request_size(&self) -> i64 {
        4 << 20
    }

    fn device_of(&self, chunk_id: ChunkId) -> Option<DeviceId> {
        Some(DeviceId(self.device_index(chunk_id) as u16))
    }
}

#[derive(Debug, Default)]
struct AppendState {
    /// Outstanding append space by (chunk, transaction).
    reservations: HashMap<(ChunkId, i64), i64>,
    /// Total outstanding append space per chunk.
    reserved_per_chunk: HashMap<ChunkId, i64>,
    last_status: HashMap<ChunkId, i32>,
}

/// Append-space ledger plus the append path itself.
pub struct AppendManager {
    store: Arc<ChunkStore>,
    state: Mutex<AppendState>,
    log: Logger,
}

impl AppendManager {
    pub fn new(store: Arc<ChunkStore>, log: Logger) -> Arc<Self> {
        Arc::new(AppendManager {
            store,
            state: Mutex::new(AppendState::default()),
            log,
        })
    }

    /// Reserves append space, failing with out-of-space when the chunk
    /// cannot absorb it. Returns the space still available afterwards.
    pub fn reserve(
        &self,
        chunk_id: ChunkId,
        txn_id: i64,
        bytes: i64,
    ) -> Result<i64, FerriteError> {
        if bytes < 0 {
            return Err(FerriteError::InvalidRequest(
                "negative reservation".to_string(),
            ));
        }
        let size = self.store.size_or_zero(chunk_id);
        let mut st = self.state.lock().unwrap();
        let reserved = st.reserved_per_chunk.get(&chunk_id).copied().unwrap_or(0);
        if size + reserved + bytes > CHUNK_SIZE_LIMIT {
            return Err(FerriteError::OutOfSpace);
        }
        *st.reservations.entry((chunk_id, txn_id)).or_insert(0) += bytes;
        *st.reserved_per_chunk.entry(chunk_id).or_insert(0) += bytes;
        Ok(CHUNK_SIZE_LIMIT - size - reserved - bytes)
    }

    pub fn release(&self, chunk_id: ChunkId, txn_id: i64, bytes: i64) {
        let mut st = self.state.lock().unwrap();
        if let Some(v) = st.reservations.get_mut(&(chunk_id, txn_id)) {
            let freed = bytes.min(*v);
            *v -= freed;
            if *v <= 0 {
                st.reservations.remove(&(chunk_id, txn_id));
            }
            if let Some(total) = st.reserved_per_chunk.get_mut(&chunk_id) {
                *total = (*total - freed).max(0);
                if *total == 0 {
                    st.reserved_per_chunk.remove(&chunk_id);
                }
            }
        }
    }

    /// Consumes reservation and appends, remembering the outcome for
    /// status inquiries.
    pub fn append(
        &self,
        chunk_id: ChunkId,
        version: i64,
        txn_id: i64,
        data: &[u8],
    ) -> Result<i64, FerriteError> {
        self.release(chunk_id, txn_id, data.len() as i64);
        let res = self.store.append(chunk_id, version, data);
        let code = match &res {
            Ok(_) => 0,
            Err(e) => -status_of(e),
        };
        self.state.lock().unwrap().last_status.insert(chunk_id, code);
        res
    }

    pub fn status(&self, chunk_id: ChunkId) -> (i64, i32) {
        let version = self.store.meta(chunk_id).map_or(0, |m| m.version);
        let op_status = self
            .state
            .lock()
            .unwrap()
            .last_status
            .get(&chunk_id)
            .copied()
            .unwrap_or(0);
        (version, op_status)
    }

    #[cfg(test)]
    pub fn reserved_bytes(&self, chunk_id: ChunkId) -> i64 {
        self.state
            .lock()
            .unwrap()
            .reserved_per_chunk
            .get(&chunk_id)
            .copied()
            .unwrap_or(0)
    }
}

impl RecordAppendManager for AppendManager {
    fn alignment_and_forward_flag(&self, chunk_id: ChunkId) -> (usize, bool) {
        let align = (self.store.size_or_zero(chunk_id) as usize) % CHECKSUM_BLOCKSIZE;
        (align, false)
    }

    fn chunk_space_release(&self, chunk_id: ChunkId, txn_id: i64, bytes: i64) {
        debug!(
            self.log,
            "releasing {} reserved bytes on chunk {} txn {}", bytes, chunk_id, txn_id
        );
        self.release(chunk_id, txn_id, bytes);
    }
}

fn status_of(e: &FerriteError) -> i32 {
    match e {
        FerriteError::OutOfSpace => status::ENOSPC,
        FerriteError::ChunkMissing(_) => status::EAGAIN,
        FerriteError::ChunkVersionMismatch(_) => status::EBADRPC,
        FerriteError::InvalidRequest(_) => status::EBADRPC,
        _ => status::EIO,
    }
}

/// Runs ops against the chunk store: quick bookkeeping ops complete
/// synchronously, disk ops ride one IO thread per device and complete
/// through the server's completion channel.
pub struct DiskExecutor {
    store: Arc<ChunkStore>,
    appender: Arc<AppendManager>,
    device_txs: Vec<UnboundedSender<Box<Op>>>,
    log: Logger,
}

impl DiskExecutor {
    pub fn new(
        store: Arc<ChunkStore>,
        appender: Arc<AppendManager>,
        completions: UnboundedSender<Box<Op>>,
        log: Logger,
    ) -> Arc<Self> {
        let mut device_txs = Vec::new();
        for dev in store.devices() {
            let (tx, rx) = unbounded_channel();
            device_txs.push(tx);
            let store = Arc::clone(&store);
            let appender = Arc::clone(&appender);
            let completions = completions.clone();
            let thread_log = log.new(slog::o!("device" => dev.0));
            if let Err(e) = std::thread::Builder::new()
                .name(format!("disk-io-{}", dev.0))
                .spawn(move || {
                    device_io_loop(store, appender, rx, completions, thread_log)
                })
            {
                // a failed spawn leaves the sender closed, so ops routed
                // to this device fail cleanly rather than hanging
                error!(log, "failed to start device io thread: {:?}", e);
            }
        }
        Arc::new(DiskExecutor {
            store,
            appender,
            device_txs,
            log,
        })
    }

    fn execute_quick(&self, op: &mut Op) {
        match op.body {
            Request::ChunkSize { chunk_id, .. } => match self.store.size(chunk_id) {
                Ok(size) => op.result = OpResult::Size { size },
                Err(e) => op.fail(-status_of(&e), &e.to_string()),
            },
            Request::GetRecordAppendStatus { chunk_id, .. } => {
                let (chunk_version, op_status) = self.appender.status(chunk_id);
                op.result = OpResult::AppendStatus {
                    chunk_version,
                    op_status,
                };
            }
            Request::SpaceReserve {
                chunk_id,
                txn_id,
                num_bytes,
            } => match self.appender.reserve(chunk_id, txn_id, num_bytes) {
                Ok(available) => op.result = OpResult::Reserve { available },
                Err(e) => op.fail(-status_of(&e), &e.to_string()),
            },
            Request::SpaceRelease {
                chunk_id,
                txn_id,
                num_bytes,
            } => self.appender.release(chunk_id, txn_id, num_bytes),
            _ => {
                error!(self.log, "not a synchronous op: {}", op);
                op.fail(-status::EIO, "internal dispatch error");
            }
        }
    }
}

impl OpExecutor for DiskExecutor {
    fn submit(&self, mut op: Box<Op>) -> Submit {
        match op.body {
            Request::ChunkSize { .. }
            | Request::GetRecordAppendStatus { .. }
            | Request::SpaceReserve { .. }
            | Request::SpaceRelease { .. } => {
                self.execute_quick(&mut op);
                Submit::Done(op)
            }
            _ => {
                let dev = self.store.device_index(op.body.chunk_id());
                match self.device_txs.get(dev) {
                    Some(tx) => match tx.send(op) {
                        Ok(()) => Submit::Pending,
                        Err(e) => {
                            let mut op = e.0;
                            op.fail(-status::EIO, "device io thread is gone");
                            Submit::Done(op)
                        }
                    },
                    None => {
                        op.fail(-status::EIO, "no io thread for device");
                        Submit::Done(op)
                    }
                }
            }
        }
    }
}

fn device_io_loop(
    store: Arc<ChunkStore>,
    appender: Arc<AppendManager>,
    mut rx: UnboundedReceiver<Box<Op>>,
    completions: UnboundedSender<Box<Op>>,
    log: Logger,
) {
    while let Some(mut op) = rx.blocking_recv() {
        execute_disk(&store, &appender, &mut op);
        if completions.send(op).is_err() {
            debug!(log, "completion channel closed, stopping");
            return;
        }
    }
}

fn execute_disk(store: &ChunkStore, appender: &AppendManager, op: &mut Op) {
    let res: Result<(), FerriteError> = match &op.body {
        Request::ReadChunk {
            chunk_id,
            chunk_version,
            offset,
            num_bytes,
        } => store
            .read(*chunk_id, *chunk_version, *offset, *num_bytes)
            .map(|data| {
                op.result = OpResult::Read { data };
            }),
        Request::WritePrepare {
            chunk_id,
            chunk_version,
            offset,
            ..
        }
        | Request::WritePrepareFwd {
            chunk_id,
            chunk_version,
            offset,
            ..
        } => {
            let data = op.payload.as_deref().unwrap_or(&[]);
            store.write(*chunk_id, *chunk_version, *offset, data)
        }
        Request::Write {
            chunk_id,
            chunk_version,
            offset,
            ..
        } => {
            let data = op.payload.as_deref().unwrap_or(&[]);
            store
                .write(*chunk_id, *chunk_version, *offset, data)
                .and_then(|()| store.sync(*chunk_id, *chunk_version))
        }
        Request::WriteSync {
            chunk_id,
            chunk_version,
            ..
        } => store.sync(*chunk_id, *chunk_version),
        Request::RecordAppend {
            chunk_id,
            chunk_version,
            txn_id,
            ..
        } => {
            let data = op.payload.take().unwrap_or_default();
            appender
                .append(*chunk_id, *chunk_version, *txn_id, &data)
                .map(|append_offset| {
                    op.result = OpResult::Append { append_offset };
                })
        }
        other => Err(FerriteError::InvalidRequest(format!(
            "not a disk op: {}",
            other.name()
        ))),
    };
    if let Err(e) = res {
        op.fail(-status_of(&e), &e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_common::plain_logger;
    use ferrite_protocol::RequestHeader;
    use tempfile::tempdir;

    fn two_dir_store() -> (tempfile::TempDir, tempfile::TempDir, Arc<ChunkStore>) {
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let store = ChunkStore::create(
            vec![d1.path().to_path_buf(), d2.path().to_path_buf()],
            plain_logger(),
        )
        .unwrap();
        (d1, d2, store)
    }

    #[test]
    fn write_read_round_trip() {
        let (_d1, _d2, store) = two_dir_store();
        store.write(7, 1, 0, b"hello chunk").unwrap();
        assert!(store.is_chunk_readable(7));
        assert_eq!(store.size(7).unwrap(), 11);
        let data = store.read(7, 1, 6, 16).unwrap();
        assert_eq!(&data[..], b"chunk");
        // reads past the end are empty, not errors
        assert!(store.read(7, 1, 100, 10).unwrap().is_empty());
    }

    #[test]
    fn version_is_pinned_at_creation() {
        let (_d1, _d2, store) = two_dir_store();
        store.write(3, 2, 0, b"v2 data").unwrap();
        assert!(matches!(
            store.write(3, 5, 0, b"nope"),
            Err(FerriteError::ChunkVersionMismatch(3))
        ));
        assert!(matches!(
            store.read(3, 1, 0, 4),
            Err(FerriteError::ChunkVersionMismatch(3))
        ));
    }

    #[test]
    fn reopen_finds_chunks() {
        let d1 = tempdir().unwrap();
        let d2 = tempdir().unwrap();
        let dirs = vec![d1.path().to_path_buf(), d2.path().to_path_buf()];
        {
            let store = ChunkStore::create(dirs.clone(), plain_logger()).unwrap();
            store.write(1, 1, 0, b"one").unwrap();
            store.write(2, 1, 0, b"two!").unwrap();
        }
        let store = ChunkStore::open(dirs, plain_logger()).unwrap();
        assert_eq!(store.chunk_count(), 2);
        assert_eq!(store.size(2).unwrap(), 4);
        assert_eq!(&store.read(1, 1, 0, 16).unwrap()[..], b"one");
    }

    #[test]
    fn append_walks_the_tail() {
        let (_d1, _d2, store) = two_dir_store();
        assert_eq!(store.append(9, 1, b"aaaa").unwrap(), 0);
        assert_eq!(store.append(9, 1, b"bb").unwrap(), 4);
        assert_eq!(store.size(9).unwrap(), 6);
    }

    #[test]
    fn reserve_and_release_ledger() {
        let (_d1, _d2, store) = two_dir_store();
        let mgr = AppendManager::new(store, plain_logger());
        let avail = mgr.reserve(5, 100, 1 << 20).unwrap();
        assert_eq!(avail, CHUNK_SIZE_LIMIT - (1 << 20));
        assert_eq!(mgr.reserved_bytes(5), 1 << 20);
        // the whole chunk cannot be reserved twice
        assert!(matches!(
            mgr.reserve(5, 101, CHUNK_SIZE_LIMIT),
            Err(FerriteError::OutOfSpace)
        ));
        mgr.release(5, 100, 1 << 20);
        assert_eq!(mgr.reserved_bytes(5), 0);
        // release of an unknown transaction is a no-op
        mgr.release(5, 999, 4096);
    }

    #[test]
    fn append_consumes_reservation() {
        let (_d1, _d2, store) = two_dir_store();
        let mgr = AppendManager::new(Arc::clone(&store), plain_logger());
        mgr.reserve(6, 1, 4096).unwrap();
        let off = mgr.append(6, 1, 1, b"record").unwrap();
        assert_eq!(off, 0);
        assert_eq!(mgr.reserved_bytes(6), 4096 - 6);
        let (version, op_status) = mgr.status(6);
        assert_eq!(version, 1);
        assert_eq!(op_status, 0);
    }

    fn mk_op(seq: u64, body: Request) -> Box<Op> {
        Box::new(Op::new(
            RequestHeader {
                seq,
                max_wait_ms: 0,
                body,
            },
            0,
        ))
    }

    #[test]
    fn executor_quick_and_disk_paths() {
        let (_d1, _d2, store) = two_dir_store();
        let appender = AppendManager::new(Arc::clone(&store), plain_logger());
        let (ctx, mut crx) = unbounded_channel();
        let exec = DiskExecutor::new(
            Arc::clone(&store),
            Arc::clone(&appender),
            ctx,
            plain_logger(),
        );

        // disk path: write then read back through the executor
        let mut wop = mk_op(
            1,
            Request::WritePrepare {
                chunk_id: 11,
                chunk_version: 1,
                offset: 0,
                num_bytes: 5,
                hash: 0,
                reply_requested: true,
            },
        );
        wop.payload = Some(Bytes::from_static(b"12345"));
        assert!(matches!(exec.submit(wop), Submit::Pending));
        let done = crx.blocking_recv().unwrap();
        assert_eq!(done.seq, 1);
        assert_eq!(done.status, 0);

        let rop = mk_op(
            2,
            Request::ReadChunk {
                chunk_id: 11,
                chunk_version: 1,
                offset: 0,
                num_bytes: 5,
            },
        );
        assert!(matches!(exec.submit(rop), Submit::Pending));
        let done = crx.blocking_recv().unwrap();
        assert_eq!(done.status, 0);
        match &done.result {
            OpResult::Read { data } => assert_eq!(&data[..], b"12345"),
            other => panic!("unexpected result {:?}", other),
        }

        // quick path: size completes synchronously
        let sop = mk_op(
            3,
            Request::ChunkSize {
                chunk_id: 11,
                chunk_version: 1,
            },
        );
        match exec.submit(sop) {
            Submit::Done(op) => match op.result {
                OpResult::Size { size } => assert_eq!(size, 5),
                ref other => panic!("unexpected result {:?}", other),
            },
            Submit::Pending => panic!("size should complete synchronously"),
        }

        // quick path: reservation failure is an expected status
        let rop = mk_op(
            4,
            Request::SpaceReserve {
                chunk_id: 11,
                txn_id: 1,
                num_bytes: CHUNK_SIZE_LIMIT,
            },
        );
        match exec.submit(rop) {
            Submit::Done(op) => assert_eq!(op.status, -status::ENOSPC),
            Submit::Pending => panic!("reserve should complete synchronously"),
        }
    }
}
