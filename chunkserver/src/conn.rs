// Copyright 2024 Oxide Computer Company
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;

use ferrite_protocol::MAX_RPC_HEADER_LEN;

/// What the connection's reader should do with incoming bytes before it
/// takes the server lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expect {
    /// Frame and parse an RPC header.
    Header,
    /// Accumulate `need` payload bytes; optionally hash them while still
    /// outside the lock.
    Payload { need: usize, hash: bool },
    /// Bytes are being consumed into the void for a failed oversize write.
    Discard,
}

/// Byte buffers and read plan for one connection.
///
/// Guarded by its own small mutex that nests strictly inside the server
/// lock: the state machine updates it while holding both, and the socket
/// tasks move bytes while holding only this one.
#[derive(Debug)]
pub struct ConnState {
    pub in_buf: BytesMut,
    pub out_buf: BytesMut,
    /// Bytes handed to the socket but not yet confirmed written.
    pub inflight_write: usize,
    /// How many more bytes the reader should pull; zero pauses reads.
    pub max_read_ahead: usize,
    pub expect: Expect,
    /// Inactivity timeout currently in force.
    pub timeout_secs: u64,
    /// The state machine closed the connection; the socket tasks drain
    /// and exit.
    pub closed: bool,
    /// The state machine is gone entirely.
    pub dead: bool,
}

impl ConnState {
    /// Reply bytes accepted but not yet on the wire. These stay charged
    /// to the buffer pool until the socket drains them.
    pub fn num_bytes_to_write(&self) -> i64 {
        (self.out_buf.len() + self.inflight_write) as i64
    }
}

/// Shared handle between a connection's state machine and its socket
/// tasks.
#[derive(Debug)]
pub struct ConnShared {
    pub state: Mutex<ConnState>,
    /// Wakes the writer half to flush `out_buf`.
    pub flush: Notify,
    /// Wakes the reader half to re-read its plan.
    pub plan: Notify,
}

impl ConnShared {
    pub fn new(idle_timeout_sec: u64) -> Arc<Self> {
        Arc::new(ConnShared {
            state: Mutex::new(ConnState {
                in_buf: BytesMut::new(),
                out_buf: BytesMut::new(),
                inflight_write: 0,
                max_read_ahead: MAX_RPC_HEADER_LEN,
                expect: Expect::Header,
                timeout_secs: idle_timeout_sec,
                closed: false,
                dead: false,
            }),
            flush: Notify::new(),
            plan: Notify::new(),
        })
    }

    /// Nudges both socket tasks; called after every event dispatch, once
    /// the server lock is no longer held by this call path.
    pub fn kick(&self) {
        self.flush.notify_one();
        self.plan.notify_one();
    }
}
