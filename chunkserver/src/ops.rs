// Copyright 2024 Oxide Computer Company
use bytes::Bytes;

use ferrite_protocol::{
    ChunkId, Request, RequestHeader, Response, ResponseHeader,
};

use crate::{ClientId, DeviceId};

/// Values produced by executing an op, folded into its response.
#[derive(Debug, Default, Clone)]
pub enum OpResult {
    #[default]
    None,
    Read {
        data: Bytes,
    },
    Size {
        size: i64,
    },
    Append {
        append_offset: i64,
    },
    AppendStatus {
        chunk_version: i64,
        op_status: i32,
    },
    Reserve {
        available: i64,
    },
}

/// One client RPC in flight through the server.
///
/// The state machine owns an op from parse until its response is written
/// (or until the connection dies); the executor borrows it by value while
/// the storage layer works on it.
#[derive(Debug)]
pub struct Op {
    pub seq: u64,
    pub body: Request,

    /// Zero while healthy, a negated status code otherwise.
    pub status: i32,
    pub status_msg: String,

    /// Wall clock usecs at parse time.
    pub start_time: i64,
    pub max_wait_ms: i64,

    /// Owning connection, set when the op enters the queue.
    pub client: Option<ClientId>,

    /// Collected write or append payload.
    pub payload: Option<Bytes>,

    pub result: OpResult,

    /// Device buffer pool currently holding bytes for this op.
    pub dev_charge: Option<DeviceId>,

    /// Byte amount of the most recent admission attempt, used to undo the
    /// reservation on cancellation.
    pub pending_reserve: i64,
}

impl Op {
    pub fn new(header: RequestHeader, now_usec: i64) -> Self {
        Op {
            seq: header.seq,
            max_wait_ms: header.max_wait_ms,
            body: header.body,
            status: 0,
            status_msg: String::new(),
            start_time: now_usec,
            client: None,
            payload: None,
            result: OpResult::None,
            dev_charge: None,
            pending_reserve: 0,
        }
    }

    pub fn fail(&mut self, status: i32, msg: &str) {
        self.status = status;
        self.status_msg = msg.to_string();
    }

    /// A write sync must wait for the last of these before it submits.
    pub fn is_depending_type(&self) -> bool {
        match &self.body {
            Request::WritePrepare {
                reply_requested, ..
            } => !reply_requested,
            Request::WritePrepareFwd {
                reply_requested, ..
            } => !reply_requested,
            Request::Write { .. } => true,
            _ => false,
        }
    }

    /// For chunk reads, the requested byte count and target chunk.
    pub fn chunk_read_info(&self) -> Option<(i64, ChunkId)> {
        match &self.body {
            Request::ReadChunk {
                chunk_id,
                num_bytes,
                ..
            } => Some((*num_bytes, *chunk_id)),
            _ => None,
        }
    }

    /// Whether the payload carries a client-supplied integrity hash that
    /// the server verifies before queueing the op.
    pub fn wants_payload_hash(&self) -> bool {
        self.expected_payload_hash().is_some()
    }

    pub fn expected_payload_hash(&self) -> Option<u64> {
        match &self.body {
            Request::WritePrepare { hash, .. }
            | Request::WritePrepareFwd { hash, .. }
            | Request::Write { hash, .. } => Some(*hash),
            _ => None,
        }
    }

    pub fn response_header(&self) -> ResponseHeader {
        let body = if self.status < 0 {
            Response::Error
        } else {
            match (&self.body, &self.result) {
                (Request::ReadChunk { .. }, OpResult::Read { data }) => {
                    Response::ReadChunk {
                        len: data.len() as i64,
                    }
                }
                (Request::ReadChunk { .. }, _) => Response::ReadChunk { len: 0 },
                (Request::RecordAppend { .. }, OpResult::Append { append_offset }) => {
                    Response::RecordAppend {
                        append_offset: *append_offset,
                    }
                }
                (
                    Request::GetRecordAppendStatus { .. },
                    OpResult::AppendStatus {
                        chunk_version,
                        op_status,
                    },
                ) => Response::AppendStatus {
                    chunk_version: *chunk_version,
                    op_status: *op_status,
                },
                (Request::SpaceReserve { .. }, OpResult::Reserve { available }) => {
                    Response::SpaceReserve {
                        available: *available,
                    }
                }
                (Request::ChunkSize { .. }, OpResult::Size { size }) => {
                    Response::ChunkSize { size: *size }
                }
                _ => Response::Ack,
            }
        };
        ResponseHeader {
            seq: self.seq,
            status: self.status,
            message: self.status_msg.clone(),
            body,
        }
    }

    /// Bulk data that rides after the response header frame.
    pub fn response_payload(&self) -> Option<&Bytes> {
        if self.status < 0 {
            return None;
        }
        match &self.result {
            OpResult::Read { data } => Some(data),
            _ => None,
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{} seq: {}", self.body.name(), self.seq)?;
        match &self.body {
            Request::ReadChunk {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
            }
            | Request::WriteSync {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
            } => write!(
                f,
                " chunk: {} version: {} offset: {} bytes: {}",
                chunk_id, chunk_version, offset, num_bytes
            ),
            Request::WritePrepare {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
                reply_requested,
                ..
            }
            | Request::WritePrepareFwd {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
                reply_requested,
                ..
            } => write!(
                f,
                " chunk: {} version: {} offset: {} bytes: {} reply: {}",
                chunk_id, chunk_version, offset, num_bytes, reply_requested
            ),
            Request::Write {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
                ..
            } => write!(
                f,
                " chunk: {} version: {} offset: {} bytes: {}",
                chunk_id, chunk_version, offset, num_bytes
            ),
            Request::RecordAppend {
                chunk_id,
                chunk_version,
                num_bytes,
                txn_id,
            } => write!(
                f,
                " chunk: {} version: {} bytes: {} txn: {}",
                chunk_id, chunk_version, num_bytes, txn_id
            ),
            Request::GetRecordAppendStatus { chunk_id, txn_id } => {
                write!(f, " chunk: {} txn: {}", chunk_id, txn_id)
            }
            Request::SpaceReserve {
                chunk_id,
                txn_id,
                num_bytes,
            }
            | Request::SpaceRelease {
                chunk_id,
                txn_id,
                num_bytes,
            } => write!(
                f,
                " chunk: {} txn: {} bytes: {}",
                chunk_id, txn_id, num_bytes
            ),
            Request::ChunkSize {
                chunk_id,
                chunk_version,
            } => write!(f, " chunk: {} version: {}", chunk_id, chunk_version),
        }
    }
}

/// Render for log lines where the op may be absent.
pub fn show_op(op: &Option<Box<Op>>) -> String {
    match op {
        Some(op) => op.to_string(),
        None => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(body: Request) -> Op {
        Op::new(
            RequestHeader {
                seq: 1,
                max_wait_ms: 0,
                body,
            },
            0,
        )
    }

    #[test]
    fn depending_types() {
        let quiet = op(Request::WritePrepare {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 16,
            hash: 0,
            reply_requested: false,
        });
        assert!(quiet.is_depending_type());

        let loud = op(Request::WritePrepare {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 16,
            hash: 0,
            reply_requested: true,
        });
        assert!(!loud.is_depending_type());

        let legacy = op(Request::Write {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 16,
            hash: 0,
        });
        assert!(legacy.is_depending_type());

        let read = op(Request::ReadChunk {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 16,
        });
        assert!(!read.is_depending_type());
    }

    #[test]
    fn failed_op_renders_error_body() {
        let mut o = op(Request::ReadChunk {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 16,
        });
        o.result = OpResult::Read {
            data: Bytes::from_static(b"0123456789abcdef"),
        };
        assert_eq!(o.response_header().body, Response::ReadChunk { len: 16 });
        assert!(o.response_payload().is_some());

        o.fail(-ferrite_common::status::EAGAIN, "chunk not readable");
        assert_eq!(o.response_header().body, Response::Error);
        assert!(o.response_payload().is_none());
    }
}
