// Copyright 2024 Oxide Computer Company
use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single header frame, length prefix included.
///
/// A client that presents a larger frame is malformed and gets its
/// connection closed; bulk data never rides in the header frame.
pub const MAX_RPC_HEADER_LEN: usize = 1024;

/// Granularity of data checksums on disk. Write reservations round payload
/// sizes up to this, since partial blocks still cost a full block of
/// buffer space to verify.
pub const CHECKSUM_BLOCKSIZE: usize = 64 * 1024;

pub type ChunkId = i64;

/// A client RPC. The header frame carries one of these; `WritePrepare`,
/// `WritePrepareFwd`, `Write` and `RecordAppend` are followed by
/// `num_bytes` of raw payload on the wire.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ReadChunk {
        chunk_id: ChunkId,
        chunk_version: i64,
        offset: i64,
        num_bytes: i64,
    },
    WritePrepare {
        chunk_id: ChunkId,
        chunk_version: i64,
        offset: i64,
        num_bytes: i64,
        hash: u64,
        reply_requested: bool,
    },
    /// A write prepare that also names the remaining replicas in the
    /// daisy chain. The payload is shared with the forwarded copies.
    WritePrepareFwd {
        chunk_id: ChunkId,
        chunk_version: i64,
        offset: i64,
        num_bytes: i64,
        hash: u64,
        reply_requested: bool,
        forward: Vec<SocketAddr>,
    },
    WriteSync {
        chunk_id: ChunkId,
        chunk_version: i64,
        offset: i64,
        num_bytes: i64,
    },
    /// Legacy combined prepare plus sync.
    Write {
        chunk_id: ChunkId,
        chunk_version: i64,
        offset: i64,
        num_bytes: i64,
        hash: u64,
    },
    RecordAppend {
        chunk_id: ChunkId,
        chunk_version: i64,
        num_bytes: i64,
        txn_id: i64,
    },
    GetRecordAppendStatus {
        chunk_id: ChunkId,
        txn_id: i64,
    },
    SpaceReserve {
        chunk_id: ChunkId,
        txn_id: i64,
        num_bytes: i64,
    },
    SpaceRelease {
        chunk_id: ChunkId,
        txn_id: i64,
        num_bytes: i64,
    },
    ChunkSize {
        chunk_id: ChunkId,
        chunk_version: i64,
    },
}

impl Request {
    /// Raw payload bytes that follow this request's header frame.
    pub fn payload_bytes(&self) -> i64 {
        match self {
            Request::WritePrepare { num_bytes, .. }
            | Request::WritePrepareFwd { num_bytes, .. }
            | Request::Write { num_bytes, .. }
            | Request::RecordAppend { num_bytes, .. } => (*num_bytes).max(0),
            _ => 0,
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        match self {
            Request::ReadChunk { chunk_id, .. }
            | Request::WritePrepare { chunk_id, .. }
            | Request::WritePrepareFwd { chunk_id, .. }
            | Request::WriteSync { chunk_id, .. }
            | Request::Write { chunk_id, .. }
            | Request::RecordAppend { chunk_id, .. }
            | Request::GetRecordAppendStatus { chunk_id, .. }
            | Request::SpaceReserve { chunk_id, .. }
            | Request::SpaceRelease { chunk_id, .. }
            | Request::ChunkSize { chunk_id, .. } => *chunk_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::ReadChunk { .. } => "read",
            Request::WritePrepare { .. } => "write-prepare",
            Request::WritePrepareFwd { .. } => "write-prepare-fwd",
            Request::WriteSync { .. } => "write-sync",
            Request::Write { .. } => "write",
            Request::RecordAppend { .. } => "record-append",
            Request::GetRecordAppendStatus { .. } => "get-record-append-status",
            Request::SpaceReserve { .. } => "space-reserve",
            Request::SpaceRelease { .. } => "space-release",
            Request::ChunkSize { .. } => "chunk-size",
        }
    }
}

/// The header frame of a request: sequence number, wait budget, body.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub seq: u64,
    /// Milliseconds the client is willing to wait for buffers before it
    /// would rather see the op fail; zero or negative disables the budget.
    pub max_wait_ms: i64,
    pub body: Request,
}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Plain acknowledgement for write family and release ops.
    Ack,
    /// `len` bytes of chunk data follow the header frame.
    ReadChunk { len: i64 },
    RecordAppend { append_offset: i64 },
    AppendStatus { chunk_version: i64, op_status: i32 },
    SpaceReserve { available: i64 },
    ChunkSize { size: i64 },
    /// Used whenever the header status is negative.
    Error,
}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub seq: u64,
    pub status: i32,
    pub message: String,
    pub body: Response,
}

impl ResponseHeader {
    /// Raw payload bytes that follow this response's header frame.
    pub fn payload_bytes(&self) -> i64 {
        match &self.body {
            Response::ReadChunk { len } => (*len).max(0),
            _ => 0,
        }
    }
}

/// Reports whether a complete header frame is buffered.
///
/// `Ok(Some(n))` means the first `n` bytes of `buf` (prefix included) form
/// one frame. `Ok(None)` means more bytes are needed. An oversized or
/// undersized prefix is a protocol-fatal error.
pub fn is_msg_avail(buf: &BytesMut) -> anyhow::Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&buf[0..4]);
    let len = u32::from_le_bytes(length_bytes) as usize;
    let total = len
        .checked_add(4)
        .ok_or_else(|| anyhow::anyhow!("absurd header frame length"))?;
    if total > MAX_RPC_HEADER_LEN {
        bail!(
            "header frame is {} bytes, more than maximum {}",
            total,
            MAX_RPC_HEADER_LEN
        );
    }
    if len == 0 {
        bail!("empty header frame");
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Deserializes the header frame found by [`is_msg_avail`]. `frame` is the
/// full `cmd_len` bytes including the length prefix; the caller consumes
/// them from its input buffer afterwards.
pub fn parse_command(frame: &[u8]) -> anyhow::Result<RequestHeader> {
    if frame.len() < 4 {
        bail!("short header frame");
    }
    Ok(bincode::deserialize(&frame[4..])?)
}

fn encode_frame<T: Serialize>(m: &T, dst: &mut BytesMut) -> anyhow::Result<()> {
    let len = bincode::serialized_size(m)? as usize;
    if len + 4 > MAX_RPC_HEADER_LEN {
        bail!(
            "header frame is {} bytes, more than maximum {}",
            len + 4,
            MAX_RPC_HEADER_LEN
        );
    }
    dst.reserve(len + 4);
    dst.put_u32_le(len as u32);
    bincode::serialize_into(dst.writer(), m)?;
    Ok(())
}

/// Encodes request and response header frames. Payload bytes are appended
/// by the caller after the frame, per `payload_bytes`.
#[derive(Debug, Default)]
pub struct RpcEncoder {}

impl RpcEncoder {
    pub fn new() -> Self {
        RpcEncoder {}
    }
}

impl Encoder<&RequestHeader> for RpcEncoder {
    type Error = anyhow::Error;

    fn encode(
        &mut self,
        m: &RequestHeader,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        encode_frame(m, dst)
    }
}

impl Encoder<&ResponseHeader> for RpcEncoder {
    type Error = anyhow::Error;

    fn encode(
        &mut self,
        m: &ResponseHeader,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        encode_frame(m, dst)
    }
}

/// Decodes response frames together with their trailing payload, for the
/// client side of the protocol.
#[derive(Debug, Default)]
pub struct ResponseDecoder {}

impl ResponseDecoder {
    pub fn new() -> Self {
        ResponseDecoder {}
    }
}

impl Decoder for ResponseDecoder {
    type Item = (ResponseHeader, Bytes);
    type Error = anyhow::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let Some(total) = is_msg_avail(src)? else {
            return Ok(None);
        };
        let header: ResponseHeader = bincode::deserialize(&src[4..total])?;
        let payload = header.payload_bytes() as usize;
        if src.len() < total + payload {
            src.reserve(total + payload - src.len());
            return Ok(None);
        }
        src.advance(total);
        let data = src.split_to(payload).freeze();
        Ok(Some((header, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn round_trip(input: &RequestHeader) -> Result<RequestHeader> {
        let mut enc = RpcEncoder::new();
        let mut buf = BytesMut::new();
        enc.encode(input, &mut buf)?;
        let total = is_msg_avail(&buf)?.expect("frame should be complete");
        assert_eq!(total, buf.len());
        parse_command(&buf[..total])
    }

    #[test]
    fn rt_read() -> Result<()> {
        let input = RequestHeader {
            seq: 7,
            max_wait_ms: 0,
            body: Request::ReadChunk {
                chunk_id: 42,
                chunk_version: 1,
                offset: 0,
                num_bytes: 4096,
            },
        };
        assert_eq!(input, round_trip(&input)?);
        Ok(())
    }

    #[test]
    fn rt_write_prepare_fwd() -> Result<()> {
        let input = RequestHeader {
            seq: 19,
            max_wait_ms: 250,
            body: Request::WritePrepareFwd {
                chunk_id: 3,
                chunk_version: 2,
                offset: 65536,
                num_bytes: 1024,
                hash: 0xfeed,
                reply_requested: false,
                forward: vec!["127.0.0.1:20100".parse().unwrap()],
            },
        };
        assert_eq!(input, round_trip(&input)?);
        Ok(())
    }

    #[test]
    fn rt_space_reserve() -> Result<()> {
        let input = RequestHeader {
            seq: 1,
            max_wait_ms: 0,
            body: Request::SpaceReserve {
                chunk_id: 9,
                txn_id: 77,
                num_bytes: 1 << 20,
            },
        };
        assert_eq!(input, round_trip(&input)?);
        Ok(())
    }

    #[test]
    fn truncated_frame_is_not_available() -> Result<()> {
        let input = RequestHeader {
            seq: 2,
            max_wait_ms: 0,
            body: Request::ChunkSize {
                chunk_id: 11,
                chunk_version: 1,
            },
        };
        let mut buf = BytesMut::new();
        RpcEncoder::new().encode(&input, &mut buf)?;
        buf.truncate(buf.len() - 1);
        assert_eq!(is_msg_avail(&buf)?, None);
        Ok(())
    }

    #[test]
    fn oversized_prefix_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_RPC_HEADER_LEN as u32);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(is_msg_avail(&buf).is_err());
    }

    #[test]
    fn payload_sizes() {
        let w = Request::WritePrepare {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 512,
            hash: 0,
            reply_requested: true,
        };
        assert_eq!(w.payload_bytes(), 512);
        let r = Request::ReadChunk {
            chunk_id: 1,
            chunk_version: 1,
            offset: 0,
            num_bytes: 512,
        };
        assert_eq!(r.payload_bytes(), 0);
    }

    #[test]
    fn response_decoder_waits_for_payload() -> Result<()> {
        let header = ResponseHeader {
            seq: 7,
            status: 0,
            message: String::new(),
            body: Response::ReadChunk { len: 8 },
        };
        let mut buf = BytesMut::new();
        RpcEncoder::new().encode(&header, &mut buf)?;
        buf.extend_from_slice(b"abcd");

        let mut dec = ResponseDecoder::new();
        assert!(dec.decode(&mut buf)?.is_none());
        buf.extend_from_slice(b"efgh");
        let (got, data) = dec.decode(&mut buf)?.expect("complete response");
        assert_eq!(got, header);
        assert_eq!(&data[..], b"abcdefgh");
        Ok(())
    }

    #[test]
    fn error_response_has_no_payload() -> Result<()> {
        let header = ResponseHeader {
            seq: 9,
            status: -ferrite_common::status::ESERVERBUSY,
            message: "exceeds max wait".to_string(),
            body: Response::Error,
        };
        let mut buf = BytesMut::new();
        RpcEncoder::new().encode(&header, &mut buf)?;
        let (got, data) = ResponseDecoder::new()
            .decode(&mut buf)?
            .expect("complete response");
        assert_eq!(got.payload_bytes(), 0);
        assert!(data.is_empty());
        assert_eq!(got.message, "exceeds max wait");
        Ok(())
    }
}
