// Copyright 2024 Oxide Computer Company

//! End to end: a real listener, real worker threads, a real chunk store
//! on temp directories, and a client speaking the framed protocol.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::codec::{Encoder, FramedRead};

use ferrite_chunkserver::buffer_pool::{BufferPool, DevicePools, PoolTag};
use ferrite_chunkserver::config::ClientSmConfig;
use ferrite_chunkserver::context::{ServerContext, SystemClock};
use ferrite_chunkserver::counters::ServerCounters;
use ferrite_chunkserver::server::Server;
use ferrite_chunkserver::storage::{AppendManager, ChunkStore, DiskExecutor};
use ferrite_common::{integrity_hash, plain_logger, status};
use ferrite_protocol::{
    Request, RequestHeader, Response, ResponseDecoder, ResponseHeader,
    RpcEncoder,
};

struct TestServer {
    server: Server,
    addr: std::net::SocketAddr,
    counters: Arc<ServerCounters>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start_server() -> TestServer {
    let log = plain_logger();
    let d1 = tempfile::tempdir().unwrap();
    let d2 = tempfile::tempdir().unwrap();
    let dirs = vec![d1.path().to_path_buf(), d2.path().to_path_buf()];
    let store = ChunkStore::create(dirs, log.clone()).unwrap();
    let appender = AppendManager::new(Arc::clone(&store), log.clone());

    let (completions_tx, mut completions_rx) = unbounded_channel();
    let executor = DiskExecutor::new(
        Arc::clone(&store),
        Arc::clone(&appender),
        completions_tx,
        log.clone(),
    );
    let counters = Arc::new(ServerCounters::default());
    let ctx = ServerContext {
        chunks: store.clone(),
        appender,
        executor,
        clock: Arc::new(SystemClock),
        counters: Arc::clone(&counters),
        config: ClientSmConfig::default(),
        log: log.clone(),
    };
    let buffers =
        BufferPool::new(PoolTag::Global, 64 << 20, 16 << 20, log.clone());
    let mut dev_buffers = DevicePools::new();
    for dev in store.devices() {
        dev_buffers.insert(
            dev,
            BufferPool::new(PoolTag::Device(dev), 16 << 20, 8 << 20, log.clone()),
        );
    }

    let server = Server::new(ctx, buffers, dev_buffers, 2);
    server.start().unwrap();
    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(op) = completions_rx.recv().await {
                server.op_done(op);
            }
        });
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
    }
    TestServer {
        server,
        addr,
        counters,
        _dirs: vec![d1, d2],
    }
}

struct Client {
    wr: tokio::net::tcp::OwnedWriteHalf,
    responses: FramedRead<OwnedReadHalf, ResponseDecoder>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Client {
        let sock = TcpStream::connect(addr).await.unwrap();
        sock.set_nodelay(true).unwrap();
        let (rd, wr) = sock.into_split();
        Client {
            wr,
            responses: FramedRead::new(rd, ResponseDecoder::new()),
        }
    }

    async fn send(&mut self, hdr: RequestHeader, payload: &[u8]) {
        let mut buf = BytesMut::new();
        RpcEncoder::new().encode(&hdr, &mut buf).unwrap();
        buf.extend_from_slice(payload);
        self.wr.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> (ResponseHeader, bytes::Bytes) {
        tokio::time::timeout(Duration::from_secs(10), self.responses.next())
            .await
            .expect("response within timeout")
            .expect("connection stays open")
            .expect("response decodes")
    }
}

fn write_prepare(seq: u64, chunk_id: i64, offset: i64, payload: &[u8]) -> RequestHeader {
    RequestHeader {
        seq,
        max_wait_ms: 0,
        body: Request::WritePrepare {
            chunk_id,
            chunk_version: 1,
            offset,
            num_bytes: payload.len() as i64,
            hash: integrity_hash(&[payload]),
            reply_requested: true,
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn read_write_round_trip() {
    let ts = start_server().await;
    let mut c = Client::connect(ts.addr).await;

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    c.send(write_prepare(1, 101, 0, &payload), &payload).await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.seq, 1);
    assert_eq!(resp.status, 0);
    assert_eq!(resp.body, Response::Ack);

    c.send(
        RequestHeader {
            seq: 2,
            max_wait_ms: 0,
            body: Request::ReadChunk {
                chunk_id: 101,
                chunk_version: 1,
                offset: 0,
                num_bytes: payload.len() as i64,
            },
        },
        b"",
    )
    .await;
    let (resp, data) = c.recv().await;
    assert_eq!(resp.seq, 2);
    assert_eq!(resp.status, 0);
    assert_eq!(&data[..], &payload[..]);

    c.send(
        RequestHeader {
            seq: 3,
            max_wait_ms: 0,
            body: Request::ChunkSize {
                chunk_id: 101,
                chunk_version: 1,
            },
        },
        b"",
    )
    .await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.status, 0);
    assert_eq!(
        resp.body,
        Response::ChunkSize {
            size: payload.len() as i64
        }
    );

    ts.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn write_prepare_and_sync_respond_in_order() {
    let ts = start_server().await;
    let mut c = Client::connect(ts.addr).await;

    let payload = vec![0x5au8; 65536];
    let mut hdr = write_prepare(1, 202, 0, &payload);
    if let Request::WritePrepare {
        reply_requested, ..
    } = &mut hdr.body
    {
        *reply_requested = false;
    }
    c.send(hdr, &payload).await;
    c.send(
        RequestHeader {
            seq: 2,
            max_wait_ms: 0,
            body: Request::WriteSync {
                chunk_id: 202,
                chunk_version: 1,
                offset: 0,
                num_bytes: payload.len() as i64,
            },
        },
        b"",
    )
    .await;

    // the sync never responds before its predecessor
    let (first, _) = c.recv().await;
    assert_eq!(first.seq, 1);
    assert_eq!(first.status, 0);
    let (second, _) = c.recv().await;
    assert_eq!(second.seq, 2);
    assert_eq!(second.status, 0);

    ts.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn record_append_flow() {
    let ts = start_server().await;
    let mut c = Client::connect(ts.addr).await;

    c.send(
        RequestHeader {
            seq: 1,
            max_wait_ms: 0,
            body: Request::SpaceReserve {
                chunk_id: 303,
                txn_id: 9,
                num_bytes: 1 << 16,
            },
        },
        b"",
    )
    .await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.status, 0);
    assert!(matches!(resp.body, Response::SpaceReserve { available } if available > 0));

    let record = b"one appended record";
    c.send(
        RequestHeader {
            seq: 2,
            max_wait_ms: 0,
            body: Request::RecordAppend {
                chunk_id: 303,
                chunk_version: 1,
                num_bytes: record.len() as i64,
                txn_id: 9,
            },
        },
        record,
    )
    .await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.status, 0);
    assert_eq!(resp.body, Response::RecordAppend { append_offset: 0 });

    c.send(
        RequestHeader {
            seq: 3,
            max_wait_ms: 0,
            body: Request::GetRecordAppendStatus {
                chunk_id: 303,
                txn_id: 9,
            },
        },
        b"",
    )
    .await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.status, 0);
    assert_eq!(
        resp.body,
        Response::AppendStatus {
            chunk_version: 1,
            op_status: 0
        }
    );

    ts.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_chunk_read_fails_softly() {
    let ts = start_server().await;
    let mut c = Client::connect(ts.addr).await;

    c.send(
        RequestHeader {
            seq: 4,
            max_wait_ms: 0,
            body: Request::ReadChunk {
                chunk_id: 999,
                chunk_version: 1,
                offset: 0,
                num_bytes: 512,
            },
        },
        b"",
    )
    .await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.seq, 4);
    assert_eq!(resp.status, -status::EAGAIN);
    assert_eq!(resp.message, "chunk not readable");

    // the connection survives the failed read
    let payload = b"still alive";
    c.send(write_prepare(5, 77, 0, payload), payload).await;
    let (resp, _) = c.recv().await;
    assert_eq!(resp.seq, 5);
    assert_eq!(resp.status, 0);

    ts.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_tears_the_client_down() {
    let ts = start_server().await;
    {
        let mut c = Client::connect(ts.addr).await;
        let payload = b"going away";
        c.send(write_prepare(1, 55, 0, payload), payload).await;
        let (resp, _) = c.recv().await;
        assert_eq!(resp.status, 0);
        assert_eq!(ts.counters.clients(), 1);
    }
    // the dropped socket reaches the state machine as a network error
    // and the client is retired
    let mut tries = 0;
    while ts.counters.clients() != 0 {
        tries += 1;
        assert!(tries < 100, "client never torn down");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    ts.server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn many_clients_across_workers() {
    let ts = start_server().await;
    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let addr = ts.addr;
        tasks.push(tokio::spawn(async move {
            let mut c = Client::connect(addr).await;
            let payload = vec![i as u8; 4096];
            c.send(write_prepare(1, 1000 + i as i64, 0, &payload), &payload)
                .await;
            let (resp, _) = c.recv().await;
            assert_eq!(resp.status, 0);

            c.send(
                RequestHeader {
                    seq: 2,
                    max_wait_ms: 0,
                    body: Request::ReadChunk {
                        chunk_id: 1000 + i as i64,
                        chunk_version: 1,
                        offset: 0,
                        num_bytes: 4096,
                    },
                },
                b"",
            )
            .await;
            let (resp, data) = c.recv().await;
            assert_eq!(resp.status, 0);
            assert!(data.iter().all(|b| *b == i as u8));
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    ts.server.stop();
}
