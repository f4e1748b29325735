// Copyright 2024 Oxide Computer Company
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use slog::{info, o};
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;

use ferrite_chunkserver::buffer_pool::{BufferPool, DevicePools, PoolTag};
use ferrite_chunkserver::config::ClientSmConfig;
use ferrite_chunkserver::context::{ServerContext, SystemClock};
use ferrite_chunkserver::counters::ServerCounters;
use ferrite_chunkserver::server::Server;
use ferrite_chunkserver::storage::{AppendManager, ChunkStore, DiskExecutor};
use ferrite_common::{build_logger, Properties};

#[derive(Debug, Parser)]
#[command(about = "chunk-side storage component")]
struct Opt {
    /// Address to accept client connections on.
    #[arg(short, long, default_value = "0.0.0.0:20000")]
    listen: SocketAddr,

    /// Data directory; repeat for one per device.
    #[arg(short, long, required = true)]
    data: Vec<PathBuf>,

    /// Create the data directories instead of opening them.
    #[arg(short, long)]
    create: bool,

    /// Server properties file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client worker threads.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Shared IO buffer pool size in bytes.
    #[arg(long, default_value_t = 128 << 20)]
    buffer_bytes: i64,

    /// Per-device IO buffer pool size in bytes.
    #[arg(long, default_value_t = 32 << 20)]
    device_buffer_bytes: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    let log = build_logger();

    let props = match &opt.config {
        Some(path) => Properties::load(path)?,
        None => Properties::new(),
    };
    let config = ClientSmConfig::from_properties(&props);

    let store = if opt.create {
        ChunkStore::create(opt.data.clone(), log.new(o!("task" => "store")))?
    } else {
        ChunkStore::open(opt.data.clone(), log.new(o!("task" => "store")))?
    };
    let appender =
        AppendManager::new(Arc::clone(&store), log.new(o!("task" => "append")));

    let (completions_tx, mut completions_rx) = unbounded_channel();
    let executor = DiskExecutor::new(
        Arc::clone(&store),
        Arc::clone(&appender),
        completions_tx,
        log.new(o!("task" => "disk")),
    );

    let counters = Arc::new(ServerCounters::default());
    let ctx = ServerContext {
        chunks: store.clone(),
        appender,
        executor,
        clock: Arc::new(SystemClock),
        counters,
        config,
        log: log.clone(),
    };

    let buffers = BufferPool::new(
        PoolTag::Global,
        opt.buffer_bytes,
        opt.buffer_bytes / 4,
        log.new(o!("pool" => "global")),
    );
    let mut dev_buffers = DevicePools::new();
    for dev in store.devices() {
        dev_buffers.insert(
            dev,
            BufferPool::new(
                PoolTag::Device(dev),
                opt.device_buffer_bytes,
                opt.device_buffer_bytes / 2,
                log.new(o!("pool" => format!("dev-{}", dev))),
            ),
        );
    }

    let server = Server::new(ctx, buffers, dev_buffers, opt.workers);
    server.start()?;

    // completions from the IO threads cross back into the server here
    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(op) = completions_rx.recv().await {
                server.op_done(op);
            }
        });
    }

    let listener = TcpListener::bind(opt.listen).await?;
    tokio::select! {
        res = server.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!(log, "interrupt, shutting down");
        }
    }
    server.stop();
    Ok(())
}
