// Copyright 2024 Oxide Computer Company

//! Server assembly: the one lock over shared state, the client registry,
//! and the bridges that carry completions and buffer grants back to the
//! owning connections.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use slog::{debug, info, o, warn};
use tokio::net::TcpListener;

use crate::buffer_pool::{BufferPool, DevicePools, GrantEvent};
use crate::client_sm::{ClientSM, Env, Event};
use crate::conn::ConnShared;
use crate::context::ServerContext;
use crate::counters::ServerCounters;
use crate::dispatcher::{
    self, current_worker, set_current_worker, NewConn, WorkerQueues, WorkerShared,
};
use crate::ops::Op;
use crate::remote_sync::{SyncRegistry, SyncTarget};
use crate::{ClientId, SyncId, WorkerId};

/// Everything guarded by the server lock.
pub struct ServerState {
    pub(crate) clients: HashMap<ClientId, ClientSM>,
    pub(crate) buffers: BufferPool,
    pub(crate) dev_buffers: DevicePools,
    pub(crate) workers: Vec<WorkerQueues>,
    pub(crate) syncs: SyncRegistry,
    next_client: u64,
    next_instance: u64,
}

pub struct ServerInner {
    state: Mutex<ServerState>,
    pub(crate) ctx: ServerContext,
    pub(crate) wakers: Vec<Arc<WorkerShared>>,
}

/// Guard for the server lock that also names the worker the current
/// thread is acting for, so completion producers can pick the inline
/// path.
pub(crate) struct StateGuard<'a> {
    guard: MutexGuard<'a, ServerState>,
}

impl<'a> StateGuard<'a> {
    fn new(guard: MutexGuard<'a, ServerState>, worker: Option<WorkerId>) -> Self {
        debug_assert!(current_worker().is_none());
        set_current_worker(worker);
        StateGuard { guard }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        set_current_worker(None);
    }
}

impl Deref for StateGuard<'_> {
    type Target = ServerState;
    fn deref(&self) -> &ServerState {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut ServerState {
        &mut self.guard
    }
}

impl ServerInner {
    pub(crate) fn lock_as(&self, worker: Option<WorkerId>) -> StateGuard<'_> {
        StateGuard::new(self.state.lock().unwrap(), worker)
    }
}

/// The chunk server's client-facing front end.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
    threads: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
}

impl Server {
    pub fn new(
        ctx: ServerContext,
        buffers: BufferPool,
        dev_buffers: DevicePools,
        num_workers: usize,
    ) -> Server {
        let num_workers = num_workers.max(1);
        let wakers = (0..num_workers).map(|_| WorkerShared::new()).collect();
        let workers = (0..num_workers).map(|_| WorkerQueues::default()).collect();
        Server {
            inner: Arc::new(ServerInner {
                state: Mutex::new(ServerState {
                    clients: HashMap::new(),
                    buffers,
                    dev_buffers,
                    workers,
                    syncs: SyncRegistry::new(),
                    next_client: 1,
                    next_instance: 10000,
                }),
                ctx,
                wakers,
            }),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Starts the worker threads.
    pub fn start(&self) -> Result<()> {
        let count = self.inner.wakers.len();
        let handles = dispatcher::spawn_workers(&self.inner, count)?;
        self.threads.lock().unwrap().extend(handles);
        Ok(())
    }

    /// Accept loop: new connections are assigned to workers round-robin
    /// and handed across through the add queue.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let log = &self.inner.ctx.log;
        info!(log, "listening on {}", listener.local_addr()?);
        let mut next_worker = 0usize;
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!(log, "set_nodelay on {}: {:?}", peer, e);
            }
            let inner = &self.inner;
            let wid = WorkerId(next_worker % inner.wakers.len());
            next_worker += 1;
            {
                let mut state = inner.lock_as(None);
                let id = ClientId(state.next_client);
                state.next_client += 1;
                let instance = state.next_instance;
                state.next_instance += 1;
                let shared = ConnShared::new(inner.ctx.config.idle_timeout_sec);
                let conn_log = log.new(o!(
                    "instance" => instance,
                    "peer" => peer.to_string(),
                ));
                let csm =
                    ClientSM::new(id, wid, instance, Arc::clone(&shared), conn_log);
                state.clients.insert(id, csm);
                inner.ctx.counters.client_added();
                debug!(
                    log,
                    "connection from {} client {} worker {}", peer, id, wid
                );
                state.workers[wid.0].add.push(NewConn { id, stream, shared });
            }
            inner.wakers[wid.0].wake();
        }
    }

    /// Completion entry point for the executor and peer sessions: takes
    /// the lock and routes the finished op back to its connection.
    pub fn op_done(&self, op: Box<Op>) {
        let mut state = self.inner.lock_as(None);
        post_op_done(&mut state, &self.inner, op);
    }

    /// Registers a replication peer session owned by `client`, so the
    /// entry is torn down when that connection goes away.
    pub fn add_sync_peer(
        &self,
        client: ClientId,
        target: Arc<dyn SyncTarget>,
    ) -> Option<SyncId> {
        let mut state = self.inner.lock_as(None);
        let worker = state.clients.get(&client)?.worker();
        let sid = state.syncs.add(worker, target);
        if let Some(csm) = state.clients.get_mut(&client) {
            csm.attach_syncer(sid);
        }
        Some(sid)
    }

    /// Queues an op for daisy-chain forwarding through a peer entry. Ops
    /// queued after the peer failed come back as host-unreachable
    /// completions.
    pub fn forward_to_peer(&self, sid: SyncId, op: Box<Op>) {
        let mut state = self.inner.lock_as(None);
        crate::remote_sync::enqueue(&mut state, &self.inner, sid, op);
    }

    pub fn counters(&self) -> Arc<ServerCounters> {
        Arc::clone(&self.inner.ctx.counters)
    }

    /// Asks every worker to wind down, then joins them.
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock_as(None);
            for q in state.workers.iter_mut() {
                q.shutdown = true;
            }
        }
        for w in &self.inner.wakers {
            w.wake();
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }
}

/// Runs one event against a client state machine, then routes whatever
/// deferred grants the dispatch produced and retires the machine if it
/// destroyed itself.
pub(crate) fn dispatch_client_event(
    state: &mut ServerState,
    inner: &ServerInner,
    id: ClientId,
    ev: Event,
) {
    let mut grants: Vec<GrantEvent> = Vec::new();
    let shared;
    let dead;
    match state.clients.get_mut(&id) {
        Some(csm) => {
            shared = csm.conn_shared();
            let mut io = shared.state.lock().unwrap();
            let mut env = Env {
                buffers: &mut state.buffers,
                dev_buffers: &mut state.dev_buffers,
                syncs: &mut state.syncs,
                workers: &mut state.workers,
                wakers: &inner.wakers,
                grants: &mut grants,
                ctx: &inner.ctx,
            };
            csm.handle_event(ev, &mut io, &mut env);
            dead = csm.is_dead();
        }
        None => return,
    }
    if dead {
        if let Some(csm) = state.clients.remove(&id) {
            state.buffers.unregister(id);
            state.dev_buffers.unregister(id);
            inner.ctx.counters.client_removed();
            debug!(
                inner.ctx.log,
                "client {} instance {} destroyed", id, csm.instance()
            );
        }
    }
    shared.kick();
    for g in grants {
        route_grant(state, inner, g);
    }
}

/// Delivers an op completion to its owning connection: inline when this
/// thread is already acting for the owner's worker, otherwise across the
/// run queue with a wakeup.
pub(crate) fn post_op_done(state: &mut ServerState, inner: &ServerInner, op: Box<Op>) {
    let Some(client) = op.client else {
        warn!(inner.ctx.log, "completion with no owner: {}", op);
        return;
    };
    let Some(csm) = state.clients.get_mut(&client) else {
        // connection already torn down; the credit went with it
        return;
    };
    let owner = csm.worker();
    if current_worker() == Some(owner) {
        dispatch_client_event(state, inner, client, Event::CmdDone(op));
    } else {
        let first = csm.enqueue_done(op);
        if first && !csm.in_run_queue() {
            csm.set_in_run_queue(true);
            state.workers[owner.0].run.push(client);
            inner.wakers[owner.0].wake();
        }
    }
}

/// Routes a buffer grant to its owner as a queued granted callback on the
/// owning worker.
pub(crate) fn route_grant(state: &mut ServerState, inner: &ServerInner, g: GrantEvent) {
    let Some(csm) = state.clients.get_mut(&g.client) else {
        return;
    };
    if !csm.set_granted() {
        return;
    }
    if !csm.has_queued_done() && !csm.in_run_queue() {
        csm.set_in_run_queue(true);
        let owner = csm.worker();
        state.workers[owner.0].run.push(g.client);
        inner.wakers[owner.0].wake();
    }
}

#[cfg(test)]
impl Server {
    /// Installs a connectionless client for driving events by hand.
    pub(crate) fn test_add_client(
        &self,
        worker: WorkerId,
    ) -> (ClientId, Arc<ConnShared>) {
        let mut state = self.inner.lock_as(None);
        let id = ClientId(state.next_client);
        state.next_client += 1;
        let instance = state.next_instance;
        state.next_instance += 1;
        let shared = ConnShared::new(self.inner.ctx.config.idle_timeout_sec);
        let csm = ClientSM::new(
            id,
            worker,
            instance,
            Arc::clone(&shared),
            self.inner.ctx.log.clone(),
        );
        state.clients.insert(id, csm);
        self.inner.ctx.counters.client_added();
        (id, shared)
    }

    pub(crate) fn test_with_state<R>(
        &self,
        worker: Option<WorkerId>,
        f: impl FnOnce(&mut ServerState, &ServerInner) -> R,
    ) -> R {
        let mut state = self.inner.lock_as(worker);
        f(&mut state, &self.inner)
    }
}
