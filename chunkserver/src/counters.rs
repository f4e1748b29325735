// Copyright 2024 Oxide Computer Company
use std::sync::atomic::{AtomicU64, Ordering};

/// Server-wide request accounting, shared across all connections.
///
/// Everything here is monotonic except `clients` and `ops_in_flight`, which
/// track current population. Counters are updated from whichever thread
/// holds the server lock, but reads are allowed from anywhere.
#[derive(Debug, Default)]
pub struct ServerCounters {
    clients: AtomicU64,
    clients_total: AtomicU64,
    bad_requests: AtomicU64,
    bad_request_headers: AtomicU64,
    wait_time_exceeded: AtomicU64,
    ops_in_flight: AtomicU64,
    ops_done: AtomicU64,
    op_usecs: AtomicU64,
}

impl ServerCounters {
    pub fn client_added(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
        self.clients_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_removed(&self) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_request_header(&self) {
        self.bad_request_headers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wait_time_exceeded(&self) {
        self.wait_time_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_inserted(&self) {
        self.ops_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_finished(&self) {
        self.ops_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a completed request and the time it spent in the server.
    pub fn request_done(&self, usecs: u64) {
        self.ops_done.fetch_add(1, Ordering::Relaxed);
        self.op_usecs.fetch_add(usecs, Ordering::Relaxed);
    }

    pub fn clients(&self) -> u64 {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn clients_total(&self) -> u64 {
        self.clients_total.load(Ordering::Relaxed)
    }

    pub fn bad_requests(&self) -> u64 {
        self.bad_requests.load(Ordering::Relaxed)
    }

    pub fn bad_request_headers(&self) -> u64 {
        self.bad_request_headers.load(Ordering::Relaxed)
    }

    pub fn wait_time_exceeded_count(&self) -> u64 {
        self.wait_time_exceeded.load(Ordering::Relaxed)
    }

    pub fn ops_in_flight(&self) -> u64 {
        self.ops_in_flight.load(Ordering::Relaxed)
    }

    pub fn ops_done(&self) -> u64 {
        self.ops_done.load(Ordering::Relaxed)
    }

    pub fn op_usecs(&self) -> u64 {
        self.op_usecs.load(Ordering::Relaxed)
    }
}
