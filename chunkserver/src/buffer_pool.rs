// Copyright 2024 Oxide Computer Company
use std::collections::{HashMap, VecDeque};

use slog::{debug, Logger};

use crate::{ClientId, DeviceId};

/// Unit of IO buffer accounting; a header frame or small reply costs one.
pub const DEFAULT_BUFFER_SIZE: i64 = 4096;

/// Which pool a grant or charge refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolTag {
    Global,
    Device(DeviceId),
}

/// A deferred buffer request that was just satisfied. Routed back to its
/// owner as a granted callback once the current event finishes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GrantEvent {
    pub tag: PoolTag,
    pub client: ClientId,
    pub bytes: i64,
}

#[derive(Debug, Default)]
struct Account {
    byte_count: i64,
}

#[derive(Debug)]
struct Waiter {
    client: ClientId,
    bytes: i64,
    since_usec: i64,
}

/// Byte-quota allocator for IO buffers.
///
/// Clients charge bytes against the pool before touching disk or queueing
/// replies, and return them as responses drain. A request that cannot be
/// satisfied immediately parks in a FIFO of waiters; returning credit
/// satisfies waiters in order and reports them as [`GrantEvent`]s for the
/// caller to deliver.
///
/// One instance guards the shared pool; additional instances guard each
/// storage device so one slow disk cannot absorb every buffer.
#[derive(Debug)]
pub struct BufferPool {
    tag: PoolTag,
    total: i64,
    remaining: i64,
    max_client_quota: i64,
    accounts: HashMap<ClientId, Account>,
    waiters: VecDeque<Waiter>,
    waiting_avg_usecs: i64,
    log: Logger,
}

impl BufferPool {
    pub fn new(tag: PoolTag, total: i64, max_client_quota: i64, log: Logger) -> Self {
        BufferPool {
            tag,
            total,
            remaining: total,
            max_client_quota: max_client_quota.min(total),
            accounts: HashMap::new(),
            waiters: VecDeque::new(),
            waiting_avg_usecs: 0,
            log,
        }
    }

    pub fn tag(&self) -> PoolTag {
        self.tag
    }

    pub fn total_byte_count(&self) -> i64 {
        self.total
    }

    pub fn used_byte_count(&self) -> i64 {
        self.total - self.remaining
    }

    pub fn free_buffer_count(&self) -> i64 {
        self.remaining / DEFAULT_BUFFER_SIZE
    }

    pub fn max_client_quota(&self) -> i64 {
        self.max_client_quota
    }

    pub fn byte_count(&self, client: ClientId) -> i64 {
        self.accounts.get(&client).map_or(0, |a| a.byte_count)
    }

    pub fn is_waiting(&self, client: ClientId) -> bool {
        self.waiters.iter().any(|w| w.client == client)
    }

    /// Bytes of the pending deferred request, if any.
    pub fn waiting_for_byte_count(&self, client: ClientId) -> i64 {
        self.waiters
            .iter()
            .find(|w| w.client == client)
            .map_or(0, |w| w.bytes)
    }

    /// Decaying average of how long deferred requests have been waiting.
    pub fn waiting_avg_usecs(&self) -> i64 {
        self.waiting_avg_usecs
    }

    pub fn is_over_quota(&self, client: ClientId, bytes: i64) -> bool {
        bytes > self.total || self.byte_count(client) + bytes > self.max_client_quota
    }

    /// Requests `bytes` of credit. Waits its turn behind earlier waiters;
    /// returns false and queues the request if it cannot be satisfied now.
    pub fn get(&mut self, client: ClientId, bytes: i64, now_usec: i64) -> bool {
        if bytes <= 0 {
            return true;
        }
        if self.waiters.is_empty() && bytes <= self.remaining {
            self.charge(client, bytes);
            self.observe_wait(0);
            return true;
        }
        self.enqueue_waiter(client, bytes, now_usec);
        false
    }

    /// Requests `bytes` for imminent disk submission. Unlike [`get`], this
    /// may cut ahead of parked waiters so an op that is already holding
    /// other resources is not stalled behind best-effort requests.
    ///
    /// [`get`]: BufferPool::get
    pub fn get_for_disk_io(
        &mut self,
        client: ClientId,
        bytes: i64,
        now_usec: i64,
    ) -> bool {
        if bytes <= 0 {
            return true;
        }
        if bytes <= self.remaining {
            self.charge(client, bytes);
            self.observe_wait(0);
            return true;
        }
        self.enqueue_waiter(client, bytes, now_usec);
        false
    }

    /// Returns credit. `bytes` may be negative when a reply outgrew its
    /// reservation; the difference stays charged until the socket drains.
    /// Freed credit satisfies parked waiters in FIFO order.
    pub fn put(
        &mut self,
        client: ClientId,
        bytes: i64,
        now_usec: i64,
    ) -> Vec<GrantEvent> {
        if bytes != 0 {
            let account = self.accounts.entry(client).or_default();
            account.byte_count -= bytes;
            self.remaining += bytes;
            debug_assert!(self.remaining <= self.total);
        }
        self.drain_waiters(now_usec)
    }

    /// Withdraws this client's deferred request, then sees whether the
    /// queue head behind it can now make progress.
    pub fn cancel_request(
        &mut self,
        client: ClientId,
        now_usec: i64,
    ) -> Vec<GrantEvent> {
        self.waiters.retain(|w| w.client != client);
        self.drain_waiters(now_usec)
    }

    /// Drops the client's account entirely, recovering any bytes it still
    /// held. Returns the recovered amount.
    pub fn unregister(&mut self, client: ClientId) -> i64 {
        self.waiters.retain(|w| w.client != client);
        let held = self
            .accounts
            .remove(&client)
            .map_or(0, |a| a.byte_count);
        if held != 0 {
            debug!(
                self.log,
                "client {} released {} bytes at teardown", client, held
            );
            self.remaining += held;
        }
        held
    }

    fn charge(&mut self, client: ClientId, bytes: i64) {
        let account = self.accounts.entry(client).or_default();
        account.byte_count += bytes;
        self.remaining -= bytes;
    }

    fn enqueue_waiter(&mut self, client: ClientId, bytes: i64, now_usec: i64) {
        // one outstanding request per client at a time
        debug_assert!(!self.is_waiting(client));
        self.waiters.push_back(Waiter {
            client,
            bytes,
            since_usec: now_usec,
        });
    }

    fn drain_waiters(&mut self, now_usec: i64) -> Vec<GrantEvent> {
        let mut grants = Vec::new();
        while let Some(w) = self.waiters.front() {
            if w.bytes > self.remaining {
                break;
            }
            if let Some(w) = self.waiters.pop_front() {
                self.charge(w.client, w.bytes);
                self.observe_wait((now_usec - w.since_usec).max(0));
                grants.push(GrantEvent {
                    tag: self.tag,
                    client: w.client,
                    bytes: w.bytes,
                });
            }
        }
        grants
    }

    fn observe_wait(&mut self, sample_usecs: i64) {
        self.waiting_avg_usecs += (sample_usecs - self.waiting_avg_usecs) / 4;
    }

    #[cfg(test)]
    pub fn set_waiting_avg_for_tests(&mut self, usecs: i64) {
        self.waiting_avg_usecs = usecs;
    }
}

/// The per-device pools, looked up by the device an op's chunk lives on.
/// Devices without a pool fall back to global-only accounting.
#[derive(Debug, Default)]
pub struct DevicePools {
    pools: HashMap<DeviceId, BufferPool>,
}

impl DevicePools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dev: DeviceId, pool: BufferPool) {
        self.pools.insert(dev, pool);
    }

    pub fn device_with_pool(&self, dev: Option<DeviceId>) -> Option<DeviceId> {
        dev.filter(|d| self.pools.contains_key(d))
    }

    pub fn max_client_quota(&self, dev: DeviceId) -> Option<i64> {
        self.pools.get(&dev).map(|p| p.max_client_quota())
    }

    pub fn is_over_quota(&self, dev: DeviceId, client: ClientId, bytes: i64) -> bool {
        self.pools
            .get(&dev)
            .map_or(false, |p| p.is_over_quota(client, bytes))
    }

    /// `None` when the device has no pool, which callers treat as granted.
    pub fn get_for_disk_io(
        &mut self,
        dev: DeviceId,
        client: ClientId,
        bytes: i64,
        now_usec: i64,
    ) -> Option<bool> {
        self.pools
            .get_mut(&dev)
            .map(|p| p.get_for_disk_io(client, bytes, now_usec))
    }

    pub fn put(
        &mut self,
        dev: DeviceId,
        client: ClientId,
        bytes: i64,
        now_usec: i64,
    ) -> Vec<GrantEvent> {
        self.pools
            .get_mut(&dev)
            .map(|p| p.put(client, bytes, now_usec))
            .unwrap_or_default()
    }

    pub fn cancel_request(
        &mut self,
        dev: DeviceId,
        client: ClientId,
        now_usec: i64,
    ) -> Vec<GrantEvent> {
        self.pools
            .get_mut(&dev)
            .map(|p| p.cancel_request(client, now_usec))
            .unwrap_or_default()
    }

    pub fn waiting_avg_usecs(&self, dev: DeviceId) -> i64 {
        self.pools.get(&dev).map_or(0, |p| p.waiting_avg_usecs())
    }

    pub fn byte_count(&self, dev: DeviceId, client: ClientId) -> i64 {
        self.pools.get(&dev).map_or(0, |p| p.byte_count(client))
    }

    pub fn unregister(&mut self, client: ClientId) {
        for pool in self.pools.values_mut() {
            pool.unregister(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_common::plain_logger;

    fn pool(total: i64) -> BufferPool {
        BufferPool::new(PoolTag::Global, total, total / 2, plain_logger())
    }

    const C1: ClientId = ClientId(1);
    const C2: ClientId = ClientId(2);
    const C3: ClientId = ClientId(3);

    #[test]
    fn immediate_grant_and_put() {
        let mut p = pool(1 << 20);
        assert!(p.get(C1, 4096, 0));
        assert_eq!(p.byte_count(C1), 4096);
        assert_eq!(p.used_byte_count(), 4096);
        let grants = p.put(C1, 4096, 1);
        assert!(grants.is_empty());
        assert_eq!(p.byte_count(C1), 0);
        assert_eq!(p.used_byte_count(), 0);
    }

    #[test]
    fn deferred_grants_are_fifo() {
        let mut p = pool(8192);
        assert!(p.get_for_disk_io(C1, 8192, 0));
        assert!(!p.get_for_disk_io(C2, 4096, 10));
        assert!(!p.get_for_disk_io(C3, 4096, 20));
        assert!(p.is_waiting(C2));

        let grants = p.put(C1, 8192, 1000);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].client, C2);
        assert_eq!(grants[1].client, C3);
        assert_eq!(p.byte_count(C2), 4096);
        assert!(!p.is_waiting(C2));
        // waits were observed
        assert!(p.waiting_avg_usecs() > 0);
    }

    #[test]
    fn plain_get_respects_waiter_queue() {
        let mut p = pool(8192);
        assert!(p.get_for_disk_io(C1, 6000, 0));
        assert!(!p.get_for_disk_io(C2, 4096, 0));
        // a plain get queues behind the existing waiter even though there
        // is credit left
        assert!(!p.get(C3, 1024, 0));
        // disk io requests may cut the line
        assert!(p.get_for_disk_io(C1, 1024, 0));
    }

    #[test]
    fn partial_put_releases_head_only() {
        let mut p = pool(8192);
        assert!(p.get_for_disk_io(C1, 8192, 0));
        assert!(!p.get_for_disk_io(C2, 2048, 0));
        assert!(!p.get_for_disk_io(C3, 8192, 0));
        let grants = p.put(C1, 4096, 100);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].client, C2);
        assert!(p.is_waiting(C3));
    }

    #[test]
    fn cancel_unblocks_queue() {
        let mut p = pool(8192);
        assert!(p.get_for_disk_io(C1, 6000, 0));
        assert!(!p.get_for_disk_io(C2, 8192, 0));
        assert!(!p.get_for_disk_io(C3, 2048, 0));
        // head of the queue withdraws; the next waiter fits
        let grants = p.cancel_request(C2, 50);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].client, C3);
        assert!(!p.is_waiting(C2));
    }

    #[test]
    fn over_quota_checks() {
        let mut p = pool(1 << 20);
        assert!(!p.is_over_quota(C1, 4096));
        assert!(p.is_over_quota(C1, (1 << 20) + 1));
        // per-client quota is half the pool
        assert!(p.is_over_quota(C1, (1 << 19) + 1));
        assert!(p.get(C1, 1 << 19, 0));
        assert!(p.is_over_quota(C1, 1));
    }

    #[test]
    fn negative_put_keeps_reply_charged() {
        let mut p = pool(1 << 20);
        assert!(p.get_for_disk_io(C1, 4096, 0));
        // the reply was 6000 bytes against a 4096 byte hold
        let _ = p.put(C1, 4096 - 6000, 0);
        assert_eq!(p.byte_count(C1), 6000);
        let _ = p.put(C1, 6000, 0);
        assert_eq!(p.byte_count(C1), 0);
    }

    #[test]
    fn unregister_recovers_leaked_credit() {
        let mut p = pool(1 << 20);
        assert!(p.get(C1, 4096, 0));
        assert_eq!(p.unregister(C1), 4096);
        assert_eq!(p.used_byte_count(), 0);
    }

    #[test]
    fn zero_byte_requests_always_succeed() {
        let mut p = pool(4096);
        assert!(p.get_for_disk_io(C1, 4096, 0));
        assert!(!p.get_for_disk_io(C2, 4096, 0));
        // the free pass: no bytes requested, no queueing
        assert!(p.get(C3, 0, 0));
        assert!(!p.is_waiting(C3));
    }

    #[test]
    fn waiting_average_decays() {
        let mut p = pool(4096);
        p.set_waiting_avg_for_tests(100_000);
        assert!(p.get(C1, 1024, 0));
        let v1 = p.waiting_avg_usecs();
        assert!(v1 < 100_000);
        let _ = p.put(C1, 1024, 0);
        assert!(p.get(C1, 1024, 0));
        assert!(p.waiting_avg_usecs() < v1);
    }
}
