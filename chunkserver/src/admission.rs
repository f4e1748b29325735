// Copyright 2024 Oxide Computer Company

//! Admission decision primitives shared by the read, write, and default
//! paths of the client state machine.

use ferrite_protocol::CHECKSUM_BLOCKSIZE;

use crate::buffer_pool::DEFAULT_BUFFER_SIZE;

/// Buffer bytes an op must hold before it may touch the storage layer:
/// one buffer for the header and reply, plus the payload rounded up to
/// checksum block granularity.
///
/// The `forward` flag is accepted but reserves nothing extra. Forwarded
/// writes share their payload buffers with the local copy, so the daisy
/// chain rides on the same reservation.
pub fn io_request_bytes(num_bytes: i64, _forward: bool) -> i64 {
    let mut ret = DEFAULT_BUFFER_SIZE;
    if num_bytes > 0 {
        let block = CHECKSUM_BLOCKSIZE as i64;
        ret += (num_bytes + block - 1) / block * block;
    }
    ret
}

/// The max-wait admission predicate.
///
/// An op with a wait budget fails instead of parking when the observed
/// queue latency already exceeds the budget and the remaining budget
/// cannot absorb it either.
pub fn exceeds_max_wait(
    cur_wait_usecs: i64,
    max_wait_usecs: i64,
    start_time_usecs: i64,
    now_usecs: i64,
) -> bool {
    if max_wait_usecs <= 0 {
        return false;
    }
    cur_wait_usecs > max_wait_usecs
        && now_usecs + cur_wait_usecs >= start_time_usecs + max_wait_usecs
}
