// Copyright 2024 Oxide Computer Company
use ferrite_common::Properties;

/// Client state machine tuning, read from the server properties file.
#[derive(Debug, Clone)]
pub struct ClientSmConfig {
    /// Log every request and response at debug level.
    pub trace_request_response: bool,

    /// Honor a request's max wait budget at admission time.
    pub enforce_max_wait: bool,

    /// Treat a write that would push a client over its buffer quota as a
    /// protocol error and close the connection, instead of queueing it.
    pub close_write_on_pending_over_quota: bool,

    /// Payload size up to which a write denied at admission is drained
    /// from the socket and failed, rather than closing the connection.
    pub max_req_size_discard: i64,

    /// Inactivity timeout applied while a connection is idle.
    pub idle_timeout_sec: u64,

    /// Inactivity timeout applied while reads or writes are pending.
    pub io_timeout_sec: u64,
}

impl Default for ClientSmConfig {
    fn default() -> Self {
        ClientSmConfig {
            trace_request_response: false,
            enforce_max_wait: true,
            close_write_on_pending_over_quota: false,
            max_req_size_discard: 256 << 10,
            idle_timeout_sec: 600,
            io_timeout_sec: 300,
        }
    }
}

impl ClientSmConfig {
    pub fn from_properties(p: &Properties) -> Self {
        let d = ClientSmConfig::default();
        ClientSmConfig {
            trace_request_response: p.get_bool(
                "chunkServer.clientSM.traceRequestResponse",
                d.trace_request_response,
            ),
            enforce_max_wait: p
                .get_bool("chunkServer.clientSM.enforceMaxWait", d.enforce_max_wait),
            close_write_on_pending_over_quota: p.get_bool(
                "chunkServer.clientSM.closeWriteOnPendingOverQuota",
                d.close_write_on_pending_over_quota,
            ),
            max_req_size_discard: p.get_i64(
                "chunkServer.clientSM.maxReqSizeDiscard",
                d.max_req_size_discard,
            ),
            idle_timeout_sec: p
                .get_u64("chunkServer.client.idleTimeoutSec", d.idle_timeout_sec),
            io_timeout_sec: p
                .get_u64("chunkServer.client.ioTimeoutSec", d.io_timeout_sec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ClientSmConfig::default();
        assert!(!c.trace_request_response);
        assert!(c.enforce_max_wait);
        assert!(!c.close_write_on_pending_over_quota);
        assert_eq!(c.max_req_size_discard, 256 << 10);
        assert_eq!(c.idle_timeout_sec, 600);
        assert_eq!(c.io_timeout_sec, 300);
    }

    #[test]
    fn from_properties_overrides() {
        let p = Properties::parse(
            "chunkServer.clientSM.traceRequestResponse = 1\n\
             chunkServer.clientSM.enforceMaxWait = 0\n\
             chunkServer.clientSM.closeWriteOnPendingOverQuota = 1\n\
             chunkServer.clientSM.maxReqSizeDiscard = 65536\n\
             chunkServer.client.ioTimeoutSec = 120\n",
        )
        .unwrap();
        let c = ClientSmConfig::from_properties(&p);
        assert!(c.trace_request_response);
        assert!(!c.enforce_max_wait);
        assert!(c.close_write_on_pending_over_quota);
        assert_eq!(c.max_req_size_discard, 65536);
        assert_eq!(c.io_timeout_sec, 120);
        // untouched keys keep their defaults
        assert_eq!(c.idle_timeout_sec, 600);
    }
}
