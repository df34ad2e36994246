//! Engine configuration.
//!
//! A plain value handed to every socket constructor — there is no
//! process-wide default. `from_env` layers `FARSOCK_*` variables over the
//! defaults for deployments that tune without recompiling.

use std::time::Duration;

use crate::retry::{BackoffPolicy, RetryPolicy, RetryPredicate};

/// Tunables for acquisition, handshake, and teardown.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Ping attempts per candidate before it is dropped.
    pub ping_attempts: u32,
    /// Base ping timeout; attempt `n` gets `base * (n + 1)`.
    pub ping_timeout: Duration,
    /// Link RPC attempts per candidate before it is dropped.
    pub link_attempts: u32,
    /// Base timeout for a broadcast round; grows with the attempt count.
    pub broadcast_timeout: Duration,
    /// Per-candidate broadcast attempts before it stops being requeued.
    pub broadcast_attempts: u32,
    /// Timeout for ordinary control RPCs. `None` relies on cancellation.
    pub rpc_timeout: Option<Duration>,
    /// Independent budget for stream-brokering teardown.
    pub close_timeout: Duration,
    /// Bound on the per-link outbound pipe (messages in flight).
    pub send_queue_depth: usize,
    /// Concurrent directory lookups during discovery.
    pub discovery_concurrency: usize,
    /// Largest `Data` payload put on the wire in one message.
    pub max_fragment: u32,
    /// Which pipeline faults are retried.
    pub retryable: RetryPredicate,
    /// Backoff for directory operations marked transient.
    pub directory_retry: RetryPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            ping_attempts: 5,
            ping_timeout: Duration::from_secs(1),
            link_attempts: 3,
            broadcast_timeout: Duration::from_secs(2),
            broadcast_attempts: 5,
            rpc_timeout: None,
            close_timeout: Duration::from_secs(3),
            send_queue_depth: 2,
            discovery_concurrency: 2,
            max_fragment: 16_384,
            retryable: RetryPredicate::Unicast,
            directory_retry: RetryPolicy {
                max_attempts: 3,
                backoff: BackoffPolicy::Linear {
                    base: Duration::from_millis(250),
                },
            },
        }
    }
}

impl ProxyConfig {
    /// Defaults overlaid with `FARSOCK_*` environment variables.
    ///
    /// Recognized: `FARSOCK_PING_ATTEMPTS`, `FARSOCK_PING_TIMEOUT_MS`,
    /// `FARSOCK_RPC_TIMEOUT_MS` (0 = no timeout), `FARSOCK_CLOSE_TIMEOUT_MS`,
    /// `FARSOCK_SEND_QUEUE`, `FARSOCK_MAX_FRAGMENT`.
    pub fn from_env() -> Self {
        let mut config = ProxyConfig::default();

        if let Some(v) = env_u32("FARSOCK_PING_ATTEMPTS") {
            config.ping_attempts = v.max(1);
        }
        if let Some(v) = env_u64("FARSOCK_PING_TIMEOUT_MS") {
            config.ping_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("FARSOCK_RPC_TIMEOUT_MS") {
            config.rpc_timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = env_u64("FARSOCK_CLOSE_TIMEOUT_MS") {
            config.close_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u32("FARSOCK_SEND_QUEUE") {
            config.send_queue_depth = (v as usize).clamp(1, 16);
        }
        if let Some(v) = env_u32("FARSOCK_MAX_FRAGMENT") {
            config.max_fragment = v.max(1);
        }

        config
    }

    /// Retry policy for the ping stage.
    pub fn ping_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.ping_attempts,
            backoff: BackoffPolicy::EscalatingTimeout {
                base: self.ping_timeout,
            },
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
