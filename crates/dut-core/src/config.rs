//! Centralized configuration for dutlink.
//!
//! Compile-time defaults live in zero-sized const holders; the per-run knobs
//! that callers actually tune (reply waits, empty-read retries, drain budget)
//! live in the builder-style [`ExecutorConfig`].

use rand::Rng;
use std::time::Duration;

/// Tunnel lifecycle configuration.
pub struct TunnelConfig;

impl TunnelConfig {
    /// How long to wait for the forwarded local socket to appear.
    pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Poll step while waiting for the forwarded socket.
    pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Pause after asking a stale master to exit, before unlinking its socket.
    pub const STALE_EXIT_PAUSE: Duration = Duration::from_millis(100);
    /// How long to wait for the forward process after a control-channel exit
    /// before killing it.
    pub const EXIT_GRACE: Duration = Duration::from_secs(2);
    /// Lifetime of the remote hold command; the forward outlives it as long
    /// as a connection is open through it.
    pub const FORWARD_HOLD_SECS: u64 = 30;
}

/// Wire-level configuration for the local socket transport.
pub struct WireConfig;

impl WireConfig {
    /// Upper bound on a single frame payload.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Timeout for dialing the local socket and for the verification ping.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Pause before the single transparent re-dial of a failed sync exchange.
    pub const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
}

/// Per-run execution knobs.
///
/// The empty-read retry exists because the transport occasionally reports an
/// empty read although the peer is healthy; the count and backoff stay
/// configurable until that is root-caused.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bounded wait for one reply read.
    pub reply_timeout: Duration,
    /// Extra attempts after a read comes back empty within the bound.
    pub empty_read_retries: u32,
    /// Base pause between empty-read attempts.
    pub retry_backoff: Duration,
    /// Whether to jitter the backoff.
    pub jitter: bool,
    /// Total budget for draining pending replies after a failure.
    pub drain_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            empty_read_retries: 3,
            retry_backoff: Duration::from_millis(200),
            jitter: true,
            drain_timeout: Duration::from_secs(3),
        }
    }
}

impl ExecutorConfig {
    /// Create an executor config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bounded wait for one reply read.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the number of extra attempts after an empty read.
    pub fn with_empty_read_retries(mut self, retries: u32) -> Self {
        self.empty_read_retries = retries;
        self
    }

    /// Set the base pause between empty-read attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Enable or disable backoff jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the total drain budget after a failed execution.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Pause to apply before the next empty-read attempt.
    ///
    /// With jitter on, the base backoff is scaled by a random factor in
    /// 0.5..1.5 so parallel runs against one host do not retry in lockstep.
    pub fn backoff_delay(&self) -> Duration {
        if self.jitter {
            let mut rng = rand::rng();
            let factor: f64 = rng.random_range(0.5..1.5);
            Duration::from_secs_f64(self.retry_backoff.as_secs_f64() * factor)
        } else {
            self.retry_backoff
        }
    }
}
