//! Session timing and retry budgets.
//!
//! Every deadline in the connect path lives here so the connect round,
//! poller, and running guard agree on one set of numbers.

use std::time::Duration;

/// Snapshot checks charged against one candidate before giving up on it.
pub const CANDIDATE_MAX_CHECKS: usize = 3;

/// Cadence of the overlay state poller.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Connect-and-close samples per peer during ranking.
pub const PEER_PROBE_SAMPLE_COUNT: usize = 1;

/// Per-sample probe deadline.
pub const PEER_PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// Concurrent probe workers.
pub const PEER_PROBE_CONCURRENCY: usize = 4;

/// Sentinel RTT assigned to unreachable peers so they still sort, last.
pub const PEER_PROBE_UNREACHABLE_RTT: Duration = Duration::from_millis(9999);

/// How long to wait for the overlay to report a virtual IP.
pub const WAIT_IP_TIMEOUT: Duration = Duration::from_secs(16);

/// Consecutive failed evaluations before the running guard requests reconnect.
pub const RUNNING_CONSECUTIVE_FAILED: usize = 3;

/// Probe deadline used by the running guard.
pub const RUNNING_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// peer_removed events within the burst window that trigger reconnect.
pub const PEER_REMOVED_BURST_COUNT: usize = 3;

/// Window for the peer_removed burst detector.
pub const PEER_REMOVED_BURST_WINDOW: Duration = Duration::from_secs(10);

/// TTL for deduplicating repeated candidate-decision log lines.
pub const CANDIDATE_LOG_LIMITER_TTL: Duration = Duration::from_secs(10);

/// How long to keep the current peer while only bootstrap servers answer.
pub const BOOTSTRAP_WAIT_TIMEOUT: Duration = Duration::from_secs(12);

/// Subnet candidates derived per network hash.
pub const SUBNET_CANDIDATE_COUNT: usize = 8;

/// Deadline for one overlay CLI invocation.
pub const CLI_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Refresh interval of the running-phase peer-info printout.
pub const PEER_INFO_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
