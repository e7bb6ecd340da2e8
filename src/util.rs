//! Shared timing constants and small helpers.
//!
//! IMPORTANT:
//! - No collector-specific logic should live here.
//! - Every network call carries one of the deadlines below, which is
//!   separate from the cancellation scope it runs under.
//!

use std::time::Duration;

use rand::random_range;

// ------------------------------------------------------------
// Session tracking
// ------------------------------------------------------------

/// Delay between successful "get session id" polls.
pub const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before retrying after a failed session poll.
pub const SESSION_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Deadline of a single "get session id" call.
pub const SESSION_CALL_DEADLINE: Duration = Duration::from_secs(5);

/// How often the orchestrator looks for a valid session.
pub const SESSION_AWAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Time a running cohort gets to drain after the process shutdown
/// signal before its tasks are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ------------------------------------------------------------
// Collectors
// ------------------------------------------------------------

/// Deadline of the unary calls issued on every export tick.
pub const COLLECTOR_CALL_DEADLINE: Duration = Duration::from_millis(500);

/// Delay before a failed or closed stream is reopened.
pub const STREAM_REOPEN_DELAY: Duration = Duration::from_secs(1);

// ------------------------------------------------------------
// RPC transport
// ------------------------------------------------------------

/// Base delay between reconnect attempts of an RPC connection.
pub const RPC_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Adds up to 25% random jitter to `base`.
///
/// Keeps many bridges that lost the same game server from
/// reconnecting in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(random_range(0..=spread))
}

/// Builds the WebSocket URL of a game server's RPC endpoint.
pub fn endpoint_url(host: &str, port: u16, tls: bool) -> String {
    let scheme = if tls { "wss" } else { "ws" };
    format!("{scheme}://{host}:{port}")
}
