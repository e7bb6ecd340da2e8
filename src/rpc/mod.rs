//! Remote procedure interface of a game server.
//!
//! The rest of the crate talks to game servers exclusively through the
//! `RpcEndpoint` trait. `ws` holds the production transport, `mock` a
//! scripted endpoint for tests.

pub mod ws;

#[cfg(test)]
pub mod mock;

use std::future::Future;
use std::time::Duration;

use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::schema::{EventKind, Player, SessionId, UnitUpdate};

/// Failure of a single RPC call or stream read.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// No connection to the game server right now.
    #[error("endpoint unavailable")]
    Unavailable,

    /// The connection dropped while the call was in flight.
    #[error("connection closed")]
    Closed,

    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// The payload did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result of a unary call, with timeouts split out as their own case.
///
/// Collectors branch on this instead of matching error variants, so
/// the skip-this-tick policy for timeouts stays a plain match arm.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Success(T),
    Timeout,
    Failed(RpcError),
}

impl<T> From<Result<T, RpcError>> for CallOutcome<T> {
    fn from(result: Result<T, RpcError>) -> Self {
        match result {
            Ok(value) => CallOutcome::Success(value),
            Err(RpcError::DeadlineExceeded) => CallOutcome::Timeout,
            Err(e) => CallOutcome::Failed(e),
        }
    }
}

pub type EventStream = BoxStream<'static, Result<EventKind, RpcError>>;
pub type UnitStream = BoxStream<'static, Result<UnitUpdate, RpcError>>;

/// Call/response contract of one game server.
///
/// CONTRACT:
/// - Unary calls must give up with `DeadlineExceeded` once `deadline`
///   has elapsed.
/// - Streams are long-lived and have no deadline. A `Decode` item means
///   one message was unreadable; the stream itself is still usable.
///   Any other error item, or the end of the stream, means it is gone.
#[async_trait::async_trait]
pub trait RpcEndpoint: Send + Sync {
    async fn get_session_id(&self, deadline: Duration) -> Result<SessionId, RpcError>;

    async fn get_ballistics_count(&self, deadline: Duration) -> Result<u32, RpcError>;

    async fn get_players(&self, deadline: Duration) -> Result<Vec<Player>, RpcError>;

    async fn stream_events(&self) -> Result<EventStream, RpcError>;

    async fn stream_units(&self) -> Result<UnitStream, RpcError>;
}

/// Runs `call`, failing with `DeadlineExceeded` once `deadline` elapses.
pub async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = Result<T, RpcError>>,
) -> Result<T, RpcError> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::DeadlineExceeded),
    }
}
