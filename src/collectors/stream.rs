use std::future::Future;
use std::sync::atomic::Ordering;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS;
use crate::rpc::RpcError;
use crate::util::STREAM_REOPEN_DELAY;

/// Why one pass over a server stream ended.
#[derive(Debug)]
pub enum StreamEnd {
    OpenFailed(RpcError),
    Failed(RpcError),
    /// The server ended the stream.
    Closed,
}

/// Keeps a server stream open for the lifetime of `scope`.
///
/// Each pass calls `follow`, which opens the stream and reads it until
/// it ends. Whatever the reason, the stream is reopened after
/// `STREAM_REOPEN_DELAY` unless the scope was cancelled in the meantime.
///
/// GUARANTEES:
/// - Returns promptly once `scope` is cancelled, even mid-read
/// - Never returns while `scope` is live
pub async fn run_stream_loop<F, Fut>(label: &str, stream: &str, scope: &CancellationToken, mut follow: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StreamEnd>,
{
    loop {
        let end = tokio::select! {
            _ = scope.cancelled() => break,
            end = follow() => end,
        };

        if scope.is_cancelled() {
            break;
        }

        match end {
            StreamEnd::OpenFailed(e) => error!("[{label}] Failed to open {stream} stream: {e}"),
            StreamEnd::Failed(e) => error!("[{label}] {stream} stream failed: {e}"),
            StreamEnd::Closed => error!("[{label}] {stream} stream closed by server"),
        }

        tokio::select! {
            _ = scope.cancelled() => break,
            _ = sleep(STREAM_REOPEN_DELAY) => {}
        }

        METRICS.stream_reopens.fetch_add(1, Ordering::Relaxed);
        debug!("[{label}] Reopening {stream} stream");
    }

    debug!("[{label}] {stream} stream stopped");
}

/// Reads `messages` until it fails or ends, handing every decoded item
/// to `handle`.
///
/// A `Decode` item is logged and skipped; one unreadable message never
/// ends the stream.
pub async fn consume<T>(
    label: &str,
    stream: &str,
    mut messages: BoxStream<'static, Result<T, RpcError>>,
    mut handle: impl FnMut(T),
) -> StreamEnd {
    while let Some(item) = messages.next().await {
        match item {
            Ok(message) => handle(message),
            Err(RpcError::Decode(e)) => {
                METRICS.malformed_messages.fetch_add(1, Ordering::Relaxed);
                warn!("[{label}] Skipping unreadable {stream} message: {e}");
            }
            Err(e) => return StreamEnd::Failed(e),
        }
    }

    StreamEnd::Closed
}
