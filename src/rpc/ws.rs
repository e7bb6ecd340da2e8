//! WebSocket transport of the remote interface.
//!
//! One connection per server, reconnected in the background. Unary calls
//! and streams are multiplexed over it by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::{EventStream, RpcEndpoint, RpcError, UnitStream, with_deadline};
use crate::schema::{
    BallisticsCountResponse, Player, PlayersResponse, SessionId, SessionIdResponse,
};
use crate::util::{RPC_RECONNECT_DELAY, jittered};

// ------------------------------------------------------------
// Frames
// ------------------------------------------------------------
//
// Every frame is a JSON text message carrying the id of the call it
// belongs to, which is what lets unary calls and long-lived streams
// share one connection.
//
//   request      {"id": 7, "method": "GetPlayers"}
//   reply        {"id": 7, "result": {...}}
//   failure      {"id": 7, "error": {"code": 4, "message": "..."}}
//   stream end   {"id": 7, "end": true}
//   cancel       {"id": 7, "method": "Cancel"}
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum Method {
    GetSessionId,
    GetBallisticsCount,
    GetPlayers,
    StreamEvents,
    StreamUnits,
    Cancel,
}

#[derive(Debug, Serialize)]
struct Request {
    id: u64,
    method: Method,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
    #[serde(default)]
    end: bool,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: i32,
    message: String,
}

// ------------------------------------------------------------
// Call bookkeeping
// ------------------------------------------------------------

enum Pending {
    Unary(oneshot::Sender<Result<Value, RpcError>>),
    Stream(mpsc::UnboundedSender<Result<Value, RpcError>>),
}

/// State shared between callers and the connection task.
#[derive(Default)]
struct Shared {
    /// Writer queue of the live connection. `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,

    /// In-flight unary calls and open streams, by call id.
    pending: Mutex<HashMap<u64, Pending>>,

    next_id: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn register(&self, pending: Pending) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        guard(&self.pending).insert(id, pending);
        id
    }

    fn forget(&self, id: u64) -> Option<Pending> {
        guard(&self.pending).remove(&id)
    }

    #[cfg(test)]
    fn is_connected(&self) -> bool {
        guard(&self.outbound).is_some()
    }

    fn send(&self, id: u64, method: Method) -> Result<(), RpcError> {
        let frame = serde_json::to_string(&Request { id, method })
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let outbound = guard(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(RpcError::Unavailable);
        };
        tx.send(Message::Text(frame.into())).map_err(|_| RpcError::Unavailable)
    }

    /// Routes one reply frame to the call it belongs to.
    fn dispatch(&self, reply: Reply) {
        let mut pending = guard(&self.pending);
        let Some(entry) = pending.remove(&reply.id) else {
            debug!("Reply for unknown or finished call {}", reply.id);
            return;
        };

        let remote = reply
            .error
            .map(|e| RpcError::Remote { code: e.code, message: e.message });

        match entry {
            Pending::Unary(tx) => {
                let outcome = match (remote, reply.result) {
                    (Some(e), _) => Err(e),
                    (None, Some(value)) => Ok(value),
                    (None, None) => Err(RpcError::Closed),
                };
                let _ = tx.send(outcome);
            }

            // A stream stays registered until it ends, fails, or its
            // consumer goes away.
            Pending::Stream(tx) => {
                if let Some(e) = remote {
                    let _ = tx.send(Err(e));
                    return;
                }
                let delivered = match reply.result {
                    Some(value) => tx.send(Ok(value)).is_ok(),
                    None => true,
                };
                if delivered && !reply.end {
                    pending.insert(reply.id, Pending::Stream(tx));
                }
            }
        }
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
        *guard(&self.outbound) = Some(tx);
    }

    /// Marks the connection down and fails everything in flight.
    fn detach(&self) {
        *guard(&self.outbound) = None;

        let in_flight: Vec<Pending> = guard(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in in_flight {
            match pending {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(RpcError::Closed));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(Err(RpcError::Closed));
                }
            }
        }
    }
}

/// Receiving half of an open stream.
///
/// Dropping it before the server ended the stream unregisters the call
/// and tells the server to stop sending.
struct StreamHandle {
    id: u64,
    shared: Weak<Shared>,
    rx: mpsc::UnboundedReceiver<Result<Value, RpcError>>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.forget(self.id).is_some() {
                let _ = shared.send(self.id, Method::Cancel);
            }
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
}

// ------------------------------------------------------------
// Endpoint
// ------------------------------------------------------------

/// Persistent multiplexed WebSocket connection to one game server.
///
/// Responsibilities:
/// - Keep one connection open, reconnecting with jittered backoff
/// - Match replies to calls by id
/// - Fail every in-flight call when the connection drops
///
/// Calls made while disconnected fail immediately with `Unavailable`
/// rather than queueing, so callers never wait on a dead server longer
/// than their own deadline.
pub struct WsEndpoint {
    shared: Arc<Shared>,
}

impl WsEndpoint {
    /// Starts the background connection task and returns at once.
    ///
    /// The task stops when `shutdown` is cancelled.
    pub fn connect(
        label: impl Into<String>,
        url: String,
        log_frames: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared::default());

        tokio::spawn(connection_loop(label.into(), url, shared.clone(), log_frames, shutdown));

        Self { shared }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    async fn unary<T: DeserializeOwned>(&self, method: Method, deadline: Duration) -> Result<T, RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.register(Pending::Unary(tx));

        if let Err(e) = self.shared.send(id, method) {
            self.shared.forget(id);
            return Err(e);
        }

        let result = with_deadline(deadline, async move { rx.await.unwrap_or(Err(RpcError::Closed)) }).await;
        if result.is_err() {
            self.shared.forget(id);
        }

        decode(result?)
    }

    fn open_stream<T>(&self, method: Method) -> Result<BoxStream<'static, Result<T, RpcError>>, RpcError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.register(Pending::Stream(tx));
        let handle = StreamHandle { id, shared: Arc::downgrade(&self.shared), rx };

        self.shared.send(id, method)?;

        Ok(stream::unfold(handle, |mut handle| async move {
            let item = handle.rx.recv().await?;
            Some((item.and_then(decode::<T>), handle))
        })
        .boxed())
    }
}

#[async_trait::async_trait]
impl RpcEndpoint for WsEndpoint {
    async fn get_session_id(&self, deadline: Duration) -> Result<SessionId, RpcError> {
        self.unary::<SessionIdResponse>(Method::GetSessionId, deadline)
            .await
            .map(|r| r.session_id)
    }

    async fn get_ballistics_count(&self, deadline: Duration) -> Result<u32, RpcError> {
        self.unary::<BallisticsCountResponse>(Method::GetBallisticsCount, deadline)
            .await
            .map(|r| r.count)
    }

    async fn get_players(&self, deadline: Duration) -> Result<Vec<Player>, RpcError> {
        self.unary::<PlayersResponse>(Method::GetPlayers, deadline)
            .await
            .map(|r| r.players)
    }

    async fn stream_events(&self) -> Result<EventStream, RpcError> {
        self.open_stream(Method::StreamEvents)
    }

    async fn stream_units(&self) -> Result<UnitStream, RpcError> {
        self.open_stream(Method::StreamUnits)
    }
}

/// Keeps the connection alive until shutdown.
///
/// GUARANTEES:
/// - Never fails; every error ends in a reconnect after a delay
/// - Nothing stays pending across a reconnect
async fn connection_loop(
    label: String,
    url: String,
    shared: Arc<Shared>,
    log_frames: bool,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = run_connection(&label, &url, &shared, log_frames) => {
                if let Err(e) = result {
                    warn!("[{label}] RPC connection to {url} lost: {e}");
                }
            }
        }

        shared.detach();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(jittered(RPC_RECONNECT_DELAY)) => {}
        }
    }

    shared.detach();
    debug!("[{label}] RPC connection loop stopped");
}

/// Drives a single connection until it fails.
async fn run_connection(label: &str, url: &str, shared: &Shared, log_frames: bool) -> Result<()> {
    let (ws, _) = connect_async(url).await?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared.attach(tx);
    info!("[{label}] RPC connected to {url}");

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if log_frames {
                    debug!("[{label}] RPC SEND {msg}");
                }
                write.send(msg).await?;
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if log_frames {
                        debug!("[{label}] RPC RECV {}", text.as_str());
                    }
                    match serde_json::from_str::<Reply>(text.as_str()) {
                        Ok(reply) => shared.dispatch(reply),
                        Err(e) => warn!("[{label}] Unreadable RPC frame: {e}"),
                    }
                }

                Some(Ok(Message::Close(_))) | None => {
                    return Err(anyhow!("connection closed by server"));
                }

                // Ping/pong/binary frames carry nothing for us
                Some(Ok(_)) => {}

                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}
