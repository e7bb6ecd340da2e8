//! Scripted in-memory endpoint used by the collector and orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::mpsc;

use super::{EventStream, RpcEndpoint, RpcError, UnitStream, with_deadline};
use crate::schema::{EventKind, Player, SessionId, UnitUpdate};

/// Canned behaviour of a unary call.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Value(T),
    /// Never answers; the caller's deadline fires.
    Hang,
    Fail(RpcError),
}

impl<T: Clone> Reply<T> {
    async fn play(&self, deadline: Duration) -> Result<T, RpcError> {
        let reply = self.clone();
        with_deadline(deadline, async move {
            match reply {
                Reply::Value(value) => Ok(value),
                Reply::Hang => std::future::pending().await,
                Reply::Fail(e) => Err(e),
            }
        })
        .await
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

pub type EventFeed = mpsc::UnboundedSender<Result<EventKind, RpcError>>;
pub type UnitFeed = mpsc::UnboundedSender<Result<UnitUpdate, RpcError>>;

/// What the next attempt to open a stream gets.
enum Opening<T> {
    Feed(mpsc::UnboundedReceiver<Result<T, RpcError>>),
    Refuse(RpcError),
}

fn open<T: Send + 'static>(
    queue: &Mutex<VecDeque<Opening<T>>>,
) -> Result<BoxStream<'static, Result<T, RpcError>>, RpcError> {
    match queue.lock().unwrap().pop_front() {
        Some(Opening::Feed(rx)) => Ok(receiver_stream(rx)),
        Some(Opening::Refuse(e)) => Err(e),
        None => Ok(stream::pending().boxed()),
    }
}

/// Endpoint whose replies are set by the test.
///
/// Stream openings are served in the order they were queued with
/// `queue_*_stream` (a live feed) or `refuse_*_stream` (an open error).
/// Opening a stream when nothing is queued yields one that never
/// produces anything.
pub struct MockEndpoint {
    session: Mutex<Reply<SessionId>>,
    ballistics: Mutex<Reply<u32>>,
    players: Mutex<Reply<Vec<Player>>>,
    event_streams: Mutex<VecDeque<Opening<EventKind>>>,
    unit_streams: Mutex<VecDeque<Opening<UnitUpdate>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MockEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Reply::Hang),
            ballistics: Mutex::new(Reply::Hang),
            players: Mutex::new(Reply::Hang),
            event_streams: Mutex::new(VecDeque::new()),
            unit_streams: Mutex::new(VecDeque::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_session(&self, reply: Reply<SessionId>) {
        *self.session.lock().unwrap() = reply;
    }

    pub fn set_ballistics(&self, reply: Reply<u32>) {
        *self.ballistics.lock().unwrap() = reply;
    }

    pub fn set_players(&self, reply: Reply<Vec<Player>>) {
        *self.players.lock().unwrap() = reply;
    }

    pub fn queue_event_stream(&self) -> EventFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_streams.lock().unwrap().push_back(Opening::Feed(rx));
        tx
    }

    pub fn refuse_event_stream(&self, error: RpcError) {
        self.event_streams.lock().unwrap().push_back(Opening::Refuse(error));
    }

    pub fn queue_unit_stream(&self) -> UnitFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.unit_streams.lock().unwrap().push_back(Opening::Feed(rx));
        tx
    }

    pub fn refuse_unit_stream(&self, error: RpcError) {
        self.unit_streams.lock().unwrap().push_back(Opening::Refuse(error));
    }

    /// Number of times `method` was called.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    fn record(&self, method: &'static str) {
        *self.calls.lock().unwrap().entry(method).or_insert(0) += 1;
    }
}

#[async_trait::async_trait]
impl RpcEndpoint for MockEndpoint {
    async fn get_session_id(&self, deadline: Duration) -> Result<SessionId, RpcError> {
        self.record("GetSessionId");
        let reply = self.session.lock().unwrap().clone();
        reply.play(deadline).await
    }

    async fn get_ballistics_count(&self, deadline: Duration) -> Result<u32, RpcError> {
        self.record("GetBallisticsCount");
        let reply = self.ballistics.lock().unwrap().clone();
        reply.play(deadline).await
    }

    async fn get_players(&self, deadline: Duration) -> Result<Vec<Player>, RpcError> {
        self.record("GetPlayers");
        let reply = self.players.lock().unwrap().clone();
        reply.play(deadline).await
    }

    async fn stream_events(&self) -> Result<EventStream, RpcError> {
        self.record("StreamEvents");
        open(&self.event_streams)
    }

    async fn stream_units(&self) -> Result<UnitStream, RpcError> {
        self.record("StreamUnits");
        open(&self.unit_streams)
    }
}
