//! Session tracking
//!
//! `Session` holds one server's current session id together with the
//! cancellation scope of the cohort running against it. `SessionTracker`
//! is the only writer: it polls the server and invalidates the session
//! (cancelling the cohort) whenever a poll fails.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS;
use crate::rpc::{CallOutcome, RpcEndpoint};
use crate::schema::SessionId;
use crate::util::{SESSION_CALL_DEADLINE, SESSION_POLL_INTERVAL, SESSION_RETRY_BACKOFF};

#[derive(Default)]
struct State {
    current: Option<SessionId>,
    /// Session id and scope of the running cohort.
    cohort: Option<(SessionId, CancellationToken)>,
}

/// Current session of one server.
///
/// The id and the running cohort's scope share one lock, so a cohort
/// can never be installed against an id that was invalidated in the
/// meantime.
pub struct Session {
    label: Arc<str>,
    state: Mutex<State>,
}

impl Session {
    pub fn new(label: Arc<str>) -> Self {
        Self { label, state: Mutex::new(State::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<SessionId> {
        self.lock().current
    }

    /// Records a successfully polled id.
    ///
    /// A running cohort bound to a different id is cancelled.
    pub fn update(&self, id: SessionId) {
        let mut state = self.lock();
        if state.current != Some(id) {
            info!("[{}] Session id is now {id}", self.label);
        }
        state.current = Some(id);

        if let Some((cohort_id, scope)) = &state.cohort {
            if *cohort_id != id && !scope.is_cancelled() {
                info!("[{}] Session changed from {cohort_id} to {id}, stopping cohort", self.label);
                scope.cancel();
            }
        }
    }

    /// Forgets the current id and cancels the running cohort, if any.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.current = None;

        if let Some((cohort_id, scope)) = &state.cohort {
            if !scope.is_cancelled() {
                info!("[{}] Session {cohort_id} lost, stopping cohort", self.label);
                scope.cancel();
            }
        }
    }

    /// Opens a cohort scope under `parent` for the current session.
    ///
    /// Returns `None` while there is no valid session.
    pub fn begin_cohort(&self, parent: &CancellationToken) -> Option<(SessionId, CancellationToken)> {
        let mut state = self.lock();
        let id = state.current?;
        let scope = parent.child_token();
        state.cohort = Some((id, scope.clone()));
        Some((id, scope))
    }

    pub fn end_cohort(&self) {
        self.lock().cohort = None;
    }
}

/// Polls the session id of one server until shutdown.
///
/// Polls every `SESSION_POLL_INTERVAL` while the server answers, and
/// every `SESSION_RETRY_BACKOFF` after a failure.
pub struct SessionTracker {
    label: Arc<str>,
    endpoint: Arc<dyn RpcEndpoint>,
    session: Arc<Session>,
}

impl SessionTracker {
    pub fn new(label: Arc<str>, endpoint: Arc<dyn RpcEndpoint>, session: Arc<Session>) -> Self {
        Self { label, endpoint, session }
    }

    /// One poll. Returns whether the server answered.
    pub async fn poll_once(&self) -> bool {
        let label = &self.label;
        debug!("[{label}] Getting session id");

        match CallOutcome::from(self.endpoint.get_session_id(SESSION_CALL_DEADLINE).await) {
            CallOutcome::Success(id) => {
                self.session.update(id);
                true
            }
            CallOutcome::Timeout => {
                METRICS.session_poll_failures.fetch_add(1, Ordering::Relaxed);
                warn!("[{label}] Timed out getting session id");
                self.session.invalidate();
                false
            }
            CallOutcome::Failed(e) => {
                METRICS.session_poll_failures.fetch_add(1, Ordering::Relaxed);
                error!("[{label}] Failed to get session id: {e}");
                self.session.invalidate();
                false
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let delay = tokio::select! {
                _ = shutdown.cancelled() => break,
                answered = self.poll_once() => {
                    if answered { SESSION_POLL_INTERVAL } else { SESSION_RETRY_BACKOFF }
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        debug!("[{}] Session tracker stopped", self.label);
    }
}
