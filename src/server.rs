//! Per-server orchestration
//!
//! `ServerMonitor` is the top-level task of one game server. It runs the
//! session tracker alongside a loop that waits for a valid session,
//! starts one cohort of every collector bound to it, and waits for the
//! cohort to drain before starting the next.
//!
//! DESIGN:
//! - At most one cohort per server at any time
//! - A new cohort starts only after every collector of the previous
//!   one has exited
//! - Servers share nothing but the metrics sink

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::collectors::{self, CollectorConfig, CollectorKind, FactoryError};
use crate::metrics::{METRICS, MetricsSink};
use crate::rpc::RpcEndpoint;
use crate::schema::SessionId;
use crate::session::{Session, SessionTracker};
use crate::util::{SESSION_AWAIT_INTERVAL, SHUTDOWN_GRACE};

/// Lifecycle of one server, observable through `ServerMonitor::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingSession,
    RunningCohort { session_id: SessionId },
    Stopped,
}

pub struct ServerMonitor {
    label: Arc<str>,
    endpoint: Arc<dyn RpcEndpoint>,
    sink: Arc<dyn MetricsSink>,
    session: Arc<Session>,
    state: watch::Sender<ServerState>,
}

impl ServerMonitor {
    pub fn new(short_name: &str, endpoint: Arc<dyn RpcEndpoint>, sink: Arc<dyn MetricsSink>) -> Self {
        let label: Arc<str> = Arc::from(short_name);
        let (state, _) = watch::channel(ServerState::AwaitingSession);
        Self {
            session: Arc::new(Session::new(label.clone())),
            label,
            endpoint,
            sink,
            state,
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Runs until `shutdown` fires.
    ///
    /// The only error is a collector variant missing from the factory
    /// registry, which the caller treats as fatal.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), FactoryError> {
        METRICS.servers_active.fetch_add(1, Ordering::Relaxed);
        info!("[{}] Monitoring server", self.label);

        let tracker = SessionTracker::new(self.label.clone(), self.endpoint.clone(), self.session.clone());
        let mut tracker_task = tokio::spawn(tracker.run(shutdown.clone()));

        let result = self.orchestrate(&shutdown).await;

        if shutdown.is_cancelled() {
            if timeout(SHUTDOWN_GRACE, &mut tracker_task).await.is_err() {
                warn!("[{}] Session tracker did not stop in time", self.label);
                tracker_task.abort();
            }
        } else {
            tracker_task.abort();
        }

        self.state.send_replace(ServerState::Stopped);
        METRICS.servers_active.fetch_sub(1, Ordering::Relaxed);
        info!("[{}] Stopped monitoring server", self.label);

        result
    }

    async fn orchestrate(&self, shutdown: &CancellationToken) -> Result<(), FactoryError> {
        while let Some((session_id, scope)) = self.await_session(shutdown).await {
            self.run_cohort(session_id, scope, shutdown).await?;
        }
        Ok(())
    }

    /// Waits for a valid session and opens a cohort scope for it.
    ///
    /// Returns `None` on shutdown.
    async fn await_session(&self, shutdown: &CancellationToken) -> Option<(SessionId, CancellationToken)> {
        self.state.send_replace(ServerState::AwaitingSession);

        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(cohort) = self.session.begin_cohort(shutdown) {
                return Some(cohort);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = sleep(SESSION_AWAIT_INTERVAL) => {}
            }
        }
    }

    async fn run_cohort(
        &self,
        session_id: SessionId,
        scope: CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<(), FactoryError> {
        let label = &self.label;
        let config = Arc::new(CollectorConfig {
            server_short_name: label.clone(),
            session_id,
            endpoint: self.endpoint.clone(),
            scope: scope.clone(),
        });

        let built: Result<Vec<_>, FactoryError> = CollectorKind::ALL
            .into_iter()
            .map(|kind| collectors::create(kind, config.clone(), self.sink.clone()))
            .collect();
        let cohort_collectors = match built {
            Ok(built) => built,
            Err(e) => {
                error!("[{label}] Cannot build cohort: {e}");
                scope.cancel();
                self.session.end_cohort();
                return Err(e);
            }
        };

        info!("[{label}] Starting cohort for session {session_id}");
        self.state.send_replace(ServerState::RunningCohort { session_id });
        METRICS.cohorts_started.fetch_add(1, Ordering::Relaxed);
        METRICS.cohorts_active.fetch_add(1, Ordering::Relaxed);

        let mut cohort = JoinSet::new();
        for collector in cohort_collectors {
            let kind = collector.kind();
            cohort.spawn(async move {
                collector.run().await;
                kind
            });
        }

        self.drain(&mut cohort, shutdown).await;

        scope.cancel();
        self.session.end_cohort();
        METRICS.cohorts_active.fetch_sub(1, Ordering::Relaxed);
        info!("[{label}] Cohort for session {session_id} ended");

        Ok(())
    }

    /// Waits until every collector of `cohort` has exited.
    ///
    /// Once shutdown fires the remaining collectors get `SHUTDOWN_GRACE`
    /// to finish before they are aborted.
    async fn drain(&self, cohort: &mut JoinSet<CollectorKind>, shutdown: &CancellationToken) {
        tokio::select! {
            _ = join_all(&self.label, cohort) => return,
            _ = shutdown.cancelled() => {}
        }

        if timeout(SHUTDOWN_GRACE, join_all(&self.label, cohort)).await.is_err() {
            warn!(
                "[{}] {} collector(s) still running after shutdown grace, aborting",
                self.label,
                cohort.len()
            );
            cohort.abort_all();
        }
    }
}

async fn join_all(label: &str, cohort: &mut JoinSet<CollectorKind>) {
    while let Some(joined) = cohort.join_next().await {
        match joined {
            Ok(kind) => debug!("[{label}] {kind} collector exited"),
            Err(e) => error!("[{label}] Collector task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep_until;

    use crate::collectors::ballistics::BALLISTICS_GAUGE;
    use crate::metrics::{GaugeCallback, GaugeRegistration, MetricDesc, Registry, TagSet};
    use crate::rpc::mock::{MockEndpoint, Reply};
    use crate::util::{SESSION_CALL_DEADLINE, SESSION_POLL_INTERVAL, SESSION_RETRY_BACKOFF};

    /// Registry that also logs gauge registration and release order.
    #[derive(Clone, Default)]
    struct RecordingSink {
        registry: Registry,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl MetricsSink for RecordingSink {
        fn add_counter(&self, desc: &'static MetricDesc, value: u64, tags: &TagSet) {
            self.registry.add_counter(desc, value, tags);
        }

        fn record_histogram(&self, desc: &'static MetricDesc, value: f64, tags: &TagSet) {
            self.registry.record_histogram(desc, value, tags);
        }

        fn register_gauge(&self, desc: &'static MetricDesc, callback: GaugeCallback) -> GaugeRegistration {
            let name = desc.name;
            self.log.lock().unwrap().push(format!("register {name}"));
            let inner = self.registry.register_gauge(desc, callback);
            let log = self.log.clone();
            GaugeRegistration::new(move || {
                drop(inner);
                log.lock().unwrap().push(format!("release {name}"));
            })
        }
    }

    /// Every collector variant registers exactly one gauge.
    const GAUGES_PER_COHORT: usize = 4;

    fn monitor(endpoint: &Arc<MockEndpoint>, sink: &RecordingSink) -> ServerMonitor {
        ServerMonitor::new("Alpha", endpoint.clone(), Arc::new(sink.clone()))
    }

    async fn reach(rx: &mut watch::Receiver<ServerState>, wanted: ServerState) {
        timeout(Duration::from_secs(120), rx.wait_for(|state| *state == wanted))
            .await
            .expect("state not reached in time")
            .expect("monitor dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_poll_timeouts_stop_the_cohort() {
        let endpoint = MockEndpoint::new();
        endpoint.set_session(Reply::Value(100));
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let monitor = monitor(&endpoint, &sink);
        let session = monitor.session.clone();
        let mut state = monitor.subscribe();
        let started_at = tokio::time::Instant::now();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        reach(&mut state, ServerState::RunningCohort { session_id: 100 }).await;
        while sink.registry.gauge_count() < GAUGES_PER_COHORT {
            tokio::task::yield_now().await;
        }

        // Polls at 10s, 16s and 22s, each timing out after 5s.
        endpoint.set_session(Reply::Hang);
        let third_timeout = SESSION_POLL_INTERVAL
            + (SESSION_CALL_DEADLINE + SESSION_RETRY_BACKOFF) * 2
            + SESSION_CALL_DEADLINE;
        sleep_until(started_at + third_timeout + Duration::from_millis(100)).await;

        assert_eq!(endpoint.calls("GetSessionId"), 4);
        assert_eq!(session.current(), None);
        assert_eq!(*state.borrow(), ServerState::AwaitingSession);
        assert_eq!(sink.registry.gauge_count(), 0);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ServerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn session_change_drains_old_cohort_before_starting_new_one() {
        let endpoint = MockEndpoint::new();
        endpoint.set_session(Reply::Value(100));
        endpoint.set_ballistics(Reply::Value(4));
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let monitor = monitor(&endpoint, &sink);
        let mut state = monitor.subscribe();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        reach(&mut state, ServerState::RunningCohort { session_id: 100 }).await;
        endpoint.set_session(Reply::Value(200));
        reach(&mut state, ServerState::RunningCohort { session_id: 200 }).await;
        while sink.registry.gauge_count() < GAUGES_PER_COHORT {
            tokio::task::yield_now().await;
        }

        // Every gauge of cohort 100 is released before cohort 200 registers any.
        let log = sink.log.lock().unwrap().clone();
        let n = GAUGES_PER_COHORT;
        assert_eq!(log.len(), n * 3, "{log:?}");
        assert!(log[..n].iter().all(|l| l.starts_with("register")), "{log:?}");
        assert!(log[n..n * 2].iter().all(|l| l.starts_with("release")), "{log:?}");
        assert!(log[n * 2..].iter().all(|l| l.starts_with("register")), "{log:?}");

        let snapshot = sink.registry.collect().await;
        let ballistics = snapshot.gauge(BALLISTICS_GAUGE.name);
        assert_eq!(ballistics.len(), 1);
        assert!(ballistics[0].matches(&[("session_id", "200")]));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_cohort_and_tracker() {
        let endpoint = MockEndpoint::new();
        endpoint.set_session(Reply::Value(100));
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let monitor = monitor(&endpoint, &sink);
        let mut state = monitor.subscribe();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        reach(&mut state, ServerState::RunningCohort { session_id: 100 }).await;
        shutdown.cancel();

        timeout(SHUTDOWN_GRACE, task).await.unwrap().unwrap().unwrap();
        assert_eq!(*state.borrow(), ServerState::Stopped);
        assert_eq!(sink.registry.gauge_count(), 0);

        let polls = endpoint.calls("GetSessionId");
        sleep(SESSION_POLL_INTERVAL * 3).await;
        assert_eq!(endpoint.calls("GetSessionId"), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn no_cohort_without_a_session() {
        let endpoint = MockEndpoint::new();
        endpoint.set_session(Reply::Fail(crate::rpc::RpcError::Unavailable));
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let monitor = monitor(&endpoint, &sink);
        let state = monitor.subscribe();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(*state.borrow(), ServerState::AwaitingSession);
        assert!(sink.log.lock().unwrap().is_empty());
        assert!(endpoint.calls("GetSessionId") > 10);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_collector_is_aborted_after_grace() {
        let endpoint = MockEndpoint::new();
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();
        let monitor = monitor(&endpoint, &sink);

        let mut cohort = JoinSet::new();
        cohort.spawn(async {
            std::future::pending::<()>().await;
            CollectorKind::Units
        });
        cohort.spawn(async { CollectorKind::Ballistics });

        shutdown.cancel();
        let started_at = tokio::time::Instant::now();
        monitor.drain(&mut cohort, &shutdown).await;

        assert!(started_at.elapsed() >= SHUTDOWN_GRACE);
        assert!(cohort.is_empty() || cohort.join_next().await.unwrap().unwrap_err().is_cancelled());
    }
}
