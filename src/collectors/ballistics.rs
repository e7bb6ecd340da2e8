//! Ballistics collector

use std::sync::Arc;

use futures_util::FutureExt;
use log::info;

use super::collector::{Collector, CollectorConfig, CollectorKind, settle, tag};
use crate::metrics::{GaugeCallback, Measurement, MetricDesc, MetricsSink};
use crate::rpc::CallOutcome;
use crate::util::COLLECTOR_CALL_DEADLINE;

pub static BALLISTICS_GAUGE: MetricDesc = MetricDesc::new(
    "ballistics",
    "Ballistic objects in flight",
    &[tag::SERVER_SHORT_NAME, tag::SESSION_ID],
);

/// Reports how many ballistic objects are in flight, sampled on every
/// export tick.
pub struct BallisticsCollector {
    config: Arc<CollectorConfig>,
    sink: Arc<dyn MetricsSink>,
}

impl BallisticsCollector {
    pub fn new(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink }
    }

    pub fn boxed(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Box<dyn Collector> {
        Box::new(Self::new(config, sink))
    }

    fn gauge(&self) -> GaugeCallback {
        let config = self.config.clone();
        let tags = config.base_tags();
        Arc::new(move || {
            let config = config.clone();
            let tags = tags.clone();
            async move {
                let outcome =
                    CallOutcome::from(config.endpoint.get_ballistics_count(COLLECTOR_CALL_DEADLINE).await);
                settle(&config.server_short_name, "GetBallisticsCount", outcome)
                    .map(|count| vec![Measurement::new(f64::from(count), tags)])
                    .unwrap_or_default()
            }
            .boxed()
        })
    }
}

#[async_trait::async_trait]
impl Collector for BallisticsCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Ballistics
    }

    async fn run(self: Box<Self>) {
        let _gauge = self.sink.register_gauge(&BALLISTICS_GAUGE, self.gauge());
        info!(
            "[{}] Ballistics collector started for session {}",
            self.config.server_short_name, self.config.session_id
        );

        self.config.scope.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::test_support::alpha_config;
    use crate::metrics::Registry;
    use crate::rpc::RpcError;
    use crate::rpc::mock::{MockEndpoint, Reply};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn started(endpoint: Arc<MockEndpoint>) -> (Registry, CancellationToken, tokio::task::JoinHandle<()>) {
        let registry = Registry::new();
        let scope = CancellationToken::new();
        let collector = BallisticsCollector::boxed(
            alpha_config(endpoint, scope.clone()),
            Arc::new(registry.clone()),
        );
        let task = tokio::spawn(collector.run());
        while registry.gauge_count() == 0 {
            tokio::task::yield_now().await;
        }
        (registry, scope, task)
    }

    #[tokio::test(start_paused = true)]
    async fn reports_count_with_cohort_tags() {
        let endpoint = MockEndpoint::new();
        endpoint.set_ballistics(Reply::Value(12));
        let (registry, scope, task) = started(endpoint.clone()).await;

        let snapshot = registry.collect().await;
        let values = snapshot.gauge(BALLISTICS_GAUGE.name);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, 12.0);
        assert!(values[0].matches(&[("server_short_name", "Alpha"), ("session_id", "100")]));
        assert_eq!(endpoint.calls("GetBallisticsCount"), 1);

        scope.cancel();
        task.await.unwrap();
        assert_eq!(registry.gauge_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_tick_reports_nothing_and_the_next_recovers() {
        let endpoint = MockEndpoint::new();
        let (registry, scope, task) = started(endpoint.clone()).await;

        let started_at = tokio::time::Instant::now();
        let snapshot = registry.collect().await;
        assert!(snapshot.gauge(BALLISTICS_GAUGE.name).is_empty());
        assert!(started_at.elapsed() >= COLLECTOR_CALL_DEADLINE);
        assert!(started_at.elapsed() < COLLECTOR_CALL_DEADLINE + Duration::from_millis(100));
        assert!(!task.is_finished());

        endpoint.set_ballistics(Reply::Value(3));
        assert_eq!(registry.collect().await.gauge(BALLISTICS_GAUGE.name)[0].value, 3.0);

        scope.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_reports_nothing() {
        let endpoint = MockEndpoint::new();
        endpoint.set_ballistics(Reply::Fail(RpcError::Unavailable));
        let (registry, scope, task) = started(endpoint).await;

        assert!(registry.collect().await.gauge(BALLISTICS_GAUGE.name).is_empty());
        assert!(!task.is_finished());

        scope.cancel();
        task.await.unwrap();
    }
}
