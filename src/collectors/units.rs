//! Unit collector
//!
//! Mirrors the set of live units of one server from the unit stream and
//! exports a count per group category.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use log::{debug, info};

use super::collector::{Collector, CollectorConfig, CollectorKind, tag};
use super::stream::{StreamEnd, consume, run_stream_loop};
use crate::metrics::{GaugeCallback, METRICS, Measurement, MetricDesc, MetricsSink};
use crate::schema::{GroupCategory, UnitUpdate};

pub static UNITS_GAUGE: MetricDesc = MetricDesc::new(
    "units_per_server_gauge",
    "Live units per group category",
    &[tag::SERVER_SHORT_NAME, tag::SESSION_ID, tag::CATEGORY],
);

/// Units currently alive on one server, keyed by id.
///
/// THREAD SAFETY:
/// - Written by the stream loop, read by the export callback
/// - Every access goes through the mutex; the lock is never held
///   across an await
#[derive(Debug, Default)]
pub struct LiveUnits {
    units: Mutex<HashMap<u32, GroupCategory>>,
}

impl LiveUnits {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, GroupCategory>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn apply(&self, update: &UnitUpdate) {
        match update {
            UnitUpdate::Appeared(unit) => {
                self.lock().insert(unit.id, unit.category);
            }
            UnitUpdate::Gone { id } => {
                self.lock().remove(id);
            }
            UnitUpdate::Unknown => {}
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Live count for every category, zeros included.
    pub fn counts(&self) -> [(GroupCategory, usize); 5] {
        let units = self.lock();
        GroupCategory::ALL.map(|category| {
            (category, units.values().filter(|c| **c == category).count())
        })
    }
}

pub struct UnitCollector {
    config: Arc<CollectorConfig>,
    sink: Arc<dyn MetricsSink>,
    live: Arc<LiveUnits>,
}

impl UnitCollector {
    pub fn new(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink, live: Arc::new(LiveUnits::default()) }
    }

    pub fn boxed(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Box<dyn Collector> {
        Box::new(Self::new(config, sink))
    }

    fn units_gauge(&self) -> GaugeCallback {
        let live = self.live.clone();
        let base = self.config.base_tags();
        Arc::new(move || {
            let measurements: Vec<Measurement> = live
                .counts()
                .into_iter()
                .map(|(category, count)| {
                    Measurement::new(count as f64, base.clone().with(tag::CATEGORY, category))
                })
                .collect();
            async move { measurements }.boxed()
        })
    }

    async fn follow(&self) -> StreamEnd {
        let updates = match self.config.endpoint.stream_units().await {
            Ok(updates) => updates,
            Err(e) => return StreamEnd::OpenFailed(e),
        };

        // Gone events may have been missed while disconnected. The
        // server re-announces every live unit on a new stream.
        self.live.clear();
        debug!("[{}] Unit stream open", self.config.server_short_name);

        consume(&self.config.server_short_name, "unit", updates, |update| {
            METRICS.unit_updates.fetch_add(1, Ordering::Relaxed);
            self.live.apply(&update);
        })
        .await
    }

    /// One pass, with every category reporting 0 while no stream is read.
    async fn follow_and_reset(&self) -> StreamEnd {
        let end = self.follow().await;
        self.live.clear();
        end
    }
}

#[async_trait::async_trait]
impl Collector for UnitCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Units
    }

    async fn run(self: Box<Self>) {
        let _gauge = self.sink.register_gauge(&UNITS_GAUGE, self.units_gauge());
        info!(
            "[{}] Unit collector started for session {}",
            self.config.server_short_name, self.config.session_id
        );

        run_stream_loop(&self.config.server_short_name, "unit", &self.config.scope, || {
            self.follow_and_reset()
        })
        .await;
    }
}
