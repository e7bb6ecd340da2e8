//! Metrics
//!
//! The `MetricsSink` contract every collector writes to, the
//! Prometheus-backed `Registry` implementing it, and the runtime
//! counters of the bridge itself.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, join_all};
use log::error;
use once_cell::sync::Lazy;
use prometheus::core::Collector as PrometheusCollector;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};
use thiserror::Error;

use crate::schema::{AirbaseCategory, Coalition, GroupCategory};

// ------------------------------------------------------------
// Tags
// ------------------------------------------------------------

/// Value half of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Str(s) => f.write_str(s),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<Coalition> for TagValue {
    fn from(value: Coalition) -> Self {
        TagValue::Str(value.as_str().to_string())
    }
}

impl From<GroupCategory> for TagValue {
    fn from(value: GroupCategory) -> Self {
        TagValue::Str(value.as_str().to_string())
    }
}

impl From<AirbaseCategory> for TagValue {
    fn from(value: AirbaseCategory) -> Self {
        TagValue::Str(value.as_str().to_string())
    }
}

/// Ordered set of tags attached to a measurement.
///
/// Setting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet(Vec<(&'static str, TagValue)>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &'static str, value: impl Into<TagValue>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl Into<TagValue>) -> Self {
        self.push(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(k, _)| *k)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when every `(key, value)` pair of `filter` is present.
    #[cfg(test)]
    pub fn matches(&self, filter: &[(&str, &str)]) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.get(key).is_some_and(|v| v.to_string() == *value))
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// A single tagged data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub tags: TagSet,
}

impl Measurement {
    pub fn new(value: f64, tags: TagSet) -> Self {
        Self { value, tags }
    }
}

// ------------------------------------------------------------
// Metric families
// ------------------------------------------------------------

/// Name, help text and label keys of one metric family.
///
/// Every tag set recorded under a family may only use keys listed in
/// `labels`. Labels a measurement does not carry are exported empty.
#[derive(Debug, PartialEq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    /// Histogram bucket bounds. Empty means the Prometheus defaults.
    pub buckets: &'static [f64],
}

impl MetricDesc {
    pub const fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self { name, help, labels, buckets: &[] }
    }

    pub const fn with_buckets(self, buckets: &'static [f64]) -> Self {
        Self { name: self.name, help: self.help, labels: self.labels, buckets }
    }

    /// Label values of `tags` in declaration order.
    fn label_values(&self, tags: &TagSet) -> Result<Vec<String>, SinkError> {
        if let Some(key) = tags.keys().find(|key| !self.labels.contains(key)) {
            return Err(SinkError::UndeclaredLabel { metric: self.name, key });
        }

        Ok(self
            .labels
            .iter()
            .map(|label| tags.get(label).map(ToString::to_string).unwrap_or_default())
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("tag '{key}' is not a declared label of {metric}")]
    UndeclaredLabel { metric: &'static str, key: &'static str },

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

// ------------------------------------------------------------
// Sink contract
// ------------------------------------------------------------

pub type GaugeFuture = BoxFuture<'static, Vec<Measurement>>;

/// Invoked once per export tick. May perform I/O.
pub type GaugeCallback = Arc<dyn Fn() -> GaugeFuture + Send + Sync>;

/// Destination of every measurement the collectors produce.
///
/// Counters and histograms are pushed inline. Gauges are pulled: the
/// sink keeps the callback and invokes it whenever it exports.
///
/// THREAD SAFETY:
/// - Shared by every collector of every server.
pub trait MetricsSink: Send + Sync {
    fn add_counter(&self, desc: &'static MetricDesc, value: u64, tags: &TagSet);

    fn record_histogram(&self, desc: &'static MetricDesc, value: f64, tags: &TagSet);

    /// Registers an observable gauge.
    ///
    /// The gauge stays registered until the returned guard is dropped.
    fn register_gauge(&self, desc: &'static MetricDesc, callback: GaugeCallback) -> GaugeRegistration;
}

/// Keeps a gauge registered. Dropping it unregisters the gauge.
#[must_use = "the gauge is unregistered as soon as the registration is dropped"]
pub struct GaugeRegistration {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl GaugeRegistration {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }
}

impl Drop for GaugeRegistration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ------------------------------------------------------------
// Prometheus registry
// ------------------------------------------------------------

/// Metric vectors created so far, by family name.
#[derive(Default)]
struct Families {
    counters: HashMap<&'static str, IntCounterVec>,
    histograms: HashMap<&'static str, HistogramVec>,
    gauges: HashMap<&'static str, GaugeVec>,
}

struct RegistryInner {
    prometheus: prometheus::Registry,
    families: Mutex<Families>,
    callbacks: Mutex<BTreeMap<u64, (&'static MetricDesc, GaugeCallback)>>,
    next_gauge_id: AtomicU64,
}

/// `MetricsSink` backed by a Prometheus registry.
///
/// Families are created and registered the first time something is
/// recorded under them. Gauge vectors are rebuilt from the callbacks on
/// every `collect`, so a released gauge disappears from the next export.
///
/// Counter and histogram series of finished sessions are kept for the
/// life of the process; the final increments of a cohort would
/// otherwise never reach an export.
///
/// Cheap to clone; clones share the same series.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Looks up the vector of `desc`, creating and registering it on first use.
fn family<V>(
    prometheus: &prometheus::Registry,
    known: &mut HashMap<&'static str, V>,
    desc: &MetricDesc,
    build: impl FnOnce() -> prometheus::Result<V>,
) -> prometheus::Result<V>
where
    V: PrometheusCollector + Clone + 'static,
{
    if let Some(existing) = known.get(desc.name) {
        return Ok(existing.clone());
    }

    let created = build()?;
    prometheus.register(Box::new(created.clone()))?;
    known.insert(desc.name, created.clone());
    Ok(created)
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                prometheus: prometheus::Registry::new(),
                families: Mutex::new(Families::default()),
                callbacks: Mutex::new(BTreeMap::new()),
                next_gauge_id: AtomicU64::new(0),
            }),
        }
    }

    #[cfg(test)]
    pub fn gauge_count(&self) -> usize {
        lock(&self.inner.callbacks).len()
    }

    fn counter_vec(&self, desc: &MetricDesc) -> prometheus::Result<IntCounterVec> {
        let mut families = lock(&self.inner.families);
        family(&self.inner.prometheus, &mut families.counters, desc, || {
            IntCounterVec::new(Opts::new(desc.name, desc.help), desc.labels)
        })
    }

    fn histogram_vec(&self, desc: &MetricDesc) -> prometheus::Result<HistogramVec> {
        let mut families = lock(&self.inner.families);
        family(&self.inner.prometheus, &mut families.histograms, desc, || {
            let mut opts = HistogramOpts::new(desc.name, desc.help);
            if !desc.buckets.is_empty() {
                opts = opts.buckets(desc.buckets.to_vec());
            }
            HistogramVec::new(opts, desc.labels)
        })
    }

    fn gauge_vec(&self, desc: &MetricDesc) -> prometheus::Result<GaugeVec> {
        let mut families = lock(&self.inner.families);
        family(&self.inner.prometheus, &mut families.gauges, desc, || {
            GaugeVec::new(Opts::new(desc.name, desc.help), desc.labels)
        })
    }

    fn try_add_counter(&self, desc: &MetricDesc, value: u64, tags: &TagSet) -> Result<(), SinkError> {
        let values = desc.label_values(tags)?;
        self.counter_vec(desc)?
            .get_metric_with_label_values(&as_strs(&values))?
            .inc_by(value);
        Ok(())
    }

    fn try_record_histogram(&self, desc: &MetricDesc, value: f64, tags: &TagSet) -> Result<(), SinkError> {
        let values = desc.label_values(tags)?;
        self.histogram_vec(desc)?
            .get_metric_with_label_values(&as_strs(&values))?
            .observe(value);
        Ok(())
    }

    fn try_set_gauge(&self, desc: &MetricDesc, measurement: &Measurement) -> Result<(), SinkError> {
        let values = desc.label_values(&measurement.tags)?;
        self.gauge_vec(desc)?
            .get_metric_with_label_values(&as_strs(&values))?
            .set(measurement.value);
        Ok(())
    }

    /// Invokes every registered gauge concurrently, publishes what they
    /// return, then gathers all families.
    ///
    /// Gauges run first so samples they record during the tick (player
    /// pings) land in the same snapshot. No lock is held while callbacks
    /// run.
    pub async fn collect(&self) -> Snapshot {
        let callbacks: Vec<(&'static MetricDesc, GaugeCallback)> = lock(&self.inner.callbacks)
            .values()
            .map(|(desc, callback)| (*desc, callback.clone()))
            .collect();

        let observed = join_all(callbacks.iter().map(|(_, callback)| callback())).await;

        for gauge in lock(&self.inner.families).gauges.values() {
            gauge.reset();
        }
        for ((desc, _), measurements) in callbacks.iter().zip(observed) {
            for measurement in &measurements {
                if let Err(e) = self.try_set_gauge(desc, measurement) {
                    error!("Dropping {} sample: {e}", desc.name);
                }
            }
        }

        Snapshot { taken_at: Utc::now(), families: self.inner.prometheus.gather() }
    }

    fn unregister(inner: &Weak<RegistryInner>, id: u64) {
        if let Some(inner) = inner.upgrade() {
            lock(&inner.callbacks).remove(&id);
        }
    }
}

impl MetricsSink for Registry {
    fn add_counter(&self, desc: &'static MetricDesc, value: u64, tags: &TagSet) {
        if let Err(e) = self.try_add_counter(desc, value, tags) {
            error!("Dropping {} increment: {e}", desc.name);
        }
    }

    fn record_histogram(&self, desc: &'static MetricDesc, value: f64, tags: &TagSet) {
        if let Err(e) = self.try_record_histogram(desc, value, tags) {
            error!("Dropping {} sample: {e}", desc.name);
        }
    }

    fn register_gauge(&self, desc: &'static MetricDesc, callback: GaugeCallback) -> GaugeRegistration {
        let id = self.inner.next_gauge_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.callbacks).insert(id, (desc, callback));

        let weak = Arc::downgrade(&self.inner);
        GaugeRegistration::new(move || Registry::unregister(&weak, id))
    }
}

/// Every family of the registry at one export tick.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub families: Vec<MetricFamily>,
}

impl Snapshot {
    /// Prometheus text exposition of the snapshot.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.families)
    }
}

/// One exported series.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct Sample {
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

#[cfg(test)]
impl Sample {
    /// Value of label `key`. Empty values count as absent.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    pub fn matches(&self, filter: &[(&str, &str)]) -> bool {
        filter.iter().all(|(key, value)| self.label(key) == Some(*value))
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramTotals {
    pub count: u64,
    pub sum: f64,
}

#[cfg(test)]
impl Snapshot {
    fn samples(&self, name: &str, read: impl Fn(&prometheus::proto::Metric) -> f64) -> Vec<Sample> {
        self.families
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().iter())
            .map(|metric| Sample {
                labels: metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect(),
                value: read(metric),
            })
            .collect()
    }

    /// Sum of every series of counter `name` whose labels match `filter`.
    pub fn counter(&self, name: &str, filter: &[(&str, &str)]) -> u64 {
        self.samples(name, |m| m.get_counter().get_value())
            .iter()
            .filter(|s| s.matches(filter))
            .map(|s| s.value as u64)
            .sum()
    }

    pub fn gauge(&self, name: &str) -> Vec<Sample> {
        self.samples(name, |m| m.get_gauge().get_value())
    }

    pub fn histogram(&self, name: &str, filter: &[(&str, &str)]) -> Option<HistogramTotals> {
        let counts = self.samples(name, |m| m.get_histogram().get_sample_count() as f64);
        let sums = self.samples(name, |m| m.get_histogram().get_sample_sum());

        let matching: Vec<(Sample, Sample)> =
            counts.into_iter().zip(sums).filter(|(count, _)| count.matches(filter)).collect();
        if matching.is_empty() {
            return None;
        }

        Some(HistogramTotals {
            count: matching.iter().map(|(count, _)| count.value as u64).sum(),
            sum: matching.iter().map(|(_, sum)| sum.value).sum(),
        })
    }
}

// ------------------------------------------------------------
// Runtime self-metrics
// ------------------------------------------------------------

/// Process-wide health counters of the bridge itself.
///
/// Design:
/// - Lock-free (Atomics)
/// - Safe to bump from any task
#[derive(Default)]
pub struct RuntimeMetrics {
    pub servers_active: AtomicUsize,

    // Session lifecycle
    pub cohorts_started: AtomicUsize,
    pub cohorts_active: AtomicUsize,
    pub session_poll_failures: AtomicUsize,

    // Streams
    pub stream_reopens: AtomicUsize,
    pub events_received: AtomicUsize,
    pub events_counted: AtomicUsize,
    pub events_ignored: AtomicUsize,
    pub events_dropped: AtomicUsize,
    pub unit_updates: AtomicUsize,
    pub malformed_messages: AtomicUsize,

    // Unary calls
    pub rpc_timeouts: AtomicUsize,
    pub rpc_errors: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn summary_line(&self) -> String {
        format!(
            "[METRICS] servers={} cohorts={}/{} session_fail={} reopens={} events={} counted={} ignored={} dropped={} unit_updates={} malformed={} timeouts={} rpc_err={}",
            self.servers_active.load(Ordering::Relaxed),
            self.cohorts_active.load(Ordering::Relaxed),
            self.cohorts_started.load(Ordering::Relaxed),
            self.session_poll_failures.load(Ordering::Relaxed),
            self.stream_reopens.load(Ordering::Relaxed),
            self.events_received.load(Ordering::Relaxed),
            self.events_counted.load(Ordering::Relaxed),
            self.events_ignored.load(Ordering::Relaxed),
            self.events_dropped.load(Ordering::Relaxed),
            self.unit_updates.load(Ordering::Relaxed),
            self.malformed_messages.load(Ordering::Relaxed),
            self.rpc_timeouts.load(Ordering::Relaxed),
            self.rpc_errors.load(Ordering::Relaxed),
        )
    }
}

/// Global runtime metrics (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> = Lazy::new(|| Arc::new(RuntimeMetrics::default()));


#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    static SHOTS: MetricDesc =
        MetricDesc::new("shoot_counter", "Shots", &["server_short_name", "session_id", "weapon"]);
    static CONNECTS: MetricDesc =
        MetricDesc::new("connect_counter", "Connections", &["server_short_name", "session_id"]);
    static PINGS: MetricDesc = MetricDesc::new("player_pings", "Pings", &["server_short_name", "session_id"])
        .with_buckets(&[50.0, 100.0]);
    static UNITS: MetricDesc = MetricDesc::new("units_per_server_gauge", "Units", &["category"]);
    static BALLISTICS: MetricDesc = MetricDesc::new("ballistics", "Ballistic objects", &[]);

    fn tags() -> TagSet {
        TagSet::new().with("server_short_name", "alpha").with("session_id", 100i64)
    }

    #[test]
    fn tag_set_replaces_existing_key_in_place() {
        let mut set = tags().with("coalition", Coalition::Red);
        set.push("server_short_name", "bravo");

        assert_eq!(set.len(), 3);
        assert_eq!(set.to_string(), "{server_short_name=bravo,session_id=100,coalition=Red}");
        assert!(set.matches(&[("coalition", "Red"), ("session_id", "100")]));
        assert!(!set.matches(&[("coalition", "Blue")]));
        assert!(!set.matches(&[("weapon", "AIM-9")]));
    }

    #[test]
    fn label_values_follow_declaration_order_and_fill_gaps() {
        let values = SHOTS.label_values(&TagSet::new().with("weapon", "AIM-9").with("session_id", 7i64));
        assert_eq!(values.unwrap(), vec!["".to_string(), "7".to_string(), "AIM-9".to_string()]);

        let err = CONNECTS.label_values(&tags().with("weapon", "AIM-9")).unwrap_err();
        assert!(matches!(err, SinkError::UndeclaredLabel { key: "weapon", .. }), "{err}");
    }

    #[tokio::test]
    async fn counters_and_histograms_accumulate_per_series() {
        let registry = Registry::new();
        registry.add_counter(&SHOTS, 1, &tags());
        registry.add_counter(&SHOTS, 2, &tags());
        registry.add_counter(&SHOTS, 1, &tags().with("weapon", "GAU-8"));
        registry.record_histogram(&PINGS, 40.0, &tags());
        registry.record_histogram(&PINGS, 10.0, &tags());

        let snapshot = registry.collect().await;
        assert_eq!(snapshot.counter("shoot_counter", &[]), 4);
        assert_eq!(snapshot.counter("shoot_counter", &[("weapon", "GAU-8")]), 1);

        let pings = snapshot.histogram("player_pings", &[("server_short_name", "alpha")]).unwrap();
        assert_eq!(pings, HistogramTotals { count: 2, sum: 50.0 });
    }

    #[tokio::test]
    async fn undeclared_tags_are_not_recorded() {
        let registry = Registry::new();
        registry.add_counter(&CONNECTS, 1, &tags().with("weapon", "AIM-9"));

        assert_eq!(registry.collect().await.counter("connect_counter", &[]), 0);
    }

    #[tokio::test]
    async fn gauges_are_pulled_on_collect_and_released_on_drop() {
        let registry = Registry::new();
        let callback: GaugeCallback = Arc::new(|| {
            async { vec![Measurement::new(3.0, TagSet::new().with("category", "Ship"))] }.boxed()
        });

        let registration = registry.register_gauge(&UNITS, callback);
        assert_eq!(registry.gauge_count(), 1);

        let snapshot = registry.collect().await;
        let values = snapshot.gauge("units_per_server_gauge");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, 3.0);
        assert_eq!(values[0].label("category"), Some("Ship"));

        drop(registration);
        assert_eq!(registry.gauge_count(), 0);
        assert!(registry.collect().await.gauge("units_per_server_gauge").is_empty());
    }

    #[tokio::test]
    async fn snapshot_encodes_prometheus_text() {
        let registry = Registry::new();
        registry.add_counter(&CONNECTS, 1, &tags());
        let _gauge = registry.register_gauge(
            &BALLISTICS,
            Arc::new(|| async { vec![Measurement::new(12.0, TagSet::new())] }.boxed()),
        );

        let text = registry.collect().await.encode().unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines.contains(&"# TYPE connect_counter counter"), "{text}");
        assert!(
            lines.contains(&r#"connect_counter{server_short_name="alpha",session_id="100"} 1"#),
            "{text}"
        );
        assert!(lines.contains(&"# TYPE ballistics gauge"), "{text}");
        assert!(lines.contains(&"ballistics 12"), "{text}");
    }
}
