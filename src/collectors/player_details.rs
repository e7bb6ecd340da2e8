//! Player details collector
//!
//! One `GetPlayers` call per export tick feeds both the per-coalition
//! player gauge and the ping histogram.

use std::sync::Arc;

use futures_util::FutureExt;
use log::{debug, info};

use super::collector::{Collector, CollectorConfig, CollectorKind, settle, tag};
use crate::metrics::{GaugeCallback, Measurement, MetricDesc, MetricsSink, TagSet};
use crate::rpc::CallOutcome;
use crate::schema::{Coalition, Player, SERVER_PLAYER_ID};
use crate::util::COLLECTOR_CALL_DEADLINE;

pub static PLAYERS_GAUGE: MetricDesc = MetricDesc::new(
    "players",
    "Connected players per coalition",
    &[tag::SERVER_SHORT_NAME, tag::SESSION_ID, tag::COALITION],
);

/// Milliseconds.
pub static PLAYER_PINGS_HISTOGRAM: MetricDesc =
    MetricDesc::new("player_pings", "Player ping in milliseconds", &[tag::SERVER_SHORT_NAME, tag::SESSION_ID])
        .with_buckets(&[10.0, 25.0, 50.0, 100.0, 200.0, 400.0, 800.0, 1600.0]);

/// Players per coalition, plus one ping sample per player, taken on
/// every export tick from a single `GetPlayers` call.
pub struct PlayerDetailsCollector {
    config: Arc<CollectorConfig>,
    sink: Arc<dyn MetricsSink>,
}

/// Turns one player list into coalition counts and records pings.
///
/// The server's own host slot is neither counted nor sampled.
fn measure(players: &[Player], base: &TagSet, sink: &dyn MetricsSink) -> Vec<Measurement> {
    let players: Vec<&Player> = players.iter().filter(|p| p.id != SERVER_PLAYER_ID).collect();

    for player in &players {
        sink.record_histogram(&PLAYER_PINGS_HISTOGRAM, f64::from(player.ping), base);
    }

    Coalition::PLAYABLE
        .iter()
        .map(|coalition| {
            let count = players.iter().filter(|p| p.coalition == *coalition).count();
            Measurement::new(count as f64, base.clone().with(tag::COALITION, *coalition))
        })
        .collect()
}

impl PlayerDetailsCollector {
    pub fn new(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink }
    }

    pub fn boxed(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Box<dyn Collector> {
        Box::new(Self::new(config, sink))
    }

    fn gauge(&self) -> GaugeCallback {
        let config = self.config.clone();
        let sink = self.sink.clone();
        let base = config.base_tags();
        Arc::new(move || {
            let config = config.clone();
            let sink = sink.clone();
            let base = base.clone();
            async move {
                let label = &*config.server_short_name;
                debug!("[{label}] Fetching players");
                let outcome = CallOutcome::from(config.endpoint.get_players(COLLECTOR_CALL_DEADLINE).await);
                settle(label, "GetPlayers", outcome)
                    .map(|players| measure(&players, &base, sink.as_ref()))
                    .unwrap_or_default()
            }
            .boxed()
        })
    }
}

#[async_trait::async_trait]
impl Collector for PlayerDetailsCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::PlayerDetails
    }

    async fn run(self: Box<Self>) {
        let _gauge = self.sink.register_gauge(&PLAYERS_GAUGE, self.gauge());
        info!(
            "[{}] Player details collector started for session {}",
            self.config.server_short_name, self.config.session_id
        );

        self.config.scope.cancelled().await;
    }
}
