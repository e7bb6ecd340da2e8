//! Event collector
//!
//! Follows the server's event stream and turns the curated subset of
//! event kinds into counters. Simulation FPS reports are kept as the
//! current value of a pull-style gauge instead.
//!
//! Classification is a pure function (`classify`) so the tag rules can
//! be tested without a stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use log::{debug, info, warn};

use super::collector::{Collector, CollectorConfig, CollectorKind, tag};
use super::stream::{StreamEnd, consume, run_stream_loop};
use crate::metrics::{GaugeCallback, METRICS, Measurement, MetricDesc, MetricsSink, TagSet};
use crate::schema::{Airbase, Entity, EventKind, Weapon};

const BASE_LABELS: &[&str] = &[tag::SERVER_SHORT_NAME, tag::SESSION_ID];

const SHOT_LABELS: &[&str] = &[
    tag::SERVER_SHORT_NAME,
    tag::SESSION_ID,
    tag::SHOOTER_TYPE,
    tag::SHOOTER_COALITION,
    tag::SHOOTER_IS_PLAYER,
    tag::SHOOTER_CATEGORY,
    tag::WEAPON,
];

const ENGAGEMENT_LABELS: &[&str] = &[
    tag::SERVER_SHORT_NAME,
    tag::SESSION_ID,
    tag::SHOOTER_TYPE,
    tag::SHOOTER_COALITION,
    tag::SHOOTER_IS_PLAYER,
    tag::SHOOTER_CATEGORY,
    tag::WEAPON,
    tag::TARGET_TYPE,
    tag::TARGET_COALITION,
    tag::TARGET_IS_PLAYER,
    tag::TARGET_CATEGORY,
];

const SUBJECT_LABELS: &[&str] = &[
    tag::SERVER_SHORT_NAME,
    tag::SESSION_ID,
    tag::UNIT_TYPE,
    tag::STATIC_TYPE,
    tag::COALITION,
    tag::IS_PLAYER,
    tag::CATEGORY,
];

const AIRFIELD_LABELS: &[&str] = &[
    tag::SERVER_SHORT_NAME,
    tag::SESSION_ID,
    tag::UNIT_TYPE,
    tag::STATIC_TYPE,
    tag::COALITION,
    tag::IS_PLAYER,
    tag::CATEGORY,
    tag::AIRBASE,
    tag::AIRBASE_CATEGORY,
];

const SHOOTING_START_LABELS: &[&str] =
    &[tag::SERVER_SHORT_NAME, tag::SESSION_ID, tag::SHOOTER_TYPE, tag::WEAPON];

pub static BIRTH_COUNTER: MetricDesc =
    MetricDesc::new("birth_counter", "Units spawned", SUBJECT_LABELS);
pub static SHOOT_COUNTER: MetricDesc =
    MetricDesc::new("shoot_counter", "Weapons released", SHOT_LABELS);
pub static HIT_COUNTER: MetricDesc =
    MetricDesc::new("hit_counter", "Hits on units and static objects", ENGAGEMENT_LABELS);
pub static TAKEOFF_COUNTER: MetricDesc =
    MetricDesc::new("takeoff_counter", "Takeoffs", AIRFIELD_LABELS);
pub static LANDING_COUNTER: MetricDesc =
    MetricDesc::new("landing_counter", "Landings", AIRFIELD_LABELS);
pub static CRASH_COUNTER: MetricDesc = MetricDesc::new("crash_counter", "Crashes", SUBJECT_LABELS);
pub static EJECTION_COUNTER: MetricDesc =
    MetricDesc::new("ejection_counter", "Pilot ejections", SUBJECT_LABELS);
pub static DEAD_COUNTER: MetricDesc =
    MetricDesc::new("dead_counter", "Units and objects destroyed", SUBJECT_LABELS);
pub static PILOT_DEAD_COUNTER: MetricDesc =
    MetricDesc::new("pilot_dead_counter", "Pilots killed", SUBJECT_LABELS);
pub static KILL_COUNTER: MetricDesc =
    MetricDesc::new("kill_counter", "Kills credited to a shooter", ENGAGEMENT_LABELS);
pub static LOST_COUNTER: MetricDesc = MetricDesc::new("lost_counter", "Units lost", SUBJECT_LABELS);
pub static CONNECT_COUNTER: MetricDesc =
    MetricDesc::new("connect_counter", "Player connections", BASE_LABELS);
pub static DISCONNECT_COUNTER: MetricDesc =
    MetricDesc::new("disconnect_counter", "Player disconnections", BASE_LABELS);
pub static SHOOTING_START_COUNTER: MetricDesc = MetricDesc::new(
    "shooting_start_counter",
    "Times a rapid-fire weapon starts firing",
    SHOOTING_START_LABELS,
);

pub static SIMULATION_FPS_GAUGE: MetricDesc = MetricDesc::new(
    "simulation_frames_per_second_gauge",
    "Average simulation frames per second",
    BASE_LABELS,
);

const MISSING_WEAPON: &str = "missing weapon";

/// What to do with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Count { counter: &'static MetricDesc, tags: TagSet },
    SimulationFps(f64),
    /// Not a kind this collector measures.
    Ignored,
    /// A measured kind missing a reference it needs.
    Dropped(&'static str),
}

// ------------------------------------------------------------
// Entity tagging
// ------------------------------------------------------------

/// Tag keys and log reasons for one role an entity plays in an event.
struct Role {
    missing: &'static str,
    unsupported: &'static str,
    unit_type: &'static str,
    static_type: &'static str,
    coalition: &'static str,
    is_player: &'static str,
    category: &'static str,
}

const SHOOTER: Role = Role {
    missing: "missing initiator",
    unsupported: "initiator is neither a unit nor a static object",
    unit_type: tag::SHOOTER_TYPE,
    static_type: tag::SHOOTER_TYPE,
    coalition: tag::SHOOTER_COALITION,
    is_player: tag::SHOOTER_IS_PLAYER,
    category: tag::SHOOTER_CATEGORY,
};

const TARGET: Role = Role {
    missing: "missing target",
    unsupported: "target is neither a unit nor a static object",
    unit_type: tag::TARGET_TYPE,
    static_type: tag::TARGET_TYPE,
    coalition: tag::TARGET_COALITION,
    is_player: tag::TARGET_IS_PLAYER,
    category: tag::TARGET_CATEGORY,
};

/// The single entity of a takeoff, crash, death and the like.
const SUBJECT: Role = Role {
    missing: "missing initiator",
    unsupported: "initiator is neither a unit nor a static object",
    unit_type: tag::UNIT_TYPE,
    static_type: tag::STATIC_TYPE,
    coalition: tag::COALITION,
    is_player: tag::IS_PLAYER,
    category: tag::CATEGORY,
};

/// Adds the tags describing `entity` in `role`.
///
/// Units carry type, coalition, player flag and category. Static
/// objects only have type and coalition.
fn push_entity(tags: &mut TagSet, entity: Option<&Entity>, role: &Role) -> Result<(), &'static str> {
    match entity {
        Some(Entity::Unit(unit)) => {
            tags.push(role.unit_type, unit.type_name.as_str());
            tags.push(role.coalition, unit.coalition);
            tags.push(role.is_player, unit.is_player());
            tags.push(role.category, unit.category);
            Ok(())
        }
        Some(Entity::Static(object)) => {
            tags.push(role.static_type, object.type_name.as_str());
            tags.push(role.coalition, object.coalition);
            Ok(())
        }
        Some(_) => Err(role.unsupported),
        None => Err(role.missing),
    }
}

/// Weapon type, falling back to the bare weapon name some events carry.
fn push_weapon(tags: &mut TagSet, weapon: Option<&Weapon>, weapon_name: Option<&String>) {
    if let Some(weapon) = weapon {
        tags.push(tag::WEAPON, weapon.type_name.as_str());
    } else if let Some(name) = weapon_name {
        tags.push(tag::WEAPON, name.as_str());
    }
}

/// Unnamed places (open fields, roads) carry no airbase tags.
fn push_airbase(tags: &mut TagSet, place: Option<&Airbase>) {
    if let Some(Airbase { name: Some(name), category, .. }) = place {
        tags.push(tag::AIRBASE, name.as_str());
        tags.push(tag::AIRBASE_CATEGORY, *category);
    }
}

// ------------------------------------------------------------
// Classification
// ------------------------------------------------------------

fn subject(counter: &'static MetricDesc, mut tags: TagSet, initiator: Option<&Entity>) -> Classification {
    match push_entity(&mut tags, initiator, &SUBJECT) {
        Ok(()) => Classification::Count { counter, tags },
        Err(reason) => Classification::Dropped(reason),
    }
}

fn engagement(
    counter: &'static MetricDesc,
    mut tags: TagSet,
    initiator: Option<&Entity>,
    weapon: Option<&Weapon>,
    weapon_name: Option<&String>,
    target: Option<&Entity>,
) -> Classification {
    if let Err(reason) = push_entity(&mut tags, initiator, &SHOOTER) {
        return Classification::Dropped(reason);
    }
    push_weapon(&mut tags, weapon, weapon_name);
    if let Err(reason) = push_entity(&mut tags, target, &TARGET) {
        return Classification::Dropped(reason);
    }
    Classification::Count { counter, tags }
}

/// Decides how `event` is measured, starting from the cohort's `base` tags.
pub fn classify(event: &EventKind, base: &TagSet) -> Classification {
    let mut tags = base.clone();

    match event {
        EventKind::Shot { initiator, weapon } => {
            if let Err(reason) = push_entity(&mut tags, initiator.as_ref(), &SHOOTER) {
                return Classification::Dropped(reason);
            }
            push_weapon(&mut tags, weapon.as_ref(), None);
            Classification::Count { counter: &SHOOT_COUNTER, tags }
        }
        EventKind::Hit { initiator, weapon, weapon_name, target } => engagement(
            &HIT_COUNTER,
            tags,
            initiator.as_ref(),
            weapon.as_ref(),
            weapon_name.as_ref(),
            target.as_ref(),
        ),
        // A kill is only credited with the weapon that scored it.
        EventKind::Kill { weapon: None, weapon_name: None, .. } => {
            Classification::Dropped(MISSING_WEAPON)
        }
        EventKind::Kill { initiator, weapon, weapon_name, target } => engagement(
            &KILL_COUNTER,
            tags,
            initiator.as_ref(),
            weapon.as_ref(),
            weapon_name.as_ref(),
            target.as_ref(),
        ),
        EventKind::Takeoff { initiator, place } | EventKind::Land { initiator, place } => {
            let counter = match event {
                EventKind::Takeoff { .. } => &TAKEOFF_COUNTER,
                _ => &LANDING_COUNTER,
            };
            push_airbase(&mut tags, place.as_ref());
            subject(counter, tags, initiator.as_ref())
        }
        EventKind::Crash { initiator } => subject(&CRASH_COUNTER, tags, initiator.as_ref()),
        EventKind::Ejection { initiator } => subject(&EJECTION_COUNTER, tags, initiator.as_ref()),
        EventKind::Dead { initiator } => subject(&DEAD_COUNTER, tags, initiator.as_ref()),
        EventKind::PilotDead { initiator } => subject(&PILOT_DEAD_COUNTER, tags, initiator.as_ref()),
        EventKind::UnitLost { initiator } => subject(&LOST_COUNTER, tags, initiator.as_ref()),
        // Statics and scenery are "born" at mission start; only units count.
        EventKind::Birth { initiator: Some(unit @ Entity::Unit(_)) } => {
            subject(&BIRTH_COUNTER, tags, Some(unit))
        }
        EventKind::Birth { .. } => Classification::Ignored,
        EventKind::ShootingStart { initiator, weapon_name } => {
            let shooter_type = match initiator {
                Some(Entity::Unit(unit)) => unit.type_name.as_str(),
                Some(Entity::Static(object)) => object.type_name.as_str(),
                Some(_) => return Classification::Dropped(SHOOTER.unsupported),
                None => return Classification::Dropped(SHOOTER.missing),
            };
            tags.push(tag::SHOOTER_TYPE, shooter_type);
            push_weapon(&mut tags, None, weapon_name.as_ref());
            Classification::Count { counter: &SHOOTING_START_COUNTER, tags }
        }
        EventKind::Connect { .. } => Classification::Count { counter: &CONNECT_COUNTER, tags },
        EventKind::Disconnect { .. } => Classification::Count { counter: &DISCONNECT_COUNTER, tags },
        EventKind::SimulationFps { average } => Classification::SimulationFps(*average),
        _ => Classification::Ignored,
    }
}

// ------------------------------------------------------------
// Collector
// ------------------------------------------------------------

pub struct EventCollector {
    config: Arc<CollectorConfig>,
    sink: Arc<dyn MetricsSink>,
    base_tags: TagSet,
    /// Latest simulation FPS, stored as `f64` bits.
    fps: Arc<AtomicU64>,
}

impl EventCollector {
    pub fn new(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Self {
        let base_tags = config.base_tags();
        Self {
            config,
            sink,
            base_tags,
            fps: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    pub fn boxed(config: Arc<CollectorConfig>, sink: Arc<dyn MetricsSink>) -> Box<dyn Collector> {
        Box::new(Self::new(config, sink))
    }

    fn fps_gauge(&self) -> GaugeCallback {
        let fps = self.fps.clone();
        let tags = self.base_tags.clone();
        Arc::new(move || {
            let value = f64::from_bits(fps.load(Ordering::Relaxed));
            let measurement = Measurement::new(value, tags.clone());
            async move { vec![measurement] }.boxed()
        })
    }

    fn handle(&self, event: &EventKind) {
        let label = &*self.config.server_short_name;
        METRICS.events_received.fetch_add(1, Ordering::Relaxed);

        match classify(event, &self.base_tags) {
            Classification::Count { counter, tags } => {
                METRICS.events_counted.fetch_add(1, Ordering::Relaxed);
                self.sink.add_counter(counter, 1, &tags);
            }
            Classification::SimulationFps(average) => {
                self.fps.store(average.to_bits(), Ordering::Relaxed);
            }
            Classification::Ignored => {
                METRICS.events_ignored.fetch_add(1, Ordering::Relaxed);
            }
            Classification::Dropped(reason) => {
                METRICS.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("[{label}] Dropping {} event: {reason}", event.name());
            }
        }
    }

    /// One pass over the event stream.
    async fn follow(&self) -> StreamEnd {
        let events = match self.config.endpoint.stream_events().await {
            Ok(events) => events,
            Err(e) => return StreamEnd::OpenFailed(e),
        };

        debug!("[{}] Event stream open", self.config.server_short_name);

        consume(&self.config.server_short_name, "event", events, |event| self.handle(&event)).await
    }

    /// One pass, with the FPS gauge reporting 0 while no stream is read.
    async fn follow_and_reset(&self) -> StreamEnd {
        let end = self.follow().await;
        self.reset_fps();
        end
    }

    fn reset_fps(&self) {
        self.fps.store(0f64.to_bits(), Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl Collector for EventCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Events
    }

    async fn run(self: Box<Self>) {
        let _gauge = self.sink.register_gauge(&SIMULATION_FPS_GAUGE, self.fps_gauge());
        info!(
            "[{}] Event collector started for session {}",
            self.config.server_short_name, self.config.session_id
        );

        run_stream_loop(&self.config.server_short_name, "event", &self.config.scope, || {
            self.follow_and_reset()
        })
        .await;
    }
}
