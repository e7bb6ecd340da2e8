//! Wire types of the game server's remote interface.
//!
//! Every message the bridge sends or receives is modelled here with
//! serde. Fields the bridge never reads are left out; unknown event and
//! unit update kinds decode to an `Unknown` variant instead of failing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of one running mission instance on a game server.
///
/// Changes whenever the mission restarts. The bridge never interprets
/// the value, it only forwards it as the `session_id` tag.
pub type SessionId = i64;

/// Player id the game server assigns to its own host slot.
///
/// The host is not a real player and is excluded from player counts
/// and ping histograms.
pub const SERVER_PLAYER_ID: u32 = 1;

// ------------------------------------------------------------
// Enumerations
// ------------------------------------------------------------
//
// These enumerations are closed and exhaustive. Gauges that report
// one series per variant (units per category, players per coalition)
// iterate the `ALL` constants so every series is always present.
//

/// In-game faction a unit, static object or player belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coalition {
    All,
    Neutral,
    Red,
    Blue,
}

impl Coalition {
    /// Coalitions a player can actually join.
    pub const PLAYABLE: [Coalition; 3] = [Coalition::Neutral, Coalition::Red, Coalition::Blue];

    pub fn as_str(self) -> &'static str {
        match self {
            Coalition::All => "All",
            Coalition::Neutral => "Neutral",
            Coalition::Red => "Red",
            Coalition::Blue => "Blue",
        }
    }
}

impl fmt::Display for Coalition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad class of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupCategory {
    #[serde(alias = "airplane")]
    Plane,
    Helicopter,
    Ground,
    Ship,
    Train,
}

impl GroupCategory {
    pub const ALL: [GroupCategory; 5] = [
        GroupCategory::Plane,
        GroupCategory::Helicopter,
        GroupCategory::Ground,
        GroupCategory::Ship,
        GroupCategory::Train,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GroupCategory::Plane => "Plane",
            GroupCategory::Helicopter => "Helicopter",
            GroupCategory::Ground => "Ground",
            GroupCategory::Ship => "Ship",
            GroupCategory::Train => "Train",
        }
    }
}

impl fmt::Display for GroupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AirbaseCategory {
    Airdrome,
    Helipad,
    Ship,
}

impl AirbaseCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AirbaseCategory::Airdrome => "Airdrome",
            AirbaseCategory::Helipad => "Helipad",
            AirbaseCategory::Ship => "Ship",
        }
    }
}

// ------------------------------------------------------------
// Entities
// ------------------------------------------------------------
//
// Events reference the objects involved ("initiator", "target",
// "place"). A reference may be absent entirely, or point at any of
// the entity kinds below. Collectors branch on the kind and build
// the best tag set they can.
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub coalition: Coalition,
    pub category: GroupCategory,
    /// Set only when a human occupies the unit.
    #[serde(default)]
    pub player_name: Option<String>,
}

impl Unit {
    pub fn is_player(&self) -> bool {
        self.player_name.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticObject {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub coalition: Coalition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weapon {
    pub id: u32,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenery {
    pub id: u32,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Airbase {
    #[serde(default)]
    pub name: Option<String>,
    pub category: AirbaseCategory,
    pub coalition: Coalition,
}

/// Any object an event can point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Unit(Unit),
    Static(StaticObject),
    Weapon(Weapon),
    Scenery(Scenery),
    Airbase(Airbase),
}

// ------------------------------------------------------------
// Event stream
// ------------------------------------------------------------

/// One message of the live event stream.
///
/// Only a curated subset of kinds is turned into measurements, the
/// rest are listed so they decode cleanly and are then ignored.
/// Kinds this build does not know at all decode as `Unknown`.
///
/// IMPORTANT:
/// - Every entity reference is optional on the wire. The event
///   collector must cope with any of them missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Shot {
        initiator: Option<Entity>,
        weapon: Option<Weapon>,
    },
    Hit {
        initiator: Option<Entity>,
        weapon: Option<Weapon>,
        weapon_name: Option<String>,
        target: Option<Entity>,
    },
    Takeoff {
        initiator: Option<Entity>,
        place: Option<Airbase>,
    },
    Land {
        initiator: Option<Entity>,
        place: Option<Airbase>,
    },
    Crash {
        initiator: Option<Entity>,
    },
    Ejection {
        initiator: Option<Entity>,
    },
    Dead {
        initiator: Option<Entity>,
    },
    PilotDead {
        initiator: Option<Entity>,
    },
    Birth {
        initiator: Option<Entity>,
    },
    Kill {
        initiator: Option<Entity>,
        weapon: Option<Weapon>,
        weapon_name: Option<String>,
        target: Option<Entity>,
    },
    UnitLost {
        initiator: Option<Entity>,
    },
    ShootingStart {
        initiator: Option<Entity>,
        weapon_name: Option<String>,
    },
    Connect {
        id: Option<u32>,
        name: Option<String>,
    },
    Disconnect {
        id: Option<u32>,
    },
    SimulationFps {
        average: f64,
    },
    Refueling,
    RefuelingStop,
    BaseCapture,
    MissionStart,
    MissionEnd,
    HumanFailure,
    DetailedFailure,
    EngineStartup,
    EngineShutdown,
    PlayerEnterUnit,
    PlayerLeaveUnit,
    ShootingEnd,
    MarkAdd,
    MarkChange,
    MarkRemove,
    Score,
    LandingAfterEjection,
    DiscardChairAfterEjection,
    WeaponAdd,
    LandingQualityMark,
    PlayerSendChat,
    PlayerChangeSlot,
    MissionCommand,
    CoalitionCommand,
    GroupCommand,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Shot { .. } => "shot",
            EventKind::Hit { .. } => "hit",
            EventKind::Takeoff { .. } => "takeoff",
            EventKind::Land { .. } => "land",
            EventKind::Crash { .. } => "crash",
            EventKind::Ejection { .. } => "ejection",
            EventKind::Dead { .. } => "dead",
            EventKind::PilotDead { .. } => "pilot_dead",
            EventKind::Birth { .. } => "birth",
            EventKind::Kill { .. } => "kill",
            EventKind::UnitLost { .. } => "unit_lost",
            EventKind::ShootingStart { .. } => "shooting_start",
            EventKind::Connect { .. } => "connect",
            EventKind::Disconnect { .. } => "disconnect",
            EventKind::SimulationFps { .. } => "simulation_fps",
            EventKind::Unknown => "unknown",
            _ => "unmapped",
        }
    }
}

// ------------------------------------------------------------
// Unit stream
// ------------------------------------------------------------

/// Identity and class of one live unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitSummary {
    pub id: u32,
    pub category: GroupCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitUpdate {
    /// A unit spawned, or an already known unit was re-announced.
    Appeared(UnitSummary),
    /// The unit with this id no longer exists.
    Gone { id: u32 },
    #[serde(other)]
    Unknown,
}

// ------------------------------------------------------------
// Unary responses
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub coalition: Coalition,
    /// Round trip time in milliseconds.
    pub ping: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIdResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallisticsCountResponse {
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayersResponse {
    pub players: Vec<Player>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shot_event_decodes_nested_unit_initiator() {
        let raw = json!({
            "type": "shot",
            "initiator": {
                "kind": "unit",
                "id": 7,
                "type": "F-16C_50",
                "coalition": "blue",
                "category": "airplane",
                "player_name": "Viper"
            },
            "weapon": { "id": 99, "type": "AIM-9X" }
        });

        let event: EventKind = serde_json::from_value(raw).unwrap();
        let EventKind::Shot { initiator: Some(Entity::Unit(unit)), weapon: Some(weapon) } = &event
        else {
            panic!("unexpected decode: {event:?}");
        };
        assert_eq!(unit.type_name, "F-16C_50");
        assert_eq!(unit.category, GroupCategory::Plane);
        assert!(unit.is_player());
        assert_eq!(weapon.type_name, "AIM-9X");
    }

    #[test]
    fn unlisted_event_kind_decodes_as_unknown() {
        let event: EventKind =
            serde_json::from_value(json!({ "type": "brand_new_kind", "foo": 1 })).unwrap();
        assert_eq!(event, EventKind::Unknown);
    }

    #[test]
    fn unmapped_kind_ignores_its_payload() {
        let event: EventKind = serde_json::from_value(json!({
            "type": "engine_startup",
            "initiator": { "kind": "unit", "id": 1 }
        }))
        .unwrap();
        assert_eq!(event, EventKind::EngineStartup);
        assert_eq!(event.name(), "unmapped");
    }

    #[test]
    fn unit_updates_decode() {
        let appeared: UnitUpdate =
            serde_json::from_value(json!({ "type": "appeared", "id": 5, "category": "ship" }))
                .unwrap();
        assert_eq!(
            appeared,
            UnitUpdate::Appeared(UnitSummary { id: 5, category: GroupCategory::Ship })
        );

        let gone: UnitUpdate = serde_json::from_value(json!({ "type": "gone", "id": 5 })).unwrap();
        assert_eq!(gone, UnitUpdate::Gone { id: 5 });

        assert!(serde_json::from_value::<UnitUpdate>(json!({ "type": "gone" })).is_err());
    }
}
