//! The `Collector` contract, the per-cohort configuration every
//! collector is built from, and the shared tag keys.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{error, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::metrics::{METRICS, TagSet};
use crate::rpc::{CallOutcome, RpcEndpoint};
use crate::schema::SessionId;

/// Tag keys shared by every collector.
pub mod tag {
    pub const SERVER_SHORT_NAME: &str = "server_short_name";
    pub const SESSION_ID: &str = "session_id";

    pub const CATEGORY: &str = "category";
    pub const COALITION: &str = "coalition";
    pub const IS_PLAYER: &str = "is_player";
    pub const UNIT_TYPE: &str = "unit_type";
    pub const STATIC_TYPE: &str = "static_type";

    pub const SHOOTER_TYPE: &str = "shooter_type";
    pub const SHOOTER_COALITION: &str = "shooter_coalition";
    pub const SHOOTER_IS_PLAYER: &str = "shooter_is_player";
    pub const SHOOTER_CATEGORY: &str = "shooter_category";

    pub const TARGET_TYPE: &str = "target_type";
    pub const TARGET_COALITION: &str = "target_coalition";
    pub const TARGET_IS_PLAYER: &str = "target_is_player";
    pub const TARGET_CATEGORY: &str = "target_category";

    pub const WEAPON: &str = "weapon";
    pub const AIRBASE: &str = "airbase";
    pub const AIRBASE_CATEGORY: &str = "airbase_category";
}

/// The closed set of collector variants.
///
/// IMPORTANT:
/// - Adding a variant requires a matching entry in the registry in
///   `collectors::REGISTRY`, otherwise every cohort fails to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    Ballistics,
    Events,
    PlayerDetails,
    Units,
}

impl CollectorKind {
    /// Every variant, in cohort start order.
    pub const ALL: [CollectorKind; 4] = [
        CollectorKind::Ballistics,
        CollectorKind::Events,
        CollectorKind::PlayerDetails,
        CollectorKind::Units,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CollectorKind::Ballistics => "ballistics",
            CollectorKind::Events => "events",
            CollectorKind::PlayerDetails => "player_details",
            CollectorKind::Units => "units",
        }
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    /// A variant without a registry entry. A build defect, never a
    /// runtime condition.
    #[error("unrecognised collector type '{0}'")]
    UnknownCollector(CollectorKind),
}

/// Everything a collector needs for one cohort.
///
/// Built once when the cohort starts and shared read-only by all of
/// its collectors, so they all see the same session id for their
/// whole lifetime.
pub struct CollectorConfig {
    pub server_short_name: Arc<str>,
    pub session_id: SessionId,
    pub endpoint: Arc<dyn RpcEndpoint>,
    /// Cancelled when the session is lost or the process shuts down.
    pub scope: CancellationToken,
}

impl CollectorConfig {
    /// Tags every measurement of this cohort starts with.
    pub fn base_tags(&self) -> TagSet {
        TagSet::new()
            .with(tag::SERVER_SHORT_NAME, &*self.server_short_name)
            .with(tag::SESSION_ID, self.session_id)
    }
}

/// A task turning live server state into measurements for one cohort.
///
/// CONTRACT:
/// - `run` returns once `config.scope` is cancelled, and not before
///   for the long-running variants
/// - Errors are handled inside the collector; nothing propagates out
#[async_trait::async_trait]
pub trait Collector: Send {
    fn kind(&self) -> CollectorKind;

    async fn run(self: Box<Self>);
}

/// Unwraps the outcome of a per-tick unary call.
///
/// Timeouts and failures are logged and yield `None`: the tick simply
/// produces no measurement and the next one tries again.
pub fn settle<T>(label: &str, call: &str, outcome: CallOutcome<T>) -> Option<T> {
    match outcome {
        CallOutcome::Success(value) => Some(value),
        CallOutcome::Timeout => {
            METRICS.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!("[{label}] {call} timed out");
            None
        }
        CallOutcome::Failed(e) => {
            METRICS.rpc_errors.fetch_add(1, Ordering::Relaxed);
            error!("[{label}] {call} failed: {e}");
            None
        }
    }
}
