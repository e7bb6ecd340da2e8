//! Collector registry and factory
//!
//! This module provides:
//! - Central registration of all collector variants
//! - A factory function building a collector for one cohort
//!
//! All variant-specific logic lives in the dedicated collector modules.
//! The orchestrator interacts exclusively through the `Collector`
//! trait.

pub mod ballistics;
pub mod collector;
pub mod events;
pub mod player_details;
pub mod stream;
pub mod units;

use std::sync::Arc;

use crate::metrics::MetricsSink;

pub use collector::{Collector, CollectorConfig, CollectorKind, FactoryError};

type Constructor = fn(Arc<CollectorConfig>, Arc<dyn MetricsSink>) -> Box<dyn Collector>;

/// Constructor table, keyed by variant.
static REGISTRY: [(CollectorKind, Constructor); 4] = [
    (CollectorKind::Ballistics, ballistics::BallisticsCollector::boxed),
    (CollectorKind::Events, events::EventCollector::boxed),
    (CollectorKind::PlayerDetails, player_details::PlayerDetailsCollector::boxed),
    (CollectorKind::Units, units::UnitCollector::boxed),
];

/// Builds the collector of variant `kind` bound to `config`.
///
/// Fails only for a variant missing from the registry, which is a
/// defect rather than something a running bridge can recover from.
pub fn create(
    kind: CollectorKind,
    config: Arc<CollectorConfig>,
    sink: Arc<dyn MetricsSink>,
) -> Result<Box<dyn Collector>, FactoryError> {
    let (_, construct) = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == kind)
        .ok_or(FactoryError::UnknownCollector(kind))?;

    Ok(construct(config, sink))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::CollectorConfig;
    use crate::rpc::mock::MockEndpoint;

    /// Cohort of server "Alpha" in session 100.
    pub fn alpha_config(endpoint: Arc<MockEndpoint>, scope: CancellationToken) -> Arc<CollectorConfig> {
        Arc::new(CollectorConfig {
            server_short_name: Arc::from("Alpha"),
            session_id: 100,
            endpoint,
            scope,
        })
    }
}
