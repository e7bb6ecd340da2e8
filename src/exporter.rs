//! Console exporter
//!
//! Drives the export tick. Each tick collects the registry and, when
//! console output is on, prints the Prometheus text exposition of the
//! snapshot followed by the runtime summary line.

use std::time::Duration;

use log::{debug, error};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::metrics::{METRICS, Registry, Snapshot};

/// Periodically pulls every series from the registry and prints it.
///
/// Each tick invokes all registered gauges, so this is also what drives
/// the per-tick RPC calls of the pull-style collectors.
pub struct ConsoleExporter {
    registry: Registry,
    period: Duration,
    console: bool,
}

/// Lines printed for one export tick.
pub fn render(snapshot: &Snapshot) -> Vec<String> {
    let mut lines = vec![format!("[EXPORT] {}", snapshot.taken_at.to_rfc3339())];
    match snapshot.encode() {
        Ok(text) => lines.extend(
            text.lines()
                .filter(|line| !line.is_empty())
                .map(|line| format!("[EXPORT]   {line}")),
        ),
        Err(e) => error!("Failed to encode snapshot: {e}"),
    }
    lines
}

impl ConsoleExporter {
    pub fn new(registry: Registry, period: Duration, console: bool) -> Self {
        Self { registry, period, console }
    }

    pub async fn export_once(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.console {
            lines = render(&self.registry.collect().await);
        }
        lines.push(METRICS.summary_line());
        lines
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing is registered yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for line in self.export_once().await {
                        println!("{line}");
                    }
                }
            }
        }

        debug!("Exporter stopped");
    }
}
