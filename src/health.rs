//! Health monitor: staleness checks and bounded-retry restarts for the
//! long-running sensor sources. After the restart cap a source is marked
//! degraded for good and the session carries on without it.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::retry::RetryPolicy;
use crate::sensors::SensorSource;

struct Entry {
    source: Arc<dyn SensorSource>,
    consecutive_restarts: u32,
    degraded: bool,
}

pub struct HealthMonitor {
    policy: RetryPolicy,
    entries: Vec<Entry>,
}

impl HealthMonitor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, source: Arc<dyn SensorSource>) {
        self.entries.push(Entry {
            source,
            consecutive_restarts: 0,
            degraded: false,
        });
    }

    /// One cadence-gated pass over every registered source. Healthy sources
    /// reset their restart counter; stale or dead ones get a restart until
    /// the cap, after which they are degraded terminally.
    pub async fn check_all(&mut self) {
        for entry in &mut self.entries {
            if entry.degraded {
                continue;
            }
            if entry.source.is_healthy() {
                if entry.consecutive_restarts > 0 {
                    info!(source = entry.source.name(), "source producing data again");
                    entry.consecutive_restarts = 0;
                }
                continue;
            }
            if self.policy.is_exhausted(entry.consecutive_restarts) {
                entry.degraded = true;
                error!(
                    source = entry.source.name(),
                    restarts = entry.consecutive_restarts,
                    "restart attempts exhausted, source permanently degraded"
                );
                continue;
            }
            entry.consecutive_restarts += 1;
            warn!(
                source = entry.source.name(),
                attempt = entry.consecutive_restarts,
                max = self.policy.max_attempts,
                "source unhealthy, restarting"
            );
            match entry.source.restart().await {
                Ok(()) => info!(source = entry.source.name(), "restart issued"),
                Err(e) => warn!(source = entry.source.name(), error = %e, "restart failed"),
            }
        }
    }

    pub fn is_degraded(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.source.name() == name && e.degraded)
    }

    pub fn any_degraded(&self) -> bool {
        self.entries.iter().any(|e| e.degraded)
    }

    pub fn restart_count(&self, name: &str) -> u32 {
        self.entries
            .iter()
            .find(|e| e.source.name() == name)
            .map(|e| e.consecutive_restarts)
            .unwrap_or(0)
    }
}
