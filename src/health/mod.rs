//! Health aggregation: pulls a point-in-time snapshot from the queue,
//! the adapter registry, and the tier detector, and classifies the
//! agent's overall condition for the control API and the heartbeat.

pub mod heartbeat;
pub mod tier;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::AdapterStatus;
use crate::queue::Queue;

pub use tier::{ResourceUsage, Tier, TierDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub parked: usize,
    pub max_size: usize,
    pub last_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub level: HealthLevel,
    pub tier: Tier,
    pub queue: QueueStats,
    pub adapters: Vec<AdapterStatus>,
    pub dropped_events: u64,
    pub paired: bool,
    pub generated_at: DateTime<Utc>,
}

/// Anything that can report adapter status — implemented by
/// `AdapterRegistry`; kept as a trait so health can be unit tested
/// without spinning up real adapters.
#[async_trait::async_trait]
pub trait AdapterStatusSource: Send + Sync {
    async fn list(&self) -> Vec<AdapterStatus>;

    /// Raw hardware events dropped because an adapter's delivery sink
    /// was at capacity. Defaults to zero for sources that don't track it.
    fn dropped_event_count(&self) -> u64 {
        0
    }
}

#[async_trait::async_trait]
impl AdapterStatusSource for crate::adapter::registry::AdapterRegistry {
    async fn list(&self) -> Vec<AdapterStatus> {
        crate::adapter::registry::AdapterRegistry::list(self).await
    }

    fn dropped_event_count(&self) -> u64 {
        crate::adapter::registry::AdapterRegistry::dropped_event_count(self)
    }
}

pub struct Health {
    queue: Arc<Queue>,
    adapters: Arc<dyn AdapterStatusSource>,
    tier_detector: Arc<TierDetector>,
    paired: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl Health {
    pub fn new(
        queue: Arc<Queue>,
        adapters: Arc<dyn AdapterStatusSource>,
        tier_detector: Arc<TierDetector>,
        paired: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        Self {
            queue,
            adapters,
            tier_detector,
            paired,
        }
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        self.tier_detector.resource_usage()
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let tier = self.tier_detector.detect();
        let pending = self.queue.count_pending().unwrap_or(0);
        let parked = self.queue.count_parked().unwrap_or(0);
        let max_size = self.queue.max_size();
        let last_sent_at = self.queue.last_sent_at().ok().flatten();
        let adapters = self.adapters.list().await;
        let paired = (self.paired)();
        let resources = self.tier_detector.resource_usage();

        let level = classify(pending, max_size, parked, &adapters, paired, resources);

        let dropped_events = self.adapters.dropped_event_count();

        HealthSnapshot {
            level,
            tier,
            queue: QueueStats {
                pending,
                parked,
                max_size,
                last_sent_at,
            },
            adapters,
            dropped_events,
            paired,
            generated_at: Utc::now(),
        }
    }
}

fn classify(
    pending: usize,
    max_size: usize,
    parked: usize,
    adapters: &[AdapterStatus],
    paired: bool,
    resources: ResourceUsage,
) -> HealthLevel {
    use crate::model::AdapterState;

    if !paired {
        return HealthLevel::Unhealthy;
    }

    let queue_fraction = pending as f64 / max_size.max(1) as f64;
    if queue_fraction >= 0.95 {
        return HealthLevel::Unhealthy;
    }

    if resources.cpu >= 0.95 || resources.memory >= 0.95 {
        return HealthLevel::Unhealthy;
    }

    let any_adapter_errored = adapters
        .iter()
        .any(|a| a.state == AdapterState::Error);
    let all_adapters_down = !adapters.is_empty()
        && adapters
            .iter()
            .all(|a| matches!(a.state, AdapterState::Error | AdapterState::Disabled));

    if all_adapters_down {
        return HealthLevel::Unhealthy;
    }

    if queue_fraction >= 0.5
        || any_adapter_errored
        || parked > 0
        || resources.cpu >= 0.8
        || resources.memory >= 0.8
    {
        return HealthLevel::Degraded;
    }

    HealthLevel::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AdapterState;

    fn status(state: AdapterState) -> AdapterStatus {
        AdapterStatus {
            name: "front-door".to_string(),
            state,
            last_event_at: None,
            last_error_message: None,
            updated_at: Utc::now(),
        }
    }

    const IDLE: ResourceUsage = ResourceUsage { cpu: 0.1, memory: 0.1 };

    #[test]
    fn unpaired_is_always_unhealthy() {
        let level = classify(0, 100, 0, &[], false, IDLE);
        assert_eq!(level, HealthLevel::Unhealthy);
    }

    #[test]
    fn near_full_queue_is_unhealthy() {
        let level = classify(96, 100, 0, &[status(AdapterState::Active)], true, IDLE);
        assert_eq!(level, HealthLevel::Unhealthy);
    }

    #[test]
    fn all_adapters_down_is_unhealthy() {
        let level = classify(10, 100, 0, &[status(AdapterState::Error)], true, IDLE);
        assert_eq!(level, HealthLevel::Unhealthy);
    }

    #[test]
    fn busy_queue_is_degraded() {
        let level = classify(55, 100, 0, &[status(AdapterState::Active)], true, IDLE);
        assert_eq!(level, HealthLevel::Degraded);
    }

    #[test]
    fn parked_events_are_degraded() {
        let level = classify(10, 100, 1, &[status(AdapterState::Active)], true, IDLE);
        assert_eq!(level, HealthLevel::Degraded);
    }

    #[test]
    fn nominal_state_is_healthy() {
        let level = classify(10, 100, 0, &[status(AdapterState::Active)], true, IDLE);
        assert_eq!(level, HealthLevel::Healthy);
    }

    #[test]
    fn high_cpu_usage_is_degraded() {
        let resources = ResourceUsage { cpu: 0.85, memory: 0.1 };
        let level = classify(10, 100, 0, &[status(AdapterState::Active)], true, resources);
        assert_eq!(level, HealthLevel::Degraded);
    }

    #[test]
    fn near_total_memory_exhaustion_is_unhealthy() {
        let resources = ResourceUsage { cpu: 0.1, memory: 0.97 };
        let level = classify(10, 100, 0, &[status(AdapterState::Active)], true, resources);
        assert_eq!(level, HealthLevel::Unhealthy);
    }
}
