//! Health Tracker. Pure observability: a label the catalog
//! and status endpoints can surface, with no side effect on dispatch
//! decisions (those are the circuit breaker's job).

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Unknown,
}

#[derive(Default)]
pub struct HealthTracker {
    statuses: DashMap<String, HealthStatus>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_healthy(&self, server_id: &str) {
        self.statuses.insert(server_id.to_string(), HealthStatus::Healthy);
    }

    pub fn mark_unhealthy(&self, server_id: &str, reason: &str) {
        self.statuses.insert(server_id.to_string(), HealthStatus::Unhealthy { reason: reason.to_string() });
    }

    pub fn status(&self, server_id: &str) -> HealthStatus {
        self.statuses.get(server_id).map(|entry| entry.clone()).unwrap_or(HealthStatus::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_until_first_observation() {
        let tracker = HealthTracker::new();
        assert!(matches!(tracker.status("s1"), HealthStatus::Unknown));
    }

    #[test]
    fn records_the_latest_observation() {
        let tracker = HealthTracker::new();
        tracker.mark_healthy("s1");
        assert!(matches!(tracker.status("s1"), HealthStatus::Healthy));
        tracker.mark_unhealthy("s1", "timeout");
        assert!(matches!(tracker.status("s1"), HealthStatus::Unhealthy { .. }));
    }
}
