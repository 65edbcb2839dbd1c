//! Per-`server_id` circuit breaker. Shared across tenants on
//! purpose: the upstream endpoint is the same regardless of which tenant's
//! request triggered the failure.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Entry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for Entry {
    fn default() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    entries: DashMap<String, Entry>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { threshold, cooldown, entries: DashMap::new() }
    }

    /// Returns `true` when a call may proceed, lazily transitioning
    /// `open -> half_open` once the cooldown has elapsed.
    pub fn allow(&self, server_id: &str) -> bool {
        let mut entry = self.entries.entry(server_id.to_string()).or_default();
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let Some(opened_at) = entry.opened_at else {
                    return true;
                };
                if opened_at.elapsed() >= self.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, server_id: &str) {
        let mut entry = self.entries.entry(server_id.to_string()).or_default();
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
    }

    pub fn record_failure(&self, server_id: &str) {
        let mut entry = self.entries.entry(server_id.to_string()).or_default();
        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, server_id: &str) -> CircuitState {
        self.entries.get(server_id).map(|e| e.state).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failure_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        for _ in 0..2 {
            assert!(breaker.allow("s1"));
            breaker.record_failure("s1");
        }
        assert_eq!(breaker.state("s1"), CircuitState::Closed);
        assert!(breaker.allow("s1"));
        breaker.record_failure("s1");
        assert_eq!(breaker.state("s1"), CircuitState::Open);
        assert!(!breaker.allow("s1"));
    }

    #[test]
    fn half_open_closes_on_success_and_reopens_on_failure() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure("s1");
        assert_eq!(breaker.state("s1"), CircuitState::Open);

        assert!(breaker.allow("s1"));
        assert_eq!(breaker.state("s1"), CircuitState::HalfOpen);

        breaker.record_success("s1");
        assert_eq!(breaker.state("s1"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_the_circuit() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure("s1");
        assert!(breaker.allow("s1"));
        breaker.record_failure("s1");
        assert_eq!(breaker.state("s1"), CircuitState::Open);
    }

    #[test]
    fn distinct_servers_have_independent_state() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure("s1");
        assert_eq!(breaker.state("s1"), CircuitState::Open);
        assert_eq!(breaker.state("s2"), CircuitState::Closed);
    }
}
