//! Consensus timing and sizing parameters.

use std::time::Duration;

/// Configuration for the consensus coordinator.
///
/// The election timeout window must dominate the heartbeat interval by a
/// comfortable margin (at least 5x) or followers will start spurious
/// elections between ticks.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by the leader (default: 500ms).
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 3s).
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 6s).
    pub election_timeout_max: Duration,
    /// Applied entries past the last snapshot before an automatic snapshot
    /// is taken (default: 10 000). Zero disables automatic snapshots.
    pub snapshot_threshold: u64,
    /// Maximum log entries shipped in a single AppendEntries call.
    pub max_batch_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_min: Duration::from_secs(3),
            election_timeout_max: Duration::from_secs(6),
            snapshot_threshold: 10_000,
            max_batch_entries: 500,
        }
    }
}

impl RaftConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Set to 0 to disable automatic snapshots.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_max_batch_entries(mut self, cap: usize) -> Self {
        self.max_batch_entries = cap;
        self
    }

    /// Draw a fresh random election timeout from the configured window.
    /// Called once per coordinator loop iteration so a split vote gets a
    /// new draw on the next round.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_timeout_within_window() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(300), Duration::from_millis(500));
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(300));
            assert!(t <= Duration::from_millis(500));
        }
    }
}
