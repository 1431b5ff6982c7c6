use std::time::Duration;

use crate::common::error::ConfigError;

/// How a processor proves liveness once it has joined a group.
///
/// Neighbor surveillance is a third policy in Cristian's paper; it is left
/// out until it has defined semantics.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum HeartbeatPolicy {
    /// Every member broadcasts present(V, members) each period and checks
    /// that every other member did the same.
    #[default]
    PeriodicBroadcast,
    /// A token circulates the ring of sorted member ids each period.
    AttendanceList,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProcessorConfig {
    /// Upper bound ε on the difference between any two correct clocks.
    pub max_clock_sync_error: Duration,
    /// Interval between heartbeats.
    pub check_in_period: Duration,
    pub policy: HeartbeatPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            max_clock_sync_error: Duration::from_secs(1),
            check_in_period: Duration::from_secs(5),
            policy: HeartbeatPolicy::PeriodicBroadcast,
        }
    }
}

impl ProcessorConfig {
    pub fn new(max_clock_sync_error: Duration, check_in_period: Duration, policy: HeartbeatPolicy) -> Self {
        ProcessorConfig {
            max_clock_sync_error,
            check_in_period,
            policy,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_in_period.is_zero() {
            return Err(ConfigError::ZeroCheckInPeriod);
        }
        Ok(())
    }

    /// Whether a heartbeat round can still be checked after the next one
    /// has started, i.e. P <= δ + ε.
    pub fn overlaps_rounds(&self, broadcast_delay_bound: Duration) -> bool {
        self.check_in_period <= broadcast_delay_bound.saturating_add(self.max_clock_sync_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ProcessorConfig::default().validate().is_ok());

        let config = ProcessorConfig::new(Duration::ZERO, Duration::ZERO, HeartbeatPolicy::AttendanceList);
        assert_eq!(config.validate(), Err(ConfigError::ZeroCheckInPeriod));
    }

    #[test]
    fn test_overlapping_rounds() {
        let config = ProcessorConfig::new(Duration::ZERO, Duration::from_secs(3), HeartbeatPolicy::PeriodicBroadcast);
        assert!(config.overlaps_rounds(Duration::from_secs(5)));
        assert!(config.overlaps_rounds(Duration::from_secs(3)));
        assert!(!config.overlaps_rounds(Duration::from_secs(1)));

        let skewed = ProcessorConfig::new(Duration::from_secs(1), Duration::from_secs(3), HeartbeatPolicy::AttendanceList);
        assert!(skewed.overlaps_rounds(Duration::from_secs(2)));
    }
}
