use std::time::Duration;

/// Tunables for [`crate::JobGroupManager`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between polls when a backend reports nothing new.
    pub poll_interval: Duration,
    /// How long a terminal group stays queryable after it finished.
    pub retention: Duration,
    /// Terminal groups are evicted, oldest first, beyond this many groups.
    pub max_groups: usize,
    /// Per-group event buffer; subscribers further behind are dropped.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            retention: Duration::from_secs(3600),
            max_groups: 256,
            event_capacity: renderfarm_events::broadcaster::DEFAULT_CAPACITY,
        }
    }
}
