use std::time::Duration;

use colander_core::Priority;

use crate::quota::DEFAULT_USAGE_IDLE_EXPIRY;

/// Worker-process configuration for the task execution core.
///
/// Controls task time limits, concurrency, lane sizing and background sweeps.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Soft time limit for a task that does not set its own.
    pub default_task_timeout: Duration,
    /// Maximum number of concurrently executing tasks before load shedding.
    pub max_concurrent_tasks: u32,
    /// Added to every non-zero quota wait.
    pub wait_adjust: Duration,
    /// Usage records untouched for this long are dropped.
    pub usage_idle_expiry: Duration,
    /// How long finished task handles stay queryable.
    pub finished_task_retention: Duration,
    /// Interval between sweeper runs.
    pub sweep_interval: Duration,
    pub lanes: LaneConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_task_timeout: Duration::from_secs(30),
            max_concurrent_tasks: 1000,
            wait_adjust: Duration::ZERO,
            usage_idle_expiry: DEFAULT_USAGE_IDLE_EXPIRY,
            finished_task_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            lanes: LaneConfig::default(),
        }
    }
}

/// Worker pool sizes for the three priority lanes.
///
/// A stage that submits follow-up work and waits for it occupies a worker
/// of its lane while waiting, so each lane needs at least two workers for
/// such nested submissions to make progress.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub low_workers: usize,
    pub medium_workers: usize,
    pub high_workers: usize,
    /// Bounded queue length per lane.
    pub queue_capacity: usize,
}

impl LaneConfig {
    /// Worker count for `priority`'s lane, never below one.
    #[must_use]
    pub fn workers(&self, priority: Priority) -> usize {
        let n = match priority {
            Priority::Low => self.low_workers,
            Priority::Medium => self.medium_workers,
            Priority::High => self.high_workers,
        };
        n.max(1)
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            low_workers: 4,
            medium_workers: 4,
            high_workers: 4,
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.default_task_timeout, Duration::from_secs(30));
        assert_eq!(config.usage_idle_expiry, Duration::from_secs(200));
        assert_eq!(config.lanes.workers(Priority::High), 4);
    }

    #[test]
    fn lane_workers_never_zero() {
        let lanes = LaneConfig {
            low_workers: 0,
            ..LaneConfig::default()
        };
        assert_eq!(lanes.workers(Priority::Low), 1);
    }
}
