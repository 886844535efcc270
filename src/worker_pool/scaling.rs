//! Worker count decisions
//!
//! Kept free of timers and locks so the policy can be exercised directly;
//! the pool's scaler task feeds it a fresh [`ScaleInput`] every tick.

use crate::config::{secs, WorkerSettings};
use crate::monitor::HostSample;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub step: usize,
    pub high_water_mark: Option<usize>,
    pub idle_grace: Duration,
    pub interval: Duration,
    pub cpu_ceiling: f32,
    pub memory_ceiling: f32,
}

impl ScalingPolicy {
    pub(crate) fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            min_workers: settings.min_workers.max(1),
            max_workers: settings.max_workers.max(settings.min_workers.max(1)),
            step: settings.scale_step.max(1),
            high_water_mark: settings.high_water_mark,
            idle_grace: secs(settings.idle_grace_secs),
            interval: secs(settings.scale_interval_secs).max(Duration::from_millis(10)),
            cpu_ceiling: settings.cpu_ceiling,
            memory_ceiling: settings.memory_ceiling,
        }
    }

    /// Queue depth above which the pool wants more workers
    pub(crate) fn high_water_mark(&self, workers: usize) -> usize {
        self.high_water_mark.unwrap_or(workers * 2)
    }

    /// Whether the backlog calls for more workers, host permitting
    pub(crate) fn may_grow(&self, input: &ScaleInput) -> bool {
        input.queued > self.high_water_mark(input.workers) && input.workers < self.max_workers
    }

    /// Host sampling is deferred until growth is actually on the table
    pub(crate) fn decide<S>(&self, input: ScaleInput, host: S) -> ScaleDecision
    where
        S: FnOnce() -> HostSample,
    {
        if self.may_grow(&input) {
            let sample = host();
            if sample.cpu_percent < self.cpu_ceiling && sample.memory_percent < self.memory_ceiling {
                let grow = self.step.min(self.max_workers - input.workers);
                return ScaleDecision::Grow(grow);
            }
            return ScaleDecision::Hold;
        }

        if input.queued == 0
            && input.active == 0
            && input.idle_for >= self.idle_grace
            && input.workers > self.min_workers
        {
            return ScaleDecision::Shrink(1);
        }

        ScaleDecision::Hold
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScaleInput {
    pub queued: usize,
    pub active: usize,
    pub workers: usize,
    /// Time since the pool last had anything queued or running
    pub idle_for: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleDecision {
    Grow(usize),
    Shrink(usize),
    Hold,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalingPolicy {
        ScalingPolicy::from_settings(&WorkerSettings {
            min_workers: 2,
            max_workers: 8,
            scale_step: 2,
            idle_grace_secs: 30.0,
            cpu_ceiling: 80.0,
            memory_ceiling: 85.0,
            ..Default::default()
        })
    }

    fn calm() -> HostSample {
        HostSample {
            cpu_percent: 20.0,
            memory_percent: 30.0,
            disk_usage: 50.0,
        }
    }

    fn input(queued: usize, active: usize, workers: usize, idle_secs: u64) -> ScaleInput {
        ScaleInput {
            queued,
            active,
            workers,
            idle_for: Duration::from_secs(idle_secs),
        }
    }

    #[test]
    fn test_grows_past_high_water_mark() {
        let policy = policy();
        // 2 workers -> mark of 4
        assert_eq!(policy.decide(input(4, 2, 2, 0), calm), ScaleDecision::Hold);
        assert_eq!(policy.decide(input(5, 2, 2, 0), calm), ScaleDecision::Grow(2));
    }

    #[test]
    fn test_growth_is_capped_at_max() {
        let policy = policy();
        assert_eq!(policy.decide(input(100, 7, 7, 0), calm), ScaleDecision::Grow(1));
        assert_eq!(policy.decide(input(100, 8, 8, 0), calm), ScaleDecision::Hold);
    }

    #[test]
    fn test_busy_host_blocks_growth() {
        let policy = policy();
        let hot = || HostSample {
            cpu_percent: 95.0,
            ..calm()
        };
        assert_eq!(policy.decide(input(50, 2, 2, 0), hot), ScaleDecision::Hold);

        let swapping = || HostSample {
            memory_percent: 90.0,
            ..calm()
        };
        assert_eq!(policy.decide(input(50, 2, 2, 0), swapping), ScaleDecision::Hold);
    }

    #[test]
    fn test_host_not_sampled_without_backlog() {
        let policy = policy();
        let decision = policy.decide(input(0, 1, 4, 0), || panic!("sampled without need"));
        assert_eq!(decision, ScaleDecision::Hold);

        // The tick refreshes the host reading on exactly these inputs
        assert!(!policy.may_grow(&input(0, 1, 4, 0)));
        assert!(!policy.may_grow(&input(100, 8, 8, 0)));
        assert!(policy.may_grow(&input(5, 2, 2, 0)));
    }

    #[test]
    fn test_shrinks_one_at_a_time_after_grace() {
        let policy = policy();
        assert_eq!(policy.decide(input(0, 0, 6, 29), calm), ScaleDecision::Hold);
        assert_eq!(policy.decide(input(0, 0, 6, 30), calm), ScaleDecision::Shrink(1));
        assert_eq!(policy.decide(input(0, 1, 6, 60), calm), ScaleDecision::Hold);
        assert_eq!(policy.decide(input(0, 0, 2, 60), calm), ScaleDecision::Hold);
    }

    #[test]
    fn test_explicit_high_water_mark() {
        let policy = ScalingPolicy::from_settings(&WorkerSettings {
            min_workers: 1,
            max_workers: 4,
            high_water_mark: Some(10),
            ..Default::default()
        });
        assert_eq!(policy.decide(input(10, 1, 1, 0), calm), ScaleDecision::Hold);
        assert_eq!(policy.decide(input(11, 1, 1, 0), calm), ScaleDecision::Grow(2));
    }
}
