//! Health assessment
//!
//! A small state machine fed one [`HealthInputs`] per periodic sample via
//! [`HealthAssessor::observe`]. Everything but queue saturation is judged on
//! the current inputs alone; saturation only counts once it has persisted for
//! several consecutive samples, so a single burst does not flip the service
//! to degraded. [`HealthAssessor::evaluate`] answers on-demand queries
//! against the recorded streak without advancing it.
//!
//! # Example
//!
//! ```
//! use dispatch_core::config::MonitorSettings;
//! use dispatch_core::monitor::{Advisory, HealthAssessor, HealthInputs, HealthStatus, HostSample};
//!
//! let mut assessor = HealthAssessor::new(&MonitorSettings::default());
//! let report = assessor.observe(&HealthInputs {
//!     host: HostSample { cpu_percent: 97.0, memory_percent: 40.0, disk_usage: 50.0 },
//!     open_breakers: vec![],
//!     queue_saturation: 0.1,
//! });
//!
//! assert_eq!(report.status, HealthStatus::Degraded);
//! assert!(matches!(report.reasons[0], Advisory::CpuHigh { .. }));
//! ```

use super::system::HostSample;
use crate::config::MonitorSettings;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Operational,
    Degraded,
}

/// One reason for a degraded status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    BreakerOpen { target: String },
    CpuHigh { percent: f32, threshold: f32 },
    MemoryHigh { percent: f32, threshold: f32 },
    DiskHigh { percent: f32, threshold: f32 },
    /// Worker queue above the saturation ratio for `samples` checks in a row
    QueueSaturated { ratio: f64, samples: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<Advisory>,
}

impl HealthReport {
    pub fn is_operational(&self) -> bool {
        self.status == HealthStatus::Operational
    }
}

/// What a single health check looks at
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub host: HostSample,
    pub open_breakers: Vec<String>,
    /// Worker queue fill ratio (0.0 - 1.0)
    pub queue_saturation: f64,
}

#[derive(Debug, Clone)]
pub struct HealthAssessor {
    cpu_threshold: f32,
    memory_threshold: f32,
    disk_threshold: f32,
    saturation_ratio: f64,
    saturation_samples: u32,
    /// Consecutive observations with the queue at or above the ratio
    saturated_streak: u32,
    check_count: u64,
    degraded_count: u64,
}

impl HealthAssessor {
    pub fn new(settings: &MonitorSettings) -> Self {
        Self {
            cpu_threshold: settings.cpu_threshold,
            memory_threshold: settings.memory_threshold,
            disk_threshold: settings.disk_threshold,
            saturation_ratio: settings.saturation_ratio,
            saturation_samples: settings.saturation_samples.max(1),
            saturated_streak: 0,
            check_count: 0,
            degraded_count: 0,
        }
    }

    /// Record one periodic sample and assess it
    pub fn observe(&mut self, inputs: &HealthInputs) -> HealthReport {
        self.check_count += 1;
        if inputs.queue_saturation >= self.saturation_ratio {
            self.saturated_streak = self.saturated_streak.saturating_add(1);
        } else {
            self.saturated_streak = 0;
        }

        let report = self.evaluate(inputs);
        if report.status == HealthStatus::Degraded {
            self.degraded_count += 1;
        }
        report
    }

    /// Assess `inputs` against the streak recorded so far, leaving it as is
    pub fn evaluate(&self, inputs: &HealthInputs) -> HealthReport {
        let mut reasons: Vec<Advisory> = inputs
            .open_breakers
            .iter()
            .map(|target| Advisory::BreakerOpen {
                target: target.clone(),
            })
            .collect();

        let host = &inputs.host;
        if host.cpu_percent > self.cpu_threshold {
            reasons.push(Advisory::CpuHigh {
                percent: host.cpu_percent,
                threshold: self.cpu_threshold,
            });
        }
        if host.memory_percent > self.memory_threshold {
            reasons.push(Advisory::MemoryHigh {
                percent: host.memory_percent,
                threshold: self.memory_threshold,
            });
        }
        if host.disk_usage > self.disk_threshold {
            reasons.push(Advisory::DiskHigh {
                percent: host.disk_usage,
                threshold: self.disk_threshold,
            });
        }

        if inputs.queue_saturation >= self.saturation_ratio
            && self.saturated_streak >= self.saturation_samples
        {
            reasons.push(Advisory::QueueSaturated {
                ratio: inputs.queue_saturation,
                samples: self.saturated_streak,
            });
        }

        let status = if reasons.is_empty() {
            HealthStatus::Operational
        } else {
            HealthStatus::Degraded
        };
        HealthReport { status, reasons }
    }

    pub fn check_count(&self) -> u64 {
        self.check_count
    }

    pub fn degraded_count(&self) -> u64 {
        self.degraded_count
    }
}
