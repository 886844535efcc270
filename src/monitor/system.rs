/*!
 * Host resource sampling
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use sysinfo::{Disks, System};
use tracing::warn;

/// Host load at one instant, all values in percent (0 - 100)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Fullest mounted disk
    pub disk_usage: f32,
}

/// Source of host load figures
pub trait HostSampler: Send + Sync {
    /// Latest reading. Must not block; it is called from async code.
    fn sample(&self) -> HostSample;

    /// Take a new reading. May block on OS calls, so async callers go
    /// through [`refresh_host`].
    fn refresh(&self) {}
}

/// Run [`HostSampler::refresh`] on the blocking pool
pub async fn refresh_host(sampler: &Arc<dyn HostSampler>) {
    let sampler = Arc::clone(sampler);
    if let Err(e) = tokio::task::spawn_blocking(move || sampler.refresh()).await {
        warn!(error = %e, "host sampling task failed");
    }
}

/// Samples the local machine through `sysinfo`
///
/// [`sample`](HostSampler::sample) returns the reading cached by the last
/// [`refresh`](HostSampler::refresh). CPU usage is computed between
/// consecutive refreshes, so the reading taken at construction shows the
/// CPU as idle.
pub struct SysinfoSampler {
    system: Mutex<System>,
    latest: Mutex<HostSample>,
}

impl SysinfoSampler {
    /// Takes one blocking reading; construct it at startup
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let sampler = Self {
            system: Mutex::new(system),
            latest: Mutex::new(HostSample::default()),
        };
        sampler.refresh();
        sampler
    }

    fn read(&self) -> HostSample {
        let (cpu_percent, memory_percent) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();

            let total = system.total_memory();
            let memory_percent = if total == 0 {
                0.0
            } else {
                (system.used_memory() as f64 / total as f64 * 100.0) as f32
            };
            (system.global_cpu_usage(), memory_percent)
        };

        let disk_usage = {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|disk| disk.total_space() > 0)
                .map(|disk| {
                    let used = disk.total_space().saturating_sub(disk.available_space());
                    (used as f64 / disk.total_space() as f64 * 100.0) as f32
                })
                .fold(0.0f32, f32::max)
        };

        HostSample {
            cpu_percent,
            memory_percent,
            disk_usage,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&self) -> HostSample {
        *self.latest.lock()
    }

    fn refresh(&self) {
        let reading = self.read();
        *self.latest.lock() = reading;
    }
}

/// Sampler that reports whatever it was last told; for tests and for hosts
/// where load is measured elsewhere
#[derive(Debug, Default)]
pub struct StaticSampler {
    current: Mutex<HostSample>,
}

impl StaticSampler {
    pub fn new(sample: HostSample) -> Self {
        Self {
            current: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: HostSample) {
        *self.current.lock() = sample;
    }
}

impl HostSampler for StaticSampler {
    fn sample(&self) -> HostSample {
        *self.current.lock()
    }
}
