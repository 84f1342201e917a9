use tracing::warn;

use crate::errors::ScrapeError;

/// Host-level usage percentages for one scrape.
///
/// Recomputed in full on every scrape and never retained between scrapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// One reading of a container's cumulative CPU counters.
///
/// The counters are monotonically non-decreasing while the container runs,
/// so two chronologically ordered readings are needed to derive a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerCpuReading {
    /// Total CPU time consumed by the container, in nanoseconds.
    pub total_usage_ns: u64,
    /// Total CPU time available on the host, in nanoseconds.
    pub system_usage_ns: u64,
    /// Number of cores visible to the container, at least 1.
    pub online_cpus: u32,
}

/// Instantaneous memory usage of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerMemoryReading {
    pub usage_bytes: u64,
    pub limit_bytes: u64,
}

/// Raw per-container snapshot produced by the sampler.
///
/// `memory` is `None` when the stats payload did not carry usable memory
/// fields; the container is then exported with a CPU series only.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSample {
    pub name: String,
    pub prev: ContainerCpuReading,
    pub curr: ContainerCpuReading,
    pub memory: Option<ContainerMemoryReading>,
}

/// Normalized percentages for one container, ready for the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: Option<f64>,
}

/// Clamps a host percentage into `[0, 100]`.
pub fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Derives a container's CPU usage percentage from two cumulative readings.
///
/// Returns exactly `0.0` when either delta is non-positive (counter reset,
/// clock skew, or a first-ever reading), otherwise
/// `(cpu_delta / system_delta) * online_cpus * 100.0`. The result can exceed
/// 100 on multi-core hosts since it is relative to a single core.
pub fn container_cpu_percent(prev: &ContainerCpuReading, curr: &ContainerCpuReading) -> f64 {
    let cpu_delta = curr.total_usage_ns as i128 - prev.total_usage_ns as i128;
    let system_delta = curr.system_usage_ns as i128 - prev.system_usage_ns as i128;

    if cpu_delta <= 0 || system_delta <= 0 {
        return 0.0;
    }

    (cpu_delta as f64 / system_delta as f64) * curr.online_cpus.max(1) as f64 * 100.0
}

/// Derives a container's memory usage percentage.
///
/// Fails with [`ScrapeError::InvalidLimit`] when the limit is zero. The
/// result is deliberately uncapped: usage above the limit is legitimate
/// under memory overcommit and callers must not clamp it.
pub fn container_memory_percent(usage_bytes: u64, limit_bytes: u64) -> Result<f64, ScrapeError> {
    if limit_bytes == 0 {
        return Err(ScrapeError::InvalidLimit(limit_bytes));
    }
    Ok(usage_bytes as f64 / limit_bytes as f64 * 100.0)
}

/// Converts raw container samples into normalized usages, sorted by name.
///
/// Failures are isolated per container: an invalid memory limit drops that
/// container's memory percentage only, and never affects its CPU value or
/// any other container.
pub fn resolve_usages(samples: Vec<ContainerSample>) -> Vec<ContainerUsage> {
    let mut usages: Vec<ContainerUsage> = samples
        .into_iter()
        .map(|sample| {
            let cpu_percent = container_cpu_percent(&sample.prev, &sample.curr);
            let memory_percent = sample.memory.as_ref().and_then(|memory| {
                match container_memory_percent(memory.usage_bytes, memory.limit_bytes) {
                    Ok(percent) => Some(percent),
                    Err(e) => {
                        warn!("skipping memory series for {}: {}", sample.name, e);
                        None
                    }
                }
            });

            ContainerUsage {
                name: sample.name,
                cpu_percent,
                memory_percent,
            }
        })
        .collect();

    usages.sort_by(|a, b| a.name.cmp(&b.name));
    usages
}
