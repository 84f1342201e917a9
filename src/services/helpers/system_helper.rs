use std::path::Path;
use std::time::Duration;

use sysinfo::{Disks, System};
use tracing::debug;

use crate::services::usage::{clamp_percent, HostSample};

/// Window between the two CPU refreshes that produce the usage average.
///
/// This sleep is the dominant latency of a scrape: every `/metrics` request
/// takes at least this long. It is an async sleep, so concurrent requests
/// are not blocked by it.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Samples host CPU, memory, and disk usage percentages.
///
/// Never fails: components that cannot be read (no disks, zero memory
/// total) degrade to `0.0`. All values are clamped to `[0, 100]`.
pub async fn sample_host() -> HostSample {
    let mut sys = System::new();
    sys.refresh_memory();

    // Two refreshes separated by a fixed window give a stable CPU average;
    // a single refresh would report usage since boot.
    sys.refresh_cpu_usage();
    tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
    sys.refresh_cpu_usage();

    let cpu_percent = sys.global_cpu_usage() as f64;

    let memory_percent = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
    } else {
        0.0
    };

    let sample = HostSample {
        cpu_percent: clamp_percent(cpu_percent),
        memory_percent: clamp_percent(memory_percent),
        disk_percent: clamp_percent(root_disk_percent()),
    };
    debug!(
        "host sample: cpu={:.1}% memory={:.1}% disk={:.1}%",
        sample.cpu_percent, sample.memory_percent, sample.disk_percent
    );
    sample
}

/// Usage percentage of the `/` filesystem, falling back to the largest
/// mounted disk when no root mount is listed.
fn root_disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|disk| disk.total_space()));

    match root {
        Some(disk) if disk.total_space() > 0 => {
            let used = disk.total_space().saturating_sub(disk.available_space());
            used as f64 / disk.total_space() as f64 * 100.0
        }
        _ => 0.0,
    }
}
