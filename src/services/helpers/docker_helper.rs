use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, warn};

use crate::errors::ScrapeError;
use crate::services::usage::{ContainerCpuReading, ContainerMemoryReading, ContainerSample};

/// Samples raw CPU and memory readings for every running container.
///
/// Returns [`ScrapeError::BackendUnavailable`] only when the daemon itself
/// cannot be reached (connect, ping, or list failure); zero running
/// containers is the empty vector, which callers must treat as a valid
/// scrape. Per-container fetch failures and malformed stats payloads are
/// logged and skipped so one broken container never hides the others.
///
/// Each stats fetch is a blocking call into the daemon: with a non-one-shot
/// single read the daemon samples the CPU counters twice about a second
/// apart, which is where the `precpu_stats` reading comes from.
pub async fn sample_containers() -> Result<Vec<ContainerSample>, ScrapeError> {
    let docker = Docker::connect_with_local_defaults()?;
    docker.ping().await?;

    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            ..Default::default()
        }))
        .await?;

    let mut samples = Vec::with_capacity(containers.len());

    for container in &containers {
        let Some(name) = display_name(container) else {
            warn!("skipping container without name or id");
            continue;
        };

        match fetch_stats(&docker, &name).await {
            Ok(Some(sample)) => samples.push(sample),
            // Malformed payload, already logged by the converter.
            Ok(None) => {}
            Err(e) => warn!("failed to fetch stats for {}: {}", name, e),
        }
    }

    debug!("sampled {} of {} containers", samples.len(), containers.len());

    // Deterministic order regardless of how the daemon listed them.
    samples.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(samples)
}

/// Fetches one stats frame and converts it into a raw sample.
///
/// Returns `Ok(None)` when the payload is malformed (no frame, or CPU
/// counters missing); those containers are dropped for the scrape.
async fn fetch_stats(
    docker: &Docker,
    name: &str,
) -> Result<Option<ContainerSample>, bollard::errors::Error> {
    let options = Some(StatsOptions {
        stream: false,
        one_shot: false,
    });

    let stats = match docker.stats(name, options).next().await {
        Some(stats) => stats?,
        None => {
            warn!("no stats frame for {}, skipping", name);
            return Ok(None);
        }
    };

    Ok(sample_from_stats(name, &stats))
}

fn sample_from_stats(name: &str, stats: &Stats) -> Option<ContainerSample> {
    let online_cpus = effective_online_cpus(
        stats.cpu_stats.online_cpus,
        stats.cpu_stats.cpu_usage.percpu_usage.as_deref(),
    );

    // Without both system counters no rate can be derived; treat the frame
    // as malformed and drop the container for this scrape.
    let (Some(curr_system), Some(prev_system)) = (
        stats.cpu_stats.system_cpu_usage,
        stats.precpu_stats.system_cpu_usage,
    ) else {
        warn!("stats for {} lack system CPU counters, skipping", name);
        return None;
    };

    let prev = ContainerCpuReading {
        total_usage_ns: stats.precpu_stats.cpu_usage.total_usage,
        system_usage_ns: prev_system,
        online_cpus,
    };
    let curr = ContainerCpuReading {
        total_usage_ns: stats.cpu_stats.cpu_usage.total_usage,
        system_usage_ns: curr_system,
        online_cpus,
    };

    let memory = match (stats.memory_stats.usage, stats.memory_stats.limit) {
        (Some(usage_bytes), Some(limit_bytes)) => Some(ContainerMemoryReading {
            usage_bytes,
            limit_bytes,
        }),
        _ => {
            debug!("stats for {} lack memory usage or limit", name);
            None
        }
    };

    Some(ContainerSample {
        name: name.to_string(),
        prev,
        curr,
        memory,
    })
}

/// Core count a container's usage ratio is scaled by: the explicit count
/// when the daemon reports one, else the per-core breakdown length, else 1.
fn effective_online_cpus(online_cpus: Option<u64>, percpu_usage: Option<&[u64]>) -> u32 {
    if let Some(cpus) = online_cpus {
        if cpus > 0 {
            return cpus as u32;
        }
    }
    match percpu_usage {
        Some(percpu) if !percpu.is_empty() => percpu.len() as u32,
        _ => 1,
    }
}

/// Display name for a listed container: leading-slash-stripped first name,
/// falling back to the short id.
fn display_name(container: &ContainerSummary) -> Option<String> {
    if let Some(names) = &container.names {
        if let Some(name) = names.first() {
            let trimmed = name.trim_start_matches('/');
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    container
        .id
        .as_ref()
        .map(|id| id.chars().take(12).collect())
}
