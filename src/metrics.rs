use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use tracing::{error, warn};

use crate::services::usage::{ContainerUsage, HostSample};

/// Identity of one exported series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeriesKey {
    HostCpu,
    HostMemory,
    HostDisk,
    ContainerCpu(String),
    ContainerMemory(String),
}

struct HostGauges {
    cpu: Gauge,
    memory: Gauge,
    disk: Gauge,
}

struct ContainerGauges {
    cpu: Gauge,
    /// Absent while the container's memory limit is unusable.
    memory: Option<Gauge>,
}

struct Inner {
    registry: Registry,
    /// Created on the first scrape, then reused for every overwrite.
    host: Option<HostGauges>,
    containers: HashMap<String, ContainerGauges>,
}

/// The process-wide set of exported series.
///
/// Wraps one explicitly owned Prometheus registry. Gauge handles are created
/// once per series and reused across scrapes: re-registering a series name
/// is a collision error in the underlying registry, so upserts always set
/// the existing gauge in place.
///
/// All mutation for one scrape runs under a single lock, so concurrent
/// scrape requests serialize and an export never observes a half-applied
/// scrape.
pub struct SeriesRegistry {
    inner: Mutex<Inner>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                registry: Registry::new(),
                host: None,
                containers: HashMap::new(),
            }),
        }
    }

    /// Applies one full scrape atomically and renders the result.
    ///
    /// Under a single critical section: host series are overwritten,
    /// container series not present in this scrape are pruned, the scrape's
    /// containers are upserted, and the exposition body is rendered. `None`
    /// for `containers` means the backend was unavailable: every container
    /// series is pruned so no stale value is exported.
    pub fn apply_scrape(
        &self,
        host: &HostSample,
        containers: Option<&[ContainerUsage]>,
    ) -> Vec<u8> {
        let mut inner = self.lock();

        Self::upsert_host_locked(&mut inner, host);

        let current: HashSet<String> = containers
            .map(|list| list.iter().map(|usage| usage.name.clone()).collect())
            .unwrap_or_default();
        Self::prune_locked(&mut inner, &current);

        if let Some(list) = containers {
            for usage in list {
                Self::upsert_container_locked(&mut inner, usage);
            }
        }

        Self::render_locked(&inner)
    }

    /// Overwrites the three host series, creating them on the first scrape.
    pub fn upsert_host(&self, sample: &HostSample) {
        let mut inner = self.lock();
        Self::upsert_host_locked(&mut inner, sample);
    }

    /// Creates or overwrites the series pair for one container.
    pub fn upsert_container(&self, usage: &ContainerUsage) {
        let mut inner = self.lock();
        Self::upsert_container_locked(&mut inner, usage);
    }

    /// Removes every container series whose name is not in `current`.
    pub fn prune(&self, current: &HashSet<String>) {
        let mut inner = self.lock();
        Self::prune_locked(&mut inner, current);
    }

    /// Consistent read-only view of every series and its current value.
    pub fn snapshot(&self) -> BTreeMap<SeriesKey, f64> {
        let inner = self.lock();
        let mut snapshot = BTreeMap::new();

        if let Some(host) = &inner.host {
            snapshot.insert(SeriesKey::HostCpu, host.cpu.get());
            snapshot.insert(SeriesKey::HostMemory, host.memory.get());
            snapshot.insert(SeriesKey::HostDisk, host.disk.get());
        }

        for (name, gauges) in &inner.containers {
            snapshot.insert(SeriesKey::ContainerCpu(name.clone()), gauges.cpu.get());
            if let Some(memory) = &gauges.memory {
                snapshot.insert(SeriesKey::ContainerMemory(name.clone()), memory.get());
            }
        }

        snapshot
    }

    /// Renders the current series into the Prometheus text format.
    pub fn render(&self) -> Vec<u8> {
        let inner = self.lock();
        Self::render_locked(&inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicked scrape only loses its partial update; the registry
        // itself stays structurally valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert_host_locked(inner: &mut Inner, sample: &HostSample) {
        if inner.host.is_none() {
            let cpu = register_gauge(
                &inner.registry,
                "system_cpu_percent",
                "System CPU usage percentage",
            );
            let memory = register_gauge(
                &inner.registry,
                "system_memory_percent",
                "System Memory usage percentage",
            );
            let disk = register_gauge(
                &inner.registry,
                "system_disk_usage_percent",
                "System Disk usage percentage",
            );
            match (cpu, memory, disk) {
                (Some(cpu), Some(memory), Some(disk)) => {
                    inner.host = Some(HostGauges { cpu, memory, disk });
                }
                _ => {
                    error!("failed to register host gauges");
                    return;
                }
            }
        }

        if let Some(host) = &inner.host {
            host.cpu.set(sample.cpu_percent);
            host.memory.set(sample.memory_percent);
            host.disk.set(sample.disk_percent);
        }
    }

    fn upsert_container_locked(inner: &mut Inner, usage: &ContainerUsage) {
        let Inner {
            registry,
            containers,
            ..
        } = inner;

        let gauges = match containers.entry(usage.name.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let cpu = register_gauge(
                    registry,
                    &series_name("container_cpu_usage", usage.name.as_str()),
                    &format!("CPU usage for {}", usage.name),
                );
                let Some(cpu) = cpu else {
                    // Unregisterable name; the container is skipped.
                    return;
                };
                entry.insert(ContainerGauges { cpu, memory: None })
            }
        };

        gauges.cpu.set(usage.cpu_percent);

        match usage.memory_percent {
            Some(percent) => {
                if gauges.memory.is_none() {
                    gauges.memory = register_gauge(
                        registry,
                        &series_name("container_memory_usage", usage.name.as_str()),
                        &format!("Memory usage for {}", usage.name),
                    );
                }
                if let Some(memory) = &gauges.memory {
                    memory.set(percent);
                }
            }
            None => {
                // The limit was unusable this scrape; exporting the old
                // value would be stale, so the series goes away.
                if let Some(memory) = gauges.memory.take() {
                    let _ = registry.unregister(Box::new(memory));
                }
            }
        }
    }

    fn prune_locked(inner: &mut Inner, current: &HashSet<String>) {
        let Inner {
            registry,
            containers,
            ..
        } = inner;

        containers.retain(|name, gauges| {
            if current.contains(name) {
                return true;
            }
            if let Err(e) = registry.unregister(Box::new(gauges.cpu.clone())) {
                warn!("failed to unregister cpu series for {}: {}", name, e);
            }
            if let Some(memory) = gauges.memory.take() {
                if let Err(e) = registry.unregister(Box::new(memory)) {
                    warn!("failed to unregister memory series for {}: {}", name, e);
                }
            }
            false
        });
    }

    fn render_locked(inner: &Inner) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&inner.registry.gather(), &mut buffer) {
            error!("failed to encode metrics: {}", e);
        }
        buffer
    }
}

impl Default for SeriesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Option<Gauge> {
    let gauge = match Gauge::with_opts(Opts::new(name, help)) {
        Ok(gauge) => gauge,
        Err(e) => {
            warn!("failed to create gauge {}: {}", name, e);
            return None;
        }
    };
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!("failed to register gauge {}: {}", name, e);
        return None;
    }
    Some(gauge)
}

/// Builds a series name embedding the container name, mapped onto the
/// Prometheus metric charset.
fn series_name(prefix: &str, name: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1 + name.len());
    out.push_str(prefix);
    out.push('_');
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_sample() -> HostSample {
        HostSample {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            disk_percent: 75.0,
        }
    }

    fn usage(name: &str, cpu: f64, memory: Option<f64>) -> ContainerUsage {
        ContainerUsage {
            name: name.to_string(),
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    fn render_string(registry: &SeriesRegistry) -> String {
        String::from_utf8(registry.render()).unwrap()
    }

    #[test]
    fn host_series_appear_after_first_scrape() {
        let registry = SeriesRegistry::new();
        assert!(registry.snapshot().is_empty());

        registry.upsert_host(&host_sample());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get(&SeriesKey::HostCpu), Some(&12.5));
        assert_eq!(snapshot.get(&SeriesKey::HostMemory), Some(&40.0));
        assert_eq!(snapshot.get(&SeriesKey::HostDisk), Some(&75.0));
    }

    #[test]
    fn host_series_are_overwritten_in_place() {
        let registry = SeriesRegistry::new();
        registry.upsert_host(&host_sample());
        registry.upsert_host(&HostSample {
            cpu_percent: 99.0,
            memory_percent: 1.0,
            disk_percent: 2.0,
        });

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(&SeriesKey::HostCpu), Some(&99.0));
    }

    #[test]
    fn container_upsert_is_idempotent() {
        let registry = SeriesRegistry::new();
        registry.upsert_container(&usage("web", 50.0, Some(25.0)));
        registry.upsert_container(&usage("web", 50.0, Some(25.0)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get(&SeriesKey::ContainerCpu("web".to_string())),
            Some(&50.0)
        );
        assert_eq!(
            snapshot.get(&SeriesKey::ContainerMemory("web".to_string())),
            Some(&25.0)
        );

        // Exactly one exported sample line per series, no duplicates.
        let body = render_string(&registry);
        let cpu_lines = body
            .lines()
            .filter(|line| line.starts_with("container_cpu_usage_web "))
            .count();
        assert_eq!(cpu_lines, 1);
    }

    #[test]
    fn container_upsert_overwrites_values() {
        let registry = SeriesRegistry::new();
        registry.upsert_container(&usage("web", 10.0, Some(20.0)));
        registry.upsert_container(&usage("web", 30.0, Some(40.0)));

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.get(&SeriesKey::ContainerCpu("web".to_string())),
            Some(&30.0)
        );
        assert_eq!(
            snapshot.get(&SeriesKey::ContainerMemory("web".to_string())),
            Some(&40.0)
        );
    }

    #[test]
    fn memory_percent_is_exported_uncapped() {
        let registry = SeriesRegistry::new();
        registry.upsert_container(&usage("greedy", 5.0, Some(180.0)));
        assert_eq!(
            registry
                .snapshot()
                .get(&SeriesKey::ContainerMemory("greedy".to_string())),
            Some(&180.0)
        );
    }

    #[test]
    fn prune_to_empty_set_keeps_host_series() {
        let registry = SeriesRegistry::new();
        registry.upsert_host(&host_sample());
        registry.upsert_container(&usage("web", 50.0, Some(25.0)));
        registry.upsert_container(&usage("db", 10.0, Some(5.0)));

        registry.prune(&HashSet::new());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.contains_key(&SeriesKey::HostCpu));
        assert!(!snapshot
            .keys()
            .any(|key| matches!(key, SeriesKey::ContainerCpu(_) | SeriesKey::ContainerMemory(_))));

        let body = render_string(&registry);
        assert!(body.contains("system_cpu_percent"));
        assert!(!body.contains("container_cpu_usage"));
    }

    #[test]
    fn prune_keeps_only_current_containers() {
        let registry = SeriesRegistry::new();
        registry.upsert_container(&usage("web", 50.0, Some(25.0)));
        registry.upsert_container(&usage("db", 10.0, Some(5.0)));

        let current: HashSet<String> = ["web".to_string()].into_iter().collect();
        registry.prune(&current);

        let snapshot = registry.snapshot();
        assert!(snapshot.contains_key(&SeriesKey::ContainerCpu("web".to_string())));
        assert!(!snapshot.contains_key(&SeriesKey::ContainerCpu("db".to_string())));
        assert!(!snapshot.contains_key(&SeriesKey::ContainerMemory("db".to_string())));
    }

    #[test]
    fn stopped_container_is_absent_after_next_scrape() {
        let registry = SeriesRegistry::new();

        // Scrape N: two containers running.
        registry.apply_scrape(
            &host_sample(),
            Some(&[usage("db", 10.0, Some(5.0)), usage("web", 50.0, Some(25.0))]),
        );
        assert!(registry
            .snapshot()
            .contains_key(&SeriesKey::ContainerCpu("db".to_string())));

        // Scrape N+1: db stopped in between.
        let body = registry.apply_scrape(&host_sample(), Some(&[usage("web", 60.0, Some(30.0))]));
        let body = String::from_utf8(body).unwrap();

        let snapshot = registry.snapshot();
        assert!(!snapshot.contains_key(&SeriesKey::ContainerCpu("db".to_string())));
        assert!(!snapshot.contains_key(&SeriesKey::ContainerMemory("db".to_string())));
        assert!(!body.contains("container_cpu_usage_db"));
        assert!(body.contains("container_cpu_usage_web"));
    }

    #[test]
    fn unavailable_backend_exports_host_series_only() {
        let registry = SeriesRegistry::new();
        registry.apply_scrape(&host_sample(), Some(&[usage("web", 50.0, Some(25.0))]));

        let body = registry.apply_scrape(&host_sample(), None);
        let body = String::from_utf8(body).unwrap();

        assert!(body.contains("system_cpu_percent"));
        assert!(body.contains("system_memory_percent"));
        assert!(body.contains("system_disk_usage_percent"));
        assert!(!body.contains("container_cpu_usage"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn empty_container_list_is_a_valid_scrape() {
        let registry = SeriesRegistry::new();
        let body = registry.apply_scrape(&host_sample(), Some(&[]));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("system_cpu_percent"));
        assert!(!body.contains("container_"));
    }

    #[test]
    fn missing_memory_skips_only_that_series() {
        let registry = SeriesRegistry::new();
        registry.upsert_container(&usage("web", 50.0, None));

        let snapshot = registry.snapshot();
        assert!(snapshot.contains_key(&SeriesKey::ContainerCpu("web".to_string())));
        assert!(!snapshot.contains_key(&SeriesKey::ContainerMemory("web".to_string())));

        // A later scrape with a valid limit brings the series back.
        registry.upsert_container(&usage("web", 50.0, Some(25.0)));
        assert!(registry
            .snapshot()
            .contains_key(&SeriesKey::ContainerMemory("web".to_string())));

        // And a bad limit removes it again instead of exporting stale data.
        registry.upsert_container(&usage("web", 50.0, None));
        let body = render_string(&registry);
        assert!(body.contains("container_cpu_usage_web"));
        assert!(!body.contains("container_memory_usage_web"));
    }

    #[test]
    fn container_names_are_sanitized_for_the_wire() {
        let registry = SeriesRegistry::new();
        registry.upsert_container(&usage("web-1.staging", 50.0, Some(25.0)));

        let body = render_string(&registry);
        assert!(body.contains("container_cpu_usage_web_1_staging"));
        assert!(body.contains("container_memory_usage_web_1_staging"));

        // Identity is still keyed by the display name.
        assert!(registry
            .snapshot()
            .contains_key(&SeriesKey::ContainerCpu("web-1.staging".to_string())));
    }

    #[test]
    fn render_includes_help_and_type_lines() {
        let registry = SeriesRegistry::new();
        registry.upsert_host(&host_sample());
        registry.upsert_container(&usage("web", 50.0, Some(25.0)));

        let body = render_string(&registry);
        assert!(body.contains("# HELP system_cpu_percent System CPU usage percentage"));
        assert!(body.contains("# TYPE system_cpu_percent gauge"));
        assert!(body.contains("# HELP container_cpu_usage_web CPU usage for web"));
        assert!(body.contains("# TYPE container_memory_usage_web gauge"));
    }
}
