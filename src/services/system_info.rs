//! System metrics sampling for the sysmon panel.
//!
//! A `Sampler` refreshes only the metric groups its filter enables, so a
//! panel that shows just the CPU does not pay for network enumeration.

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use sysinfo::{MemoryRefreshKind, Networks, System};

/// Static system information that does not change during runtime.
/// This is fetched once, on first use.
#[derive(Debug, Clone, Serialize)]
pub struct StaticInfo {
    /// OS name (e.g. "Ubuntu", "Fedora")
    pub name: String,
    /// Kernel version (e.g. "6.8.0-45-generic")
    pub kernel: String,
    /// Hostname (e.g. "my-pc")
    pub host: String,
    /// Total memory in bytes
    pub total_mem: u64,
    /// Number of physical CPU cores
    pub cpu_count: usize,
}

static STATIC_INFO: OnceLock<StaticInfo> = OnceLock::new();

pub fn get_static_info() -> &'static StaticInfo {
    STATIC_INFO.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());

        StaticInfo {
            name: System::name().unwrap_or_else(|| "Unknown".into()),
            kernel: System::kernel_version().unwrap_or_else(|| "Unknown".into()),
            host: System::host_name().unwrap_or_else(|| "Unknown".into()),
            total_mem: sys.total_memory(),
            cpu_count: sys.physical_core_count().unwrap_or(0),
        }
    })
}

/// Which metric groups to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricFilter {
    pub cpu: bool,
    pub ram: bool,
    pub network: bool,
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self {
            cpu: true,
            ram: true,
            network: true,
        }
    }
}

impl MetricFilter {
    pub fn is_empty(&self) -> bool {
        !(self.cpu || self.ram || self.network)
    }
}

/// One sample, as published on the bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    // percentage (0.0 - 100.0)
    pub cpu_usage: f32,
    // percentage (0.0 - 100.0)
    pub ram_usage: f32,
    // in bytes
    pub ram_used: u64,
    pub ram_used_readable: String,
    // bytes since the previous sample
    pub network_transmitted: u64,
    pub network_received: u64,
    pub network_transmitted_readable: String,
    pub network_received_readable: String,
}

pub struct Sampler {
    sys: System,
    networks: Option<Networks>,
    filter: MetricFilter,
}

impl Sampler {
    pub fn new(filter: MetricFilter) -> Self {
        Self {
            sys: System::new(),
            networks: None,
            filter,
        }
    }

    pub fn sample(&mut self) -> SystemStatus {
        let mut stats = SystemStatus::default();

        if self.filter.cpu {
            self.sys.refresh_cpu_usage();
            stats.cpu_usage = self.sys.global_cpu_usage();
        }

        if self.filter.ram {
            self.sys
                .refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
            let used = self.sys.used_memory();
            let total = self.sys.total_memory();
            stats.ram_used = used;
            if total > 0 {
                stats.ram_usage = (used as f32 / total as f32) * 100.0;
            }
        }

        if self.filter.network {
            // The first refresh only establishes the baseline.
            if self.networks.is_none() {
                self.networks = Some(Networks::new_with_refreshed_list());
            } else if let Some(net) = self.networks.as_mut() {
                net.refresh_list();
                for (_interface_name, data) in net.iter() {
                    stats.network_transmitted += data.transmitted();
                    stats.network_received += data.received();
                }
            }
        }

        stats.ram_used_readable = readable_bytes(stats.ram_used);
        stats.network_transmitted_readable = readable_bytes(stats.network_transmitted);
        stats.network_received_readable = readable_bytes(stats.network_received);

        debug!("Sampled system info with filter: {:?}", self.filter);
        stats
    }
}

/// Human readable byte count, e.g. `1.5 KB`.
pub fn readable_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b < KB => format!("{b} B"),
        b if b < MB => format!("{:.1} KB", b as f64 / KB as f64),
        b if b < GB => format!("{:.1} MB", b as f64 / MB as f64),
        b => format!("{:.1} GB", b as f64 / GB as f64),
    }
}
