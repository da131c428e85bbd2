//! Machine readings through `sysinfo`

use sysinfo::{Networks, Pid, ProcessesToUpdate, System};

use super::ResourceSampler;
use crate::metrics::ratio;
use crate::models::ResourceReading;

/// Reads the host's CPU, memory and network counters, plus the memory and
/// disk traffic of one process (this one unless told otherwise).
pub struct SystemSampler {
    system: System,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::for_process(sysinfo::get_current_pid().ok())
    }

    pub fn for_process(pid: Option<Pid>) -> Self {
        let mut system = System::new();
        // CPU usage is measured between refreshes
        system.refresh_cpu_usage();
        Self { system, pid }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceReading {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let mut reading = ResourceReading {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_used_bytes: used,
            memory_available_bytes: self.system.available_memory(),
            memory_total_bytes: total,
            memory_percent: ratio(used as f64, total as f64) * 100.0,
            ..ResourceReading::default()
        };

        if let Some(pid) = self.pid {
            let _ = self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
            if let Some(process) = self.system.process(pid) {
                let disk = process.disk_usage();
                reading.process_memory_rss = process.memory();
                reading.process_memory_vms = process.virtual_memory();
                reading.disk_read_bytes = disk.total_read_bytes;
                reading.disk_write_bytes = disk.total_written_bytes;
            }
        }

        let networks = Networks::new_with_refreshed_list();
        for (name, data) in &networks {
            if name.starts_with("lo") {
                continue;
            }
            reading.network_bytes_sent += data.total_transmitted();
            reading.network_bytes_recv += data.total_received();
            reading.network_packets_sent += data.total_packets_transmitted();
            reading.network_packets_recv += data.total_packets_received();
        }

        reading
    }
}
