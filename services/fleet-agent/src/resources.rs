//! Host resource snapshot for the node status report.

use serde::{Deserialize, Serialize};

/// Point-in-time resource view of this host, embedded in the node
/// record other schedulers read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_cores: i64,
    pub total_memory_bytes: i64,
    pub available_memory_bytes: i64,
}

impl ResourceSnapshot {
    pub fn measure() -> Self {
        let (total, available) = memory_info();
        Self {
            cpu_cores: cpu_count(),
            total_memory_bytes: total,
            available_memory_bytes: available,
        }
    }
}

fn cpu_count() -> i64 {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count > 0 {
        return count;
    }
    std::thread::available_parallelism()
        .map(|p| p.get() as i64)
        .unwrap_or(1)
}

fn memory_info() -> (i64, i64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size > 0 && total_pages > 0 {
        let total = page_size * total_pages;
        return (total, total / 2);
    }
    (0, 0)
}

fn parse_meminfo(content: &str) -> (i64, i64) {
    const KB: i64 = 1024;
    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(field), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: i64 = value.parse().unwrap_or(0) * KB;
        match field {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }
    (total, available)
}
