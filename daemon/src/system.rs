//! Host-wide metrics: CPU, memory, disk and network counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// Cumulative since boot.
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_bytes_sent: u64,
    pub net_bytes_recv: u64,
    pub process_count: u32,
    pub uptime_seconds: u64,
}

/// Metrics scaled for model input: percentages to 0..1, byte counters
/// through `ln(1 + x)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_read_bytes: f64,
    pub disk_write_bytes: f64,
    pub net_bytes_sent: f64,
    pub net_bytes_recv: f64,
}

impl SystemSnapshot {
    pub fn normalize(&self) -> NormalizedSystemMetrics {
        NormalizedSystemMetrics {
            timestamp: self.timestamp,
            cpu_percent: (self.cpu_percent / 100.0).clamp(0.0, 1.0),
            memory_percent: (self.memory_percent / 100.0).clamp(0.0, 1.0),
            disk_read_bytes: (self.disk_read_bytes as f64).ln_1p(),
            disk_write_bytes: (self.disk_write_bytes as f64).ln_1p(),
            net_bytes_sent: (self.net_bytes_sent as f64).ln_1p(),
            net_bytes_recv: (self.net_bytes_recv as f64).ln_1p(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

pub struct SystemSampler {
    proc_root: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
            last_cpu: Mutex::new(None),
        }
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.proc_root.join(name)).unwrap_or_default()
    }

    /// Unreadable sources report zeros rather than failing the tick.
    pub fn sample(&self) -> SystemSnapshot {
        let (memory_total_bytes, memory_used_bytes) = parse_meminfo(&self.read("meminfo"));
        let memory_percent = if memory_total_bytes > 0 {
            memory_used_bytes as f64 / memory_total_bytes as f64 * 100.0
        } else {
            0.0
        };
        let (disk_read_bytes, disk_write_bytes) = parse_diskstats(&self.read("diskstats"));
        let (net_bytes_recv, net_bytes_sent) = parse_net_dev(&self.read("net/dev"));

        SystemSnapshot {
            timestamp: Utc::now(),
            cpu_percent: self.cpu_percent(),
            memory_percent,
            memory_used_bytes,
            memory_total_bytes,
            disk_read_bytes,
            disk_write_bytes,
            net_bytes_sent,
            net_bytes_recv,
            process_count: self.process_count(),
            uptime_seconds: self
                .read("uptime")
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0) as u64,
        }
    }

    fn cpu_percent(&self) -> f64 {
        let Some(now) = parse_cpu_line(&self.read("stat")) else {
            return 0.0;
        };
        let mut last = self.last_cpu.lock().unwrap_or_else(|p| p.into_inner());
        let percent = match *last {
            Some(prev) if now.total > prev.total => {
                let busy = now.busy.saturating_sub(prev.busy) as f64;
                busy / (now.total - prev.total) as f64 * 100.0
            }
            _ => 0.0,
        };
        *last = Some(now);
        percent
    }

    fn process_count(&self) -> u32 {
        fs::read_dir(&self.proc_root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_str().is_some_and(|n| n.parse::<u32>().is_ok()))
                    .count() as u32
            })
            .unwrap_or(0)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_cpu_line(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// `(total, used)` in bytes, used = MemTotal - MemAvailable.
fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = None;
    let mut free = 0;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or("");
        let kib: u64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        match key {
            "MemTotal:" => total = kib * 1024,
            "MemAvailable:" => available = Some(kib * 1024),
            "MemFree:" => free = kib * 1024,
            _ => {}
        }
    }
    let available = available.unwrap_or(free);
    (total, total.saturating_sub(available))
}

/// Sum of sectors read/written on whole disks, in bytes.
fn parse_diskstats(diskstats: &str) -> (u64, u64) {
    const SECTOR: u64 = 512;
    let mut read = 0;
    let mut written = 0;
    let mut disks: Vec<String> = Vec::new();
    for line in diskstats.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if ["loop", "ram", "zram", "dm-"].iter().any(|p| name.starts_with(p)) {
            continue;
        }
        // Partitions follow their disk and share its prefix
        if disks.iter().any(|d| name.starts_with(d.as_str())) {
            continue;
        }
        disks.push(name.to_string());
        read += fields[5].parse::<u64>().unwrap_or(0) * SECTOR;
        written += fields[9].parse::<u64>().unwrap_or(0) * SECTOR;
    }
    (read, written)
}

/// `(received, transmitted)` bytes over all non-loopback interfaces.
fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    let mut recv = 0;
    let mut sent = 0;
    for line in net_dev.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() >= 9 {
            recv += fields[0];
            sent += fields[8];
        }
    }
    (recv, sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_prefers_available() {
        let info = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let (total, used) = parse_meminfo(info);
        assert_eq!(total, 16_000_000 * 1024);
        assert_eq!(used, 12_000_000 * 1024);
    }

    #[test]
    fn diskstats_skips_partitions_and_loops() {
        let stats = "\
   7       0 loop0 10 0 100 0 0 0 0 0 0 0 0
   8       0 sda 100 0 2000 0 50 0 1000 0 0 0 0
   8       1 sda1 90 0 1800 0 40 0 900 0 0 0 0
 259       0 nvme0n1 10 0 20 0 5 0 10 0 0 0 0
 259       1 nvme0n1p1 10 0 20 0 5 0 10 0 0 0 0";
        let (read, written) = parse_diskstats(stats);
        assert_eq!(read, (2000 + 20) * 512);
        assert_eq!(written, (1000 + 10) * 512);
    }

    #[test]
    fn net_dev_ignores_loopback() {
        let dev = "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 5000 10 0 0 0 0 0 0 5000 10 0 0 0 0 0 0
  eth0: 1200 8 0 0 0 0 0 0 3400 9 0 0 0 0 0 0";
        assert_eq!(parse_net_dev(dev), (1200, 3400));
    }

    #[test]
    fn cpu_line_splits_busy_and_idle() {
        let times = parse_cpu_line("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4").unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 200);
    }

    #[test]
    fn normalize_scales_percentages_and_logs_bytes() {
        let snapshot = SystemSnapshot {
            timestamp: Utc::now(),
            cpu_percent: 50.0,
            memory_percent: 25.0,
            memory_used_bytes: 1,
            memory_total_bytes: 4,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            net_bytes_sent: 0,
            net_bytes_recv: 0,
            process_count: 1,
            uptime_seconds: 1,
        };
        let normalized = snapshot.normalize();
        assert_eq!(normalized.cpu_percent, 0.5);
        assert_eq!(normalized.memory_percent, 0.25);
        assert_eq!(normalized.disk_read_bytes, 0.0);
    }
}
