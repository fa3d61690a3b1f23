use super::ProcessSampler;
use crate::config::{MatchType, WatchCriterion};
use crate::error::SampleError;
use crate::model::{ExitCode, ProcessHandle, ProcessKey, ProcessStatus, Snapshot};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Clone)]
struct CpuSample {
    total_ticks: u64, // utime + stime
    timestamp: Instant,
}

/// Fields of `/proc/<pid>/stat` the sampler cares about.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatFields {
    pub name: String,
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    pub start_time: u64,
    pub rss_pages: u64,
    /// Field 52, only meaningful once the process is a zombie.
    pub exit_code: Option<i32>,
}

/// Parse a stat line. The command name may itself contain spaces and
/// parentheses, so it is delimited by the first '(' and the last ')'.
pub(crate) fn parse_stat(pid: u32, content: &str) -> Result<StatFields, SampleError> {
    let open = content.find('(').ok_or(SampleError::Parse { pid })?;
    let close = content.rfind(')').ok_or(SampleError::Parse { pid })?;
    if close < open {
        return Err(SampleError::Parse { pid });
    }
    let name = content[open + 1..close].to_string();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state)
    if rest.len() < 22 {
        return Err(SampleError::Parse { pid });
    }
    let field = |idx: usize| -> Result<u64, SampleError> {
        rest[idx].parse().map_err(|_| SampleError::Parse { pid })
    };

    Ok(StatFields {
        name,
        state: rest[0].chars().next().unwrap_or('?'),
        utime: field(11)?,
        stime: field(12)?,
        num_threads: field(17)? as u32,
        start_time: field(19)?,
        rss_pages: field(21)?,
        exit_code: rest.get(49).and_then(|v| v.parse().ok()),
    })
}

pub struct LinuxSampler {
    proc_root: PathBuf,
    page_size: u64,
    clock_ticks: u64,
    cpu_samples: Mutex<HashMap<ProcessKey, CpuSample>>,
    /// Exit statuses read while a tracked process sat in the zombie state.
    exit_codes: Mutex<HashMap<ProcessKey, i32>>,
}

impl LinuxSampler {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            proc_root: root.into(),
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            clock_ticks: if clock_ticks > 0 { clock_ticks as u64 } else { 100 },
            cpu_samples: Mutex::new(HashMap::new()),
            exit_codes: Mutex::new(HashMap::new()),
        }
    }

    fn proc_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    fn read_stat(&self, pid: u32) -> Result<StatFields, SampleError> {
        let content = fs::read_to_string(self.proc_dir(pid).join("stat"))
            .map_err(|source| SampleError::Io { pid, source })?;
        parse_stat(pid, &content)
    }

    fn read_cmdline(&self, pid: u32) -> String {
        fs::read_to_string(self.proc_dir(pid).join("cmdline"))
            .unwrap_or_default()
            .replace('\0', " ")
            .trim()
            .to_string()
    }

    /// `(read_bytes, write_bytes)`; zeros when /proc/<pid>/io is not readable.
    fn read_io(&self, dir: &Path) -> (u64, u64) {
        let Ok(content) = fs::read_to_string(dir.join("io")) else {
            return (0, 0);
        };
        let mut read = 0;
        let mut write = 0;
        for line in content.lines() {
            if let Some(v) = line.strip_prefix("read_bytes:") {
                read = v.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("write_bytes:") {
                write = v.trim().parse().unwrap_or(0);
            }
        }
        (read, write)
    }

    fn count_fds(&self, dir: &Path) -> u32 {
        fs::read_dir(dir.join("fd"))
            .map(|entries| entries.flatten().count() as u32)
            .unwrap_or(0)
    }

    fn cpu_percent(&self, key: ProcessKey, total_ticks: u64, now: Instant) -> f64 {
        let mut samples = lock(&self.cpu_samples);
        let percent = match samples.get(&key) {
            Some(prev) => {
                let tick_delta = total_ticks.saturating_sub(prev.total_ticks);
                let time_delta = now.duration_since(prev.timestamp).as_secs_f64();
                if time_delta > 0.0 {
                    let cpu_seconds = tick_delta as f64 / self.clock_ticks as f64;
                    (cpu_seconds / time_delta) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0, // first sample
        };
        samples.insert(key, CpuSample { total_ticks, timestamp: now });
        percent
    }

    fn read_snapshot(&self, handle: &ProcessHandle) -> Result<Snapshot, SampleError> {
        let pid = handle.pid;
        let stat = self.read_stat(pid)?;
        if handle.start_time.is_some_and(|start| start != stat.start_time) {
            return Err(SampleError::IdentityMismatch { pid });
        }

        let status = ProcessStatus::from_state_char(stat.state);
        if status == ProcessStatus::Zombie {
            if let Some(code) = stat.exit_code {
                lock(&self.exit_codes).insert(handle.key(), code);
            }
        }

        let dir = self.proc_dir(pid);
        let (io_read_bytes, io_write_bytes) = self.read_io(&dir);
        let cpu_percent = self.cpu_percent(handle.key(), stat.utime + stat.stime, Instant::now());

        Ok(Snapshot {
            timestamp: Utc::now(),
            cpu_percent,
            memory_bytes: stat.rss_pages * self.page_size,
            io_read_bytes,
            io_write_bytes,
            thread_count: stat.num_threads,
            open_handle_count: self.count_fds(&dir),
            status,
        })
    }

    fn handle_for(&self, pid: u32) -> Option<ProcessHandle> {
        let stat = self.read_stat(pid).ok()?;
        Some(ProcessHandle {
            pid,
            start_time: Some(stat.start_time),
            name: stat.name,
            command_line: self.read_cmdline(pid),
        })
    }

    fn all_pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect()
    }
}

impl Default for LinuxSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler for LinuxSampler {
    fn discover(
        &self,
        criteria: &[WatchCriterion],
        deadline: Instant,
    ) -> Result<Vec<ProcessHandle>, SampleError> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        // Pid-only watch lists don't need a full /proc scan.
        let pids: Vec<u32> = if criteria.iter().all(|c| c.match_type == MatchType::Pid) {
            criteria.iter().filter_map(|c| c.pattern.parse().ok()).collect()
        } else {
            self.all_pids()
        };

        let mut handles = Vec::new();
        for pid in pids {
            if Instant::now() >= deadline {
                return Err(SampleError::DeadlineExceeded);
            }
            let Some(handle) = self.handle_for(pid) else {
                continue;
            };
            if criteria
                .iter()
                .any(|c| c.matches(handle.pid, &handle.name, &handle.command_line))
            {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    fn sample(&self, handles: &[ProcessHandle], deadline: Instant) -> HashMap<ProcessKey, Snapshot> {
        let mut snapshots = HashMap::with_capacity(handles.len());
        for (idx, handle) in handles.iter().enumerate() {
            if Instant::now() >= deadline {
                debug!("Sample deadline reached, omitting {} processes", handles.len() - idx);
                break;
            }
            match self.read_snapshot(handle) {
                Ok(snapshot) => {
                    snapshots.insert(handle.key(), snapshot);
                }
                Err(e) if e.is_permission_denied() => debug!("Skipping {}: {}", handle.key(), e),
                Err(e) => trace!("Skipping {}: {}", handle.key(), e),
            }
        }

        // Drop CPU baselines for processes no longer tracked
        lock(&self.cpu_samples).retain(|key, _| handles.iter().any(|h| h.key() == *key));
        snapshots
    }

    fn exit_code(&self, handle: &ProcessHandle) -> Option<ExitCode> {
        let cached = lock(&self.exit_codes).remove(&handle.key());
        let live = self.read_stat(handle.pid).ok().and_then(|stat| {
            let same_process = handle.start_time.map_or(true, |s| s == stat.start_time);
            let zombie = ProcessStatus::from_state_char(stat.state) == ProcessStatus::Zombie;
            if same_process && zombie {
                stat.exit_code
            } else {
                None
            }
        });
        live.or(cached).map(ExitCode::from_wait_status)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
