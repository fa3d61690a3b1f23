//! Core data types shared by the sampler, history buffer, tracker and classifier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a process across its lifetime.
///
/// The kernel recycles pids, so the start time (clock ticks since boot) is
/// part of the key. `start_time` is `None` only when it could not be read, in
/// which case pid reuse cannot be told apart from a long-running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey {
    pub pid: u32,
    pub start_time: Option<u64>,
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start_time {
            Some(start) => write!(f, "{}@{}", self.pid, start),
            None => write!(f, "{}@?", self.pid),
        }
    }
}

/// One monitored process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub start_time: Option<u64>,
    pub name: String,
    pub command_line: String,
}

impl ProcessHandle {
    pub fn key(&self) -> ProcessKey {
        ProcessKey {
            pid: self.pid,
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Unknown,
}

impl ProcessStatus {
    /// Map the state letter from `/proc/<pid>/stat`.
    pub fn from_state_char(state: char) -> Self {
        match state {
            'R' => ProcessStatus::Running,
            'S' | 'D' | 'I' | 'P' | 'W' => ProcessStatus::Sleeping,
            'T' | 't' => ProcessStatus::Stopped,
            'Z' | 'X' | 'x' => ProcessStatus::Zombie,
            _ => ProcessStatus::Unknown,
        }
    }
}

/// One resource reading for a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub thread_count: u32,
    pub open_handle_count: u32,
    pub status: ProcessStatus,
}

/// How a process ended, decoded from a wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitCode {
    Exited { code: i32 },
    Signaled { signal: i32, core_dumped: bool },
}

impl ExitCode {
    /// Decode a raw status as returned by `waitpid(2)` or stored in
    /// `/proc/<pid>/stat` field 52.
    pub fn from_wait_status(status: i32) -> Self {
        let signal = status & 0x7f;
        if signal == 0 {
            ExitCode::Exited {
                code: (status >> 8) & 0xff,
            }
        } else {
            ExitCode::Signaled {
                signal,
                core_dumped: status & 0x80 != 0,
            }
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Exited { code } => write!(f, "exit {}", code),
            ExitCode::Signaled {
                signal,
                core_dumped: true,
            } => write!(f, "{} (core dumped)", signal_name(*signal)),
            ExitCode::Signaled { signal, .. } => write!(f, "{}", signal_name(*signal)),
        }
    }
}

pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSYS => "SIGSYS",
        _ => return format!("signal {}", signal),
    };
    name.to_string()
}

/// A tracked process disappeared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub process_handle: ProcessHandle,
    /// `None` when the process vanished before it was ever sampled.
    pub last_seen_snapshot: Option<Snapshot>,
    pub exit_code: Option<ExitCode>,
    pub detected_at: DateTime<Utc>,
    pub identity_verified: bool,
    #[serde(default)]
    pub host_memory_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    NormalExit,
    Crash,
    Unknown,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::NormalExit => "normal_exit",
            Classification::Crash => "crash",
            Classification::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leaning {
    Crash,
    Normal,
    Neutral,
}

/// One signal that fired during classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub signal: String,
    pub detail: String,
    pub weight: f64,
    pub leaning: Leaning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub exit_event: ExitEvent,
    pub classification: Classification,
    pub confidence: f64,
    pub crash_score: f64,
    pub contributing_factors: Vec<Factor>,
}

impl Verdict {
    pub fn has_factor(&self, signal: &str) -> bool {
        self.contributing_factors.iter().any(|f| f.signal == signal)
    }
}

/// A verdict with its position in the verdict log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedVerdict {
    pub sequence: u64,
    pub verdict: Verdict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wait_status() {
        assert_eq!(ExitCode::from_wait_status(0), ExitCode::Exited { code: 0 });
        assert_eq!(ExitCode::from_wait_status(3 << 8), ExitCode::Exited { code: 3 });
        assert_eq!(
            ExitCode::from_wait_status(libc::SIGSEGV | 0x80),
            ExitCode::Signaled {
                signal: libc::SIGSEGV,
                core_dumped: true
            }
        );
        assert_eq!(
            ExitCode::from_wait_status(libc::SIGTERM),
            ExitCode::Signaled {
                signal: libc::SIGTERM,
                core_dumped: false
            }
        );
    }

    #[test]
    fn exit_code_display() {
        let code = ExitCode::Signaled {
            signal: libc::SIGABRT,
            core_dumped: true,
        };
        assert_eq!(code.to_string(), "SIGABRT (core dumped)");
        assert_eq!(signal_name(64), "signal 64");
    }

    #[test]
    fn key_display_marks_missing_start_time() {
        let key = ProcessKey {
            pid: 42,
            start_time: None,
        };
        assert_eq!(key.to_string(), "42@?");
    }
}
