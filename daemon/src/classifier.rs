//! Crash classification engine
//!
//! Every signal is a weighted vote for or against "crash". Exit status
//! signals count in full; resource heuristics are capped per direction so
//! that a decisive exit status always wins over trends.

use crate::config::ClassifierConfig;
use crate::history::HistoryWindow;
use crate::model::{
    signal_name, Classification, ExitCode, ExitEvent, Factor, Leaning, ProcessStatus, Snapshot,
    Verdict,
};

const DECISIVE_WEIGHT: f64 = 0.8;
const HEURISTIC_CAP: f64 = 0.5;
const MIN_HISTORY: usize = 2;
const MIN_IDLE_SAMPLES: usize = 3;
const HOST_MEMORY_PRESSURE_PERCENT: f64 = 95.0;
const MIB: f64 = 1024.0 * 1024.0;

const FAULT_SIGNALS: [i32; 7] = [
    libc::SIGSEGV,
    libc::SIGABRT,
    libc::SIGILL,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGSYS,
    libc::SIGTRAP,
];
const GRACEFUL_SIGNALS: [i32; 5] = [
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGPIPE,
];

pub trait Classifier: Send + Sync {
    fn classify(&self, event: &ExitEvent, window: &HistoryWindow) -> Verdict;
}

/// Deterministic rule-weighted scorer.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    config: ClassifierConfig,
}

impl RuleClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    fn trend_factors(&self, evidence: &[&Snapshot]) -> Vec<Factor> {
        let mut factors = Vec::new();
        let k = self.config.trend_samples.max(2).min(evidence.len());
        let (earlier, tail) = evidence.split_at(evidence.len() - k);
        let first = tail[0];
        let last = tail[k - 1];

        // Memory slope across the trailing samples
        let base = (first.memory_bytes as f64).max(MIB);
        let delta = last.memory_bytes as f64 - first.memory_bytes as f64;
        let growth = delta / base;
        let seconds = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if growth >= self.config.memory_growth_ratio {
            let rate = if seconds > 0.0 { delta / MIB / seconds } else { 0.0 };
            factors.push(factor(
                "memory_trend",
                format!(
                    "memory grew {:.0} MiB -> {:.0} MiB over the last {} samples ({:.1} MiB/s)",
                    first.memory_bytes as f64 / MIB,
                    last.memory_bytes as f64 / MIB,
                    k,
                    rate
                ),
                0.35,
                Leaning::Crash,
            ));
        } else if growth <= -0.5 {
            factors.push(factor(
                "memory_released",
                format!("memory fell by {:.0}% before exit", -growth * 100.0),
                0.2,
                Leaning::Normal,
            ));
        }

        // CPU jump relative to the rest of the window
        if !earlier.is_empty() {
            let tail_cpu = mean(tail.iter().map(|s| s.cpu_percent));
            let earlier_cpu = mean(earlier.iter().map(|s| s.cpu_percent));
            if tail_cpu >= self.config.cpu_spike_percent && tail_cpu - earlier_cpu >= 30.0 {
                factors.push(factor(
                    "cpu_spike",
                    format!("cpu averaged {:.0}% before exit vs {:.0}% earlier", tail_cpu, earlier_cpu),
                    0.25,
                    Leaning::Crash,
                ));
            }
        }

        let threads_doubled = first.thread_count > 0
            && last.thread_count >= first.thread_count * 2
            && last.thread_count - first.thread_count >= 4;
        let handles_doubled = first.open_handle_count > 0
            && last.open_handle_count >= first.open_handle_count * 2
            && last.open_handle_count - first.open_handle_count >= 16;
        if threads_doubled || handles_doubled {
            factors.push(factor(
                "thread_surge",
                format!(
                    "threads {} -> {}, open handles {} -> {}",
                    first.thread_count,
                    last.thread_count,
                    first.open_handle_count,
                    last.open_handle_count
                ),
                0.15,
                Leaning::Crash,
            ));
        }

        // Low, flat usage right before exit
        let idle_n = self.config.idle_samples.min(evidence.len());
        if idle_n >= MIN_IDLE_SAMPLES {
            let idle = &evidence[evidence.len() - idle_n..];
            let max_cpu = idle.iter().map(|s| s.cpu_percent).fold(0.0, f64::max);
            let max_mem = idle.iter().map(|s| s.memory_bytes).max().unwrap_or(0) as f64;
            let min_mem = idle.iter().map(|s| s.memory_bytes).min().unwrap_or(0) as f64;
            let mean_mem = mean(idle.iter().map(|s| s.memory_bytes as f64));
            if max_cpu <= self.config.idle_cpu_percent && max_mem - min_mem <= 0.05 * mean_mem {
                factors.push(factor(
                    "quiescent",
                    format!(
                        "cpu <= {:.1}% and memory flat at {:.0} MiB for {} samples",
                        max_cpu,
                        mean_mem / MIB,
                        idle_n
                    ),
                    0.3,
                    Leaning::Normal,
                ));
            }
        }

        factors
    }

    fn verdict_for(&self, score: f64) -> (Classification, f64) {
        if score > self.config.crash_threshold {
            (Classification::Crash, score)
        } else if score < self.config.normal_threshold {
            (Classification::NormalExit, 1.0 - score)
        } else {
            (Classification::Unknown, (2.0 * score - 1.0).abs())
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, event: &ExitEvent, window: &HistoryWindow) -> Verdict {
        let exit_factor = event.exit_code.map(exit_code_factor);

        // A zombie's counters are already torn down; they are not evidence.
        let evidence: Vec<&Snapshot> = window
            .iter()
            .filter(|s| s.status != ProcessStatus::Zombie)
            .collect();

        // Host-level signals only corroborate a process's own history.
        let enough_history = evidence.len() >= MIN_HISTORY;
        let mut heuristics = Vec::new();
        if enough_history {
            heuristics.extend(self.trend_factors(&evidence));
            if let Some(percent) = event.host_memory_percent {
                if percent >= HOST_MEMORY_PRESSURE_PERCENT {
                    heuristics.push(factor(
                        "host_memory_pressure",
                        format!("host memory at {:.1}% when the exit was detected", percent),
                        0.2,
                        Leaning::Crash,
                    ));
                }
            }
        }

        let crash_votes = exit_factor.iter().map(|f| vote(f, Leaning::Crash)).sum::<f64>()
            + capped(&heuristics, Leaning::Crash);
        let normal_votes = exit_factor.iter().map(|f| vote(f, Leaning::Normal)).sum::<f64>()
            + capped(&heuristics, Leaning::Normal);
        let crash_score = (0.5 + (crash_votes - normal_votes) / 2.0).clamp(0.0, 1.0);
        let (classification, confidence) = match exit_factor.as_ref() {
            // A clean exit or a fault signal settles the outcome whatever the
            // thresholds; the score only sets the confidence.
            Some(f) if f.weight >= DECISIVE_WEIGHT && f.leaning == Leaning::Crash => {
                (Classification::Crash, crash_score)
            }
            Some(f) if f.weight >= DECISIVE_WEIGHT && f.leaning == Leaning::Normal => {
                (Classification::NormalExit, 1.0 - crash_score)
            }
            None if !enough_history => (Classification::Unknown, 0.0),
            _ => self.verdict_for(crash_score),
        };

        let mut factors: Vec<Factor> = exit_factor.into_iter().chain(heuristics).collect();
        if !enough_history {
            factors.push(factor(
                "insufficient_history",
                format!("{} usable snapshots", evidence.len()),
                0.0,
                Leaning::Neutral,
            ));
        }
        if !event.identity_verified {
            factors.push(factor(
                "unverified_identity",
                "start time unavailable, pid reuse cannot be ruled out".to_string(),
                0.0,
                Leaning::Neutral,
            ));
        }
        if factors.is_empty() {
            factors.push(factor(
                "no_signal",
                "no exit status and no resource anomaly".to_string(),
                0.0,
                Leaning::Neutral,
            ));
        }
        factors.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        Verdict {
            exit_event: event.clone(),
            classification,
            confidence,
            crash_score,
            contributing_factors: factors,
        }
    }
}

fn exit_code_factor(code: ExitCode) -> Factor {
    match code {
        ExitCode::Exited { code: 0 } => factor(
            "clean_exit",
            "exited with status 0".to_string(),
            DECISIVE_WEIGHT,
            Leaning::Normal,
        ),
        // Shells report death-by-signal N as 128 + N
        ExitCode::Exited { code } if code > 128 && code < 128 + 65 => {
            signal_factor(code - 128, format!("exit status {} (128 + {})", code, signal_name(code - 128)))
        }
        ExitCode::Exited { code } => factor(
            "error_exit_code",
            format!("exited with status {}", code),
            0.3,
            Leaning::Crash,
        ),
        ExitCode::Signaled { signal, .. } => signal_factor(signal, code.to_string()),
    }
}

fn signal_factor(signal: i32, detail: String) -> Factor {
    if FAULT_SIGNALS.contains(&signal) {
        factor("fatal_signal", detail, DECISIVE_WEIGHT, Leaning::Crash)
    } else if GRACEFUL_SIGNALS.contains(&signal) {
        factor("graceful_signal", detail, 0.6, Leaning::Normal)
    } else if signal == libc::SIGKILL {
        factor("killed", detail, 0.15, Leaning::Crash)
    } else {
        factor("other_signal", detail, 0.15, Leaning::Crash)
    }
}

fn factor(signal: &str, detail: String, weight: f64, leaning: Leaning) -> Factor {
    Factor {
        signal: signal.to_string(),
        detail,
        weight,
        leaning,
    }
}

fn vote(factor: &Factor, leaning: Leaning) -> f64 {
    if factor.leaning == leaning {
        factor.weight
    } else {
        0.0
    }
}

fn capped(factors: &[Factor], leaning: Leaning) -> f64 {
    factors
        .iter()
        .map(|f| vote(f, leaning))
        .sum::<f64>()
        .min(HEURISTIC_CAP)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_style_exit_codes_map_to_signals() {
        let f = exit_code_factor(ExitCode::Exited { code: 139 });
        assert_eq!(f.signal, "fatal_signal");
        assert!(f.detail.contains("SIGSEGV"));
        let f = exit_code_factor(ExitCode::Exited { code: 143 });
        assert_eq!(f.signal, "graceful_signal");
        let f = exit_code_factor(ExitCode::Exited { code: 2 });
        assert_eq!(f.signal, "error_exit_code");
    }

    #[test]
    fn heuristics_are_capped() {
        let factors = vec![
            factor("a", String::new(), 0.35, Leaning::Crash),
            factor("b", String::new(), 0.25, Leaning::Crash),
            factor("c", String::new(), 0.2, Leaning::Normal),
        ];
        assert_eq!(capped(&factors, Leaning::Crash), HEURISTIC_CAP);
        assert!((capped(&factors, Leaning::Normal) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean(std::iter::empty()), 0.0);
        assert_eq!(mean([2.0, 4.0].into_iter()), 3.0);
    }
}
