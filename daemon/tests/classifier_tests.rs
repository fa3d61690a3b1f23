use chrono::{TimeZone, Utc};
use crashsense_daemon::{
    classifier::{Classifier, RuleClassifier},
    config::ClassifierConfig,
    history::HistoryWindow,
    model::{Classification, ExitCode, ExitEvent, ProcessHandle, ProcessStatus, Snapshot},
};

const MB: u64 = 1024 * 1024;

fn snap(secs: i64, cpu_percent: f64, memory_mb: u64, thread_count: u32) -> Snapshot {
    Snapshot {
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        cpu_percent,
        memory_bytes: memory_mb * MB,
        io_read_bytes: 0,
        io_write_bytes: 0,
        thread_count,
        open_handle_count: 10,
        status: ProcessStatus::Running,
    }
}

fn event(exit_code: Option<ExitCode>) -> ExitEvent {
    ExitEvent {
        process_handle: ProcessHandle {
            pid: 4321,
            start_time: Some(99),
            name: "app".to_string(),
            command_line: "/opt/app/bin/app".to_string(),
        },
        last_seen_snapshot: None,
        exit_code,
        detected_at: Utc::now(),
        identity_verified: true,
        host_memory_percent: None,
    }
}

/// Every crash-leaning heuristic fires on this window.
fn runaway_window() -> HistoryWindow {
    HistoryWindow::from_snapshots(vec![
        snap(1, 10.0, 50, 4),
        snap(2, 10.0, 50, 4),
        snap(3, 95.0, 100, 4),
        snap(4, 95.0, 200, 4),
        snap(5, 95.0, 800, 16),
    ])
}

fn quiet_window(n: i64) -> HistoryWindow {
    HistoryWindow::from_snapshots((1..=n).map(|i| snap(i, 2.0, 10, 4)))
}

#[test]
fn test_clean_exit_beats_every_heuristic() {
    let classifier = RuleClassifier::default();
    let verdict = classifier.classify(&event(Some(ExitCode::Exited { code: 0 })), &runaway_window());
    assert!(verdict.has_factor("memory_trend"));
    assert!(verdict.has_factor("cpu_spike"));
    assert!(verdict.has_factor("thread_surge"));
    assert_eq!(verdict.classification, Classification::NormalExit);
    assert!(verdict.confidence > 0.4);
}

#[test]
fn test_fault_signal_beats_quiet_history() {
    let classifier = RuleClassifier::default();
    for signal in [libc::SIGSEGV, libc::SIGABRT, libc::SIGBUS] {
        let code = ExitCode::Signaled {
            signal,
            core_dumped: false,
        };
        let verdict = classifier.classify(&event(Some(code)), &quiet_window(10));
        assert!(verdict.has_factor("quiescent"));
        assert_eq!(verdict.classification, Classification::Crash);
    }
}

#[test]
fn test_no_evidence_is_unknown() {
    let verdict = RuleClassifier::default().classify(&event(None), &HistoryWindow::new());
    assert_eq!(verdict.classification, Classification::Unknown);
    assert_eq!(verdict.confidence, 0.0);
    assert_eq!(verdict.crash_score, 0.5);
    assert!(verdict.has_factor("insufficient_history"));
}

#[test]
fn test_classification_is_idempotent() {
    let classifier = RuleClassifier::default();
    let event = event(Some(ExitCode::Exited { code: 1 }));
    let window = runaway_window();
    assert_eq!(classifier.classify(&event, &window), classifier.classify(&event, &window));
}

#[test]
fn test_flat_usage_then_exit_zero_is_normal() {
    let verdict =
        RuleClassifier::default().classify(&event(Some(ExitCode::Exited { code: 0 })), &quiet_window(10));
    assert_eq!(verdict.classification, Classification::NormalExit);
    assert_eq!(verdict.confidence, 1.0);
}

#[test]
fn test_memory_blowup_without_exit_code_is_crash() {
    let window = HistoryWindow::from_snapshots(vec![
        snap(1, 5.0, 50, 4),
        snap(2, 5.0, 200, 4),
        snap(3, 5.0, 800, 4),
    ]);
    let verdict = RuleClassifier::default().classify(&event(None), &window);
    assert_eq!(verdict.classification, Classification::Crash);
    assert_eq!(verdict.contributing_factors[0].signal, "memory_trend");
}

#[test]
fn test_sigkill_alone_is_unknown() {
    let code = ExitCode::Signaled {
        signal: libc::SIGKILL,
        core_dumped: false,
    };
    let verdict = RuleClassifier::default().classify(&event(Some(code)), &HistoryWindow::new());
    assert_eq!(verdict.classification, Classification::Unknown);
    assert!(verdict.has_factor("killed"));
}

#[test]
fn test_zombie_snapshots_are_not_evidence() {
    let mut snapshots: Vec<Snapshot> = (1..=3).map(|i| snap(i, 1.0, 40, 4)).collect();
    let mut zombie = snap(4, 0.0, 0, 1);
    zombie.status = ProcessStatus::Zombie;
    snapshots.push(zombie);

    let verdict =
        RuleClassifier::default().classify(&event(None), &HistoryWindow::from_snapshots(snapshots));
    assert!(!verdict.has_factor("memory_released"));
    assert!(verdict.has_factor("quiescent"));
}

#[test]
fn test_neutral_factors_are_reported() {
    let mut event = event(None);
    event.identity_verified = false;
    event.process_handle.start_time = None;
    let verdict = RuleClassifier::default().classify(&event, &HistoryWindow::new());
    assert!(verdict.has_factor("unverified_identity"));
    assert!(verdict.has_factor("insufficient_history"));
}

#[test]
fn test_host_pressure_needs_process_history() {
    let classifier = RuleClassifier::new(ClassifierConfig {
        crash_threshold: 0.55,
        normal_threshold: 0.45,
        ..ClassifierConfig::default()
    });
    let mut event = event(None);
    event.host_memory_percent = Some(97.0);

    let verdict = classifier.classify(&event, &HistoryWindow::new());
    assert_eq!(verdict.classification, Classification::Unknown);
    assert_eq!(verdict.confidence, 0.0);
    assert!(!verdict.has_factor("host_memory_pressure"));

    let window = HistoryWindow::from_snapshots(vec![snap(1, 20.0, 100, 4), snap(2, 20.0, 100, 4)]);
    let verdict = classifier.classify(&event, &window);
    assert!(verdict.has_factor("host_memory_pressure"));
    assert!(verdict.crash_score > 0.5);

    let weights: Vec<f64> = verdict.contributing_factors.iter().map(|f| f.weight).collect();
    assert!(weights.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_exit_status_dominates_for_any_valid_thresholds() {
    let segv = ExitCode::Signaled {
        signal: libc::SIGSEGV,
        core_dumped: false,
    };
    for crash_threshold in [0.5, 0.55, 0.6, 0.7, 0.8, 0.9, 1.0] {
        for normal_threshold in [0.0, 0.1, 0.3, 0.4, 0.45, 0.5] {
            let classifier = RuleClassifier::new(ClassifierConfig {
                crash_threshold,
                normal_threshold,
                ..ClassifierConfig::default()
            });
            let label = format!("crash {} / normal {}", crash_threshold, normal_threshold);

            let verdict = classifier.classify(&event(Some(segv)), &quiet_window(10));
            assert_eq!(verdict.classification, Classification::Crash, "{}", label);

            let clean = event(Some(ExitCode::Exited { code: 0 }));
            let verdict = classifier.classify(&clean, &runaway_window());
            assert_eq!(verdict.classification, Classification::NormalExit, "{}", label);
            assert!(verdict.confidence > normal_threshold, "{}", label);

            let mut pressured = event(None);
            pressured.host_memory_percent = Some(99.0);
            let verdict = classifier.classify(&pressured, &HistoryWindow::new());
            assert_eq!(verdict.classification, Classification::Unknown, "{}", label);
            assert_eq!(verdict.confidence, 0.0, "{}", label);
        }
    }
}
