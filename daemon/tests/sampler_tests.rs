use crashsense_daemon::{
    config::WatchCriterion,
    error::SampleError,
    model::{ExitCode, ProcessStatus},
    sampler::{LinuxSampler, ProcessSampler},
    system::SystemSampler,
};
use std::process::Command;
use std::time::{Duration, Instant};

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn test_discover_finds_current_process() {
    let sampler = LinuxSampler::new();
    let current_pid = std::process::id();
    let handles = sampler.discover(&[WatchCriterion::pid(current_pid)], deadline()).unwrap();
    assert_eq!(handles.len(), 1, "Current process should be discovered");
    assert_eq!(handles[0].pid, current_pid);
    assert!(handles[0].start_time.is_some());
    assert!(!handles[0].name.is_empty());
}

#[test]
fn test_sample_current_process() {
    let sampler = LinuxSampler::new();
    let handles = sampler.discover(&[WatchCriterion::pid(std::process::id())], deadline()).unwrap();
    let snapshots = sampler.sample(&handles, deadline());
    let snapshot = snapshots.get(&handles[0].key()).expect("snapshot for self");
    assert!(snapshot.memory_bytes > 0);
    assert!(snapshot.thread_count >= 1);
    assert!(snapshot.open_handle_count >= 1);
    assert_ne!(snapshot.status, ProcessStatus::Zombie);
    assert_eq!(sampler.exit_code(&handles[0]), None);
}

#[test]
fn test_discover_ignores_missing_pid() {
    let sampler = LinuxSampler::new();
    assert!(sampler.discover(&[WatchCriterion::pid(999_999_999)], deadline()).unwrap().is_empty());
    assert!(sampler.discover(&[], deadline()).unwrap().is_empty());
}

#[test]
fn test_discover_gives_up_at_deadline() {
    let sampler = LinuxSampler::new();
    let result = sampler.discover(&[WatchCriterion::name("sh")], Instant::now());
    assert!(matches!(result, Err(SampleError::DeadlineExceeded)));
}

#[test]
fn test_stale_start_time_is_not_sampled() {
    let sampler = LinuxSampler::new();
    let mut handles = sampler.discover(&[WatchCriterion::pid(std::process::id())], deadline()).unwrap();
    handles[0].start_time = handles[0].start_time.map(|s| s + 1);
    assert!(sampler.sample(&handles, deadline()).is_empty());
}

#[test]
fn test_exit_code_of_zombie_child() {
    let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
    let sampler = LinuxSampler::new();
    let handles = sampler.discover(&[WatchCriterion::pid(child.id())], deadline()).unwrap();
    assert_eq!(handles.len(), 1);

    // Not reaped yet, so it lingers as a zombie
    let give_up = Instant::now() + Duration::from_secs(5);
    let mut zombie = false;
    while Instant::now() < give_up {
        let snapshots = sampler.sample(&handles, deadline());
        if snapshots.get(&handles[0].key()).map(|s| s.status) == Some(ProcessStatus::Zombie) {
            zombie = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(zombie, "child should become a zombie");

    child.wait().unwrap();
    // Remembered from the zombie reading even after reaping
    assert_eq!(sampler.exit_code(&handles[0]), Some(ExitCode::Exited { code: 3 }));
    assert_eq!(sampler.exit_code(&handles[0]), None);
}

#[test]
fn test_system_sampler_reads_host() {
    let sampler = SystemSampler::new();
    let snapshot = sampler.sample();
    assert!(snapshot.memory_total_bytes > 0);
    assert!(snapshot.memory_percent > 0.0 && snapshot.memory_percent <= 100.0);
    assert!(snapshot.process_count > 0);

    let normalized = snapshot.normalize();
    assert!((0.0..=1.0).contains(&normalized.memory_percent));
}
