use chrono::Utc;
use crashsense_daemon::{
    config::{Config, WatchCriterion},
    coordinator::Coordinator,
    db::Database,
    error::SampleError,
    model::{ExitCode, ProcessHandle, ProcessKey, ProcessStatus, Snapshot},
    notifier::Notifier,
    protocol::Response,
    publisher::VerdictPublisher,
    sampler::ProcessSampler,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::sync::{broadcast, watch};

/// Processes stay alive until `exit_all`; each one exits with status 0.
#[derive(Default)]
struct Roster {
    alive: Mutex<Vec<ProcessHandle>>,
}

impl Roster {
    fn start(&self, count: u32) {
        let mut alive = self.alive.lock().unwrap();
        for pid in 1000..1000 + count {
            alive.push(ProcessHandle {
                pid,
                start_time: Some(pid as u64),
                name: "worker".to_string(),
                command_line: "/usr/bin/worker".to_string(),
            });
        }
    }

    fn exit_all(&self) {
        self.alive.lock().unwrap().clear();
    }
}

impl ProcessSampler for Roster {
    fn discover(
        &self,
        _criteria: &[WatchCriterion],
        _deadline: Instant,
    ) -> Result<Vec<ProcessHandle>, SampleError> {
        Ok(self.alive.lock().unwrap().clone())
    }

    fn sample(&self, handles: &[ProcessHandle], _deadline: Instant) -> HashMap<ProcessKey, Snapshot> {
        handles
            .iter()
            .map(|h| {
                let snapshot = Snapshot {
                    timestamp: Utc::now(),
                    cpu_percent: 1.0,
                    memory_bytes: 8 * 1024 * 1024,
                    io_read_bytes: 0,
                    io_write_bytes: 0,
                    thread_count: 2,
                    open_handle_count: 8,
                    status: ProcessStatus::Sleeping,
                };
                (h.key(), snapshot)
            })
            .collect()
    }

    fn exit_code(&self, _handle: &ProcessHandle) -> Option<ExitCode> {
        Some(ExitCode::Exited { code: 0 })
    }
}

fn setup() -> (Arc<Roster>, Arc<Coordinator>) {
    let mut config = Config::default();
    config.watch = vec![WatchCriterion::name("worker")];
    let roster = Arc::new(Roster::default());
    let coordinator =
        Coordinator::new(&config, Arc::clone(&roster) as Arc<dyn ProcessSampler>).unwrap();
    (roster, Arc::new(coordinator))
}

fn open_db(path: &Path) -> Database {
    let db = Database::open(path).unwrap();
    db.init_schema().unwrap();
    db
}

async fn emit_exits(roster: &Roster, coordinator: &Coordinator, count: u32) {
    roster.start(count);
    coordinator.tick().await.unwrap();
    coordinator.tick().await.unwrap();
    roster.exit_all();
    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.verdicts.len(), count as usize);
}

#[tokio::test]
async fn test_catch_up_stores_each_missed_verdict_once() {
    let dir = tempdir().unwrap();
    let (roster, coordinator) = setup();
    let (pushes, mut pushed) = broadcast::channel(16);
    let mut publisher = VerdictPublisher::new(
        open_db(&dir.path().join("verdicts.db")),
        Notifier::new(false),
        pushes,
        30,
    )
    .unwrap();

    emit_exits(&roster, &coordinator, 3).await;
    assert_eq!(publisher.catch_up(&coordinator).await, 3);
    assert_eq!(publisher.last_persisted(), 3);
    assert_eq!(publisher.catch_up(&coordinator).await, 0);

    let stored = publisher.database().get_verdicts(0, 100).unwrap();
    let sequences: Vec<u64> = stored.iter().map(|v| v.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    for expected in 1..=3 {
        match pushed.try_recv().unwrap() {
            Response::Verdict { data } => assert_eq!(data.sequence, expected),
            other => panic!("unexpected push: {:?}", other),
        }
    }
    assert!(pushed.try_recv().is_err());
}

#[tokio::test]
async fn test_publisher_resumes_after_stored_sequence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("verdicts.db");
    let (roster, coordinator) = setup();
    emit_exits(&roster, &coordinator, 2).await;

    let (pushes, _) = broadcast::channel(16);
    let mut first = VerdictPublisher::new(open_db(&path), Notifier::new(false), pushes.clone(), 30)
        .unwrap();
    first.catch_up(&coordinator).await;
    drop(first);

    let mut second =
        VerdictPublisher::new(open_db(&path), Notifier::new(false), pushes, 30).unwrap();
    assert_eq!(second.last_persisted(), 2);
    assert_eq!(second.catch_up(&coordinator).await, 0);
}

#[tokio::test]
async fn test_verdicts_from_the_last_tick_survive_stop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("verdicts.db");
    let (roster, coordinator) = setup();
    let (pushes, _) = broadcast::channel(16);
    let publisher =
        VerdictPublisher::new(open_db(&path), Notifier::new(false), pushes, 30).unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(publisher.run(Arc::clone(&coordinator), stop_rx));

    emit_exits(&roster, &coordinator, 1).await;
    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("publisher stops")
        .unwrap();

    let stored = open_db(&path).get_verdicts(0, 10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sequence, 1);
}

#[tokio::test]
async fn test_lagging_publisher_still_stores_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("verdicts.db");
    let (roster, coordinator) = setup();
    let (pushes, _) = broadcast::channel(16);
    let publisher =
        VerdictPublisher::new(open_db(&path), Notifier::new(false), pushes, 30).unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(publisher.run(Arc::clone(&coordinator), stop_rx));
    // Let the publisher subscribe before anything is emitted
    tokio::time::sleep(Duration::from_millis(50)).await;

    // More verdicts in one tick than the verdict channel holds
    emit_exits(&roster, &coordinator, 300).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = open_db(&path).get_verdicts(0, 1000).unwrap();
    assert_eq!(stored.len(), 300);
    assert!(stored.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("publisher stops")
        .unwrap();
}
