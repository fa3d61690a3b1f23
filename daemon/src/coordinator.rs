//! Monitoring loop: sample, record, diff liveness, classify, publish

use crate::classifier::{Classifier, RuleClassifier};
use crate::config::{Config, WatchCriterion};
use crate::error::{ConfigError, MonitorError, SampleError};
use crate::history::HistoryBuffer;
use crate::liveness::LivenessTracker;
use crate::model::{
    ExitCode, ExitEvent, ProcessHandle, ProcessKey, ProcessStatus, SequencedVerdict, Snapshot,
    Verdict,
};
use crate::sampler::ProcessSampler;
use crate::system::{SystemSampler, SystemSnapshot};
use crate::verdicts::VerdictLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Discovered, not sampled yet.
    Pending,
    Active,
    /// Gone; waiting for its verdict.
    Exited,
    /// Verdict published and history purged.
    Classified,
}

impl TargetState {
    pub fn can_transition_to(self, next: TargetState) -> bool {
        matches!(
            (self, next),
            (TargetState::Pending, TargetState::Active)
                | (TargetState::Pending, TargetState::Exited)
                | (TargetState::Active, TargetState::Exited)
                | (TargetState::Exited, TargetState::Classified)
        )
    }
}

#[derive(Debug, Clone)]
struct Target {
    handle: ProcessHandle,
    state: TargetState,
    first_seen: DateTime<Utc>,
}

impl Target {
    fn advance(&mut self, next: TargetState) {
        if self.state == next {
            return;
        }
        if self.state.can_transition_to(next) {
            trace!("{} {:?} -> {:?}", self.handle.key(), self.state, next);
            self.state = next;
        } else {
            warn!(
                "Ignoring invalid transition {:?} -> {:?} for {}",
                self.state,
                next,
                self.handle.key()
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub handle: ProcessHandle,
    pub state: TargetState,
    pub first_seen: DateTime<Utc>,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetrics {
    pub handle: ProcessHandle,
    pub snapshot: Snapshot,
}

/// Read-only view handed to API consumers. Replaced wholesale every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub active_targets: Vec<TargetSummary>,
    pub pending_targets: usize,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Verdicts emitted since this process started.
    pub verdict_count: u64,
    pub last_sequence: u64,
    pub tick_count: u64,
    pub skipped_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub running: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct Published {
    status: StatusSnapshot,
    metrics: Vec<TargetMetrics>,
    system: Option<SystemSnapshot>,
}

/// What one tick changed.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub discovered: usize,
    pub sampled: usize,
    pub newly_tracked: usize,
    pub verdicts: Vec<SequencedVerdict>,
}

struct Observation {
    /// Processes still running. Zombies are already gone.
    handles: Vec<ProcessHandle>,
    snapshots: HashMap<ProcessKey, Snapshot>,
    /// Exit statuses of previously tracked processes missing from `handles`.
    exit_codes: HashMap<ProcessKey, ExitCode>,
    system: Option<SystemSnapshot>,
}

type ObservationTask = JoinHandle<Result<Observation, SampleError>>;

/// Blocking half of a tick: everything that touches /proc.
fn observe_blocking(
    sampler: &dyn ProcessSampler,
    system_sampler: Option<&SystemSampler>,
    criteria: &[WatchCriterion],
    tracked: &[ProcessHandle],
    deadline: Instant,
) -> Result<Observation, SampleError> {
    let mut handles = sampler.discover(criteria, deadline)?;
    let mut snapshots = sampler.sample(&handles, deadline);

    // Exited but not yet reaped by its parent
    let zombies: HashSet<ProcessKey> = snapshots
        .iter()
        .filter(|(_, s)| s.status == ProcessStatus::Zombie)
        .map(|(key, _)| *key)
        .collect();
    if !zombies.is_empty() {
        snapshots.retain(|key, _| !zombies.contains(key));
        handles.retain(|h| !zombies.contains(&h.key()));
    }

    let live: HashSet<ProcessKey> = handles.iter().map(ProcessHandle::key).collect();
    let exit_codes = tracked
        .iter()
        .filter(|h| !live.contains(&h.key()))
        .filter_map(|h| sampler.exit_code(h).map(|code| (h.key(), code)))
        .collect();

    Ok(Observation {
        handles,
        snapshots,
        exit_codes,
        system: system_sampler.map(SystemSampler::sample),
    })
}

/// Live monitoring state. Only the tick loop writes it.
struct MonitorState {
    tracker: LivenessTracker,
    history: HistoryBuffer,
    targets: HashMap<ProcessKey, Target>,
    system_history: VecDeque<SystemSnapshot>,
    system_capacity: usize,
}

impl MonitorState {
    fn apply(
        &mut self,
        observation: Observation,
        now: DateTime<Utc>,
        classifier: &dyn Classifier,
    ) -> (usize, Vec<Verdict>) {
        let Observation {
            handles,
            snapshots,
            exit_codes,
            system,
        } = observation;
        let diff = self.tracker.observe(handles);

        for handle in &diff.newly_seen {
            debug!("Tracking {} ({})", handle.key(), handle.name);
            self.targets.insert(
                handle.key(),
                Target {
                    handle: handle.clone(),
                    state: TargetState::Pending,
                    first_seen: now,
                },
            );
        }

        for (key, snapshot) in snapshots {
            if let Some(target) = self.targets.get_mut(&key) {
                self.history.record(key, snapshot);
                target.advance(TargetState::Active);
            }
        }

        let host_memory_percent = system.as_ref().map(|s| s.memory_percent);
        if let Some(system) = system {
            self.system_history.push_back(system);
            while self.system_history.len() > self.system_capacity {
                self.system_history.pop_front();
            }
        }

        let mut verdicts = Vec::with_capacity(diff.disappeared.len());
        for handle in diff.disappeared {
            let key = handle.key();
            if let Some(target) = self.targets.get_mut(&key) {
                target.advance(TargetState::Exited);
            }

            let event = ExitEvent {
                last_seen_snapshot: self.history.latest(&key).cloned(),
                exit_code: exit_codes.get(&key).copied(),
                detected_at: now,
                identity_verified: handle.start_time.is_some(),
                host_memory_percent,
                process_handle: handle,
            };
            let window = self.history.window_for(&key);
            let verdict = classifier.classify(&event, &window);
            info!(
                "{} (pid {}) exited: {} (confidence {:.2})",
                event.process_handle.name,
                key.pid,
                verdict.classification.as_str(),
                verdict.confidence
            );

            if let Some(mut target) = self.targets.remove(&key) {
                target.advance(TargetState::Classified);
            }
            self.history.purge(&key);
            verdicts.push(verdict);
        }

        (diff.newly_seen.len(), verdicts)
    }

    fn summaries(&self) -> (Vec<TargetSummary>, usize) {
        let mut active: Vec<TargetSummary> = self
            .targets
            .values()
            .filter(|t| t.state == TargetState::Active)
            .map(|t| TargetSummary {
                handle: t.handle.clone(),
                state: t.state,
                first_seen: t.first_seen,
                samples: self.history.snapshot_count(&t.handle.key()),
            })
            .collect();
        active.sort_by_key(|t| t.handle.key());
        let pending = self
            .targets
            .values()
            .filter(|t| t.state == TargetState::Pending)
            .count();
        (active, pending)
    }

    fn metrics(&self) -> Vec<TargetMetrics> {
        let mut metrics: Vec<TargetMetrics> = self
            .targets
            .values()
            .filter_map(|t| {
                self.history.latest(&t.handle.key()).map(|s| TargetMetrics {
                    handle: t.handle.clone(),
                    snapshot: s.clone(),
                })
            })
            .collect();
        metrics.sort_by_key(|m| m.handle.key());
        metrics
    }
}

pub struct Coordinator {
    criteria: Vec<WatchCriterion>,
    poll_interval: Duration,
    sample_timeout: Duration,
    sampler: Arc<dyn ProcessSampler>,
    system_sampler: Option<Arc<SystemSampler>>,
    classifier: Box<dyn Classifier>,
    /// Held for a whole tick so ticks never overlap.
    tick_lock: Mutex<()>,
    /// Sampling pass that outlived its tick. No new pass starts until it ends.
    in_flight: Mutex<Option<ObservationTask>>,
    state: Mutex<MonitorState>,
    verdicts: RwLock<VerdictLog>,
    published: RwLock<Arc<Published>>,
    verdict_tx: broadcast::Sender<SequencedVerdict>,
    running: AtomicBool,
    tick_count: AtomicU64,
    skipped_ticks: AtomicU64,
    emitted: AtomicU64,
}

impl Coordinator {
    /// Fails on an invalid configuration; nothing is started.
    pub fn new(config: &Config, sampler: Arc<dyn ProcessSampler>) -> Result<Self, ConfigError> {
        config.validate()?;
        let (verdict_tx, _) = broadcast::channel(256);
        Ok(Self {
            criteria: config.watch.clone(),
            poll_interval: config.poll_interval(),
            sample_timeout: config.sample_timeout(),
            sampler,
            system_sampler: None,
            classifier: Box::new(RuleClassifier::new(config.classifier.clone())),
            tick_lock: Mutex::new(()),
            in_flight: Mutex::new(None),
            state: Mutex::new(MonitorState {
                tracker: LivenessTracker::new(),
                history: HistoryBuffer::new(
                    config.history.max_snapshots,
                    config.history.window_seconds,
                ),
                targets: HashMap::new(),
                system_history: VecDeque::new(),
                system_capacity: config.history.max_snapshots,
            }),
            verdicts: RwLock::new(VerdictLog::new(config.history.max_verdicts)),
            published: RwLock::new(Arc::new(Published::default())),
            verdict_tx,
            running: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        })
    }

    pub fn with_system_sampler(mut self, sampler: Arc<SystemSampler>) -> Self {
        self.system_sampler = Some(sampler);
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Continue verdict numbering after a previously published sequence.
    pub async fn rehydrate(&self, last_sequence: u64) {
        let mut log = self.verdicts.write().await;
        log.resume_from(last_sequence);
        info!("Resuming verdict sequence after {}", log.last_sequence());
    }

    /// Receive every verdict as it is emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<SequencedVerdict> {
        self.verdict_tx.subscribe()
    }

    /// Run ticks until `shutdown` flips to true or its sender is dropped.
    /// A tick in progress always completes first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Monitoring loop started ({} watch criteria, every {:?})",
            self.criteria.len(),
            self.poll_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Tick skipped: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Monitoring loop stopped");
    }

    /// One pass of the loop. On a sampling timeout nothing is diffed, so a
    /// slow /proc cannot be mistaken for processes exiting. While a timed out
    /// pass is still running, further ticks are skipped.
    pub async fn tick(&self) -> Result<TickReport, MonitorError> {
        let _tick = self.tick_lock.lock().await;
        let tracked = self.state.lock().await.tracker.handles();
        let observation = match self.observe(tracked).await {
            Ok(observation) => observation,
            Err(e) => {
                self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let now = Utc::now();
        let discovered = observation.handles.len();
        let sampled = observation.snapshots.len();

        let mut state = self.state.lock().await;
        let (newly_tracked, verdicts) = state.apply(observation, now, self.classifier.as_ref());

        let sequenced: Vec<SequencedVerdict> = {
            let mut log = self.verdicts.write().await;
            verdicts.into_iter().map(|v| log.append(v)).collect()
        };
        self.emitted
            .fetch_add(sequenced.len() as u64, Ordering::Relaxed);
        for verdict in &sequenced {
            let _ = self.verdict_tx.send(verdict.clone());
        }

        let tick_count = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let (active_targets, pending_targets) = state.summaries();
        let published = Published {
            status: StatusSnapshot {
                active_targets,
                pending_targets,
                last_tick_at: Some(now),
                verdict_count: self.emitted.load(Ordering::Relaxed),
                last_sequence: self.verdicts.read().await.last_sequence(),
                tick_count,
                skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            },
            metrics: state.metrics(),
            system: state.system_history.back().cloned(),
        };
        drop(state);
        *self.published.write().await = Arc::new(published);

        trace!(
            "Tick {}: {} discovered, {} sampled, {} verdicts",
            tick_count,
            discovered,
            sampled,
            sequenced.len()
        );
        Ok(TickReport {
            discovered,
            sampled,
            newly_tracked,
            verdicts: sequenced,
        })
    }

    async fn observe(&self, tracked: Vec<ProcessHandle>) -> Result<Observation, MonitorError> {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(previous) = in_flight.take() {
            if !previous.is_finished() {
                *in_flight = Some(previous);
                return Err(MonitorError::Busy);
            }
            debug!("Discarding a sampling pass that finished after its tick timed out");
        }

        let sampler = Arc::clone(&self.sampler);
        let system_sampler = self.system_sampler.clone();
        let criteria = self.criteria.clone();
        // Leave headroom so per-process reads stop before the hard timeout
        let budget = self.sample_timeout.mul_f64(0.8);

        let mut task = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + budget;
            observe_blocking(
                sampler.as_ref(),
                system_sampler.as_deref(),
                &criteria,
                &tracked,
                deadline,
            )
        });

        match tokio::time::timeout(self.sample_timeout, &mut task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => {
                *in_flight = Some(task);
                Err(MonitorError::Timeout(self.sample_timeout))
            }
        }
    }

    pub async fn current_status(&self) -> StatusSnapshot {
        let published = Arc::clone(&*self.published.read().await);
        let mut status = published.status.clone();
        status.skipped_ticks = self.skipped_ticks.load(Ordering::Relaxed);
        status
    }

    /// Latest snapshot of every tracked process that has one.
    pub async fn current_metrics(&self) -> Vec<TargetMetrics> {
        self.published.read().await.metrics.clone()
    }

    pub async fn current_system_metrics(&self) -> Option<SystemSnapshot> {
        self.published.read().await.system.clone()
    }

    pub async fn system_history(&self) -> Vec<SystemSnapshot> {
        self.state.lock().await.system_history.iter().cloned().collect()
    }

    /// Verdicts with a sequence number above `since`, oldest first.
    pub async fn verdicts_since(&self, since: u64, limit: usize) -> Vec<SequencedVerdict> {
        self.verdicts.read().await.since(since, limit)
    }

    pub async fn health(&self) -> Health {
        let running = self.running.load(Ordering::SeqCst);
        let last_tick_at = self.published.read().await.status.last_tick_at;
        let stale_after = chrono::Duration::from_std(self.poll_interval * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(3));
        let recent = last_tick_at.is_some_and(|t| Utc::now() - t <= stale_after);
        Health {
            running,
            last_tick_at,
            healthy: running && recent,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_only_moves_forward() {
        use TargetState::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Exited));
        assert!(Active.can_transition_to(Exited));
        assert!(Exited.can_transition_to(Classified));
        assert!(!Active.can_transition_to(Pending));
        assert!(!Classified.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Classified));
    }
}
