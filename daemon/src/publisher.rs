//! Hands verdicts from the coordinator to SQLite, the desktop and clients
//!
//! The coordinator's verdict log is sequence-numbered, so the publisher only
//! has to remember the last sequence it stored. Anything it missed (a lagging
//! subscription, the final tick before shutdown) is read back from the log.

use crate::coordinator::Coordinator;
use crate::db::Database;
use crate::model::SequencedVerdict;
use crate::notifier::Notifier;
use crate::protocol::{Response, StatusData, VerdictData};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const PRUNE_EVERY: Duration = Duration::from_secs(6 * 60 * 60);

pub struct VerdictPublisher {
    db: Database,
    notifier: Notifier,
    pushes: broadcast::Sender<Response>,
    retention_days: u32,
    last_persisted: u64,
}

impl VerdictPublisher {
    pub fn new(
        db: Database,
        notifier: Notifier,
        pushes: broadcast::Sender<Response>,
        retention_days: u32,
    ) -> rusqlite::Result<Self> {
        let last_persisted = db.latest_sequence()?;
        Ok(Self {
            db,
            notifier,
            pushes,
            retention_days,
            last_persisted,
        })
    }

    /// Highest sequence handed to the database.
    pub fn last_persisted(&self) -> u64 {
        self.last_persisted
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn publish(&mut self, entry: &SequencedVerdict) {
        if entry.sequence <= self.last_persisted {
            return;
        }
        if let Err(e) = self.db.insert_verdict(entry) {
            error!("Failed to save verdict {}: {}", entry.sequence, e);
        }
        self.last_persisted = entry.sequence;

        self.notifier.notify(&entry.verdict);
        let _ = self.pushes.send(Response::Verdict {
            data: VerdictData::from(entry),
        });
    }

    /// Publish every verdict the coordinator still holds past
    /// `last_persisted`. Returns how many were published.
    pub async fn catch_up(&mut self, coordinator: &Coordinator) -> usize {
        let missed = coordinator
            .verdicts_since(self.last_persisted, usize::MAX)
            .await;
        if let Some(first) = missed.first() {
            if first.sequence > self.last_persisted + 1 {
                warn!(
                    "Verdicts {}..{} were evicted before they could be stored",
                    self.last_persisted + 1,
                    first.sequence - 1
                );
            }
        }
        for entry in &missed {
            self.publish(entry);
        }
        missed.len()
    }

    pub fn prune(&self) {
        match self.db.cleanup_old_verdicts(self.retention_days) {
            Ok(0) => {}
            Ok(removed) => info!(
                "Removed {} verdicts older than {} days",
                removed, self.retention_days
            ),
            Err(e) => warn!("Failed to prune old verdicts: {}", e),
        }
    }

    /// Run until `stop` flips to true. Stop it only after the monitoring
    /// loop has returned, so the final catch-up sees its last tick.
    pub async fn run(mut self, coordinator: Arc<Coordinator>, mut stop: watch::Receiver<bool>) {
        let mut verdicts = coordinator.subscribe();
        self.catch_up(&coordinator).await;

        let mut status_interval = tokio::time::interval(coordinator.poll_interval());
        let mut prune_interval = tokio::time::interval(PRUNE_EVERY);

        loop {
            tokio::select! {
                received = verdicts.recv() => match received {
                    Ok(entry) => self.publish(&entry),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Publisher fell behind by {} verdicts, catching up", skipped);
                        self.catch_up(&coordinator).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = status_interval.tick() => {
                    let status = coordinator.current_status().await;
                    let _ = self.pushes.send(Response::Status {
                        data: StatusData::from(&status),
                    });
                }
                _ = prune_interval.tick() => self.prune(),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        let late = self.catch_up(&coordinator).await;
        debug!("Publisher stopped after storing {} late verdicts", late);
    }
}
