//! Desktop notifications for crash verdicts

use crate::model::{Classification, Verdict};
use notify_rust::Notification;
use tracing::warn;

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Title and body for a verdict worth telling the user about.
    pub fn message_for(verdict: &Verdict) -> Option<(String, String)> {
        if verdict.classification != Classification::Crash {
            return None;
        }
        let handle = &verdict.exit_event.process_handle;
        let reasons: Vec<&str> = verdict
            .contributing_factors
            .iter()
            .filter(|f| f.weight > 0.0)
            .map(|f| f.detail.as_str())
            .collect();
        Some((
            format!("CrashSense: {} crashed", handle.name),
            format!(
                "PID {} ({:.0}% confidence) - {}",
                handle.pid,
                verdict.confidence * 100.0,
                reasons.join("; ")
            ),
        ))
    }

    pub fn notify(&self, verdict: &Verdict) {
        if !self.enabled {
            return;
        }
        if let Some((summary, body)) = Self::message_for(verdict) {
            if let Err(e) = send_notification(&summary, &body) {
                warn!("Failed to send notification: {}", e);
            }
        }
    }
}

pub fn send_notification(summary: &str, body: &str) -> Result<(), notify_rust::error::Error> {
    Notification::new()
        .summary(summary)
        .body(body)
        .appname("CrashSense")
        .show()?;
    Ok(())
}
