//! IPC protocol definitions (JSON messages)

use crate::coordinator::StatusSnapshot;
use crate::model::{Classification, SequencedVerdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    GetHealth,
    GetStatus,
    GetMetrics {
        #[serde(default)]
        params: MetricsParams,
    },
    GetSystemMetrics {
        #[serde(default)]
        params: MetricsParams,
    },
    GetVerdicts {
        #[serde(default)]
        params: GetVerdictsParams,
    },
    /// Start receiving verdict and status pushes, first replaying the
    /// verdicts after `since` when given.
    Subscribe {
        #[serde(default)]
        params: SubscribeParams,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsParams {
    #[serde(default)]
    pub normalized: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetVerdictsParams {
    /// Last sequence number the client has seen.
    pub since: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Response { id: Option<String>, data: serde_json::Value },
    Verdict { data: VerdictData },
    Status { data: StatusData },
}

impl Response {
    pub fn data(data: serde_json::Value) -> Self {
        Response::Response { id: None, data }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Response {
            id: None,
            data: serde_json::json!({ "error": message.to_string() }),
        }
    }
}

/// Compact verdict pushed to every connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictData {
    pub sequence: u64,
    pub pid: u32,
    pub name: String,
    pub classification: Classification,
    pub confidence: f64,
    pub factors: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

impl From<&SequencedVerdict> for VerdictData {
    fn from(entry: &SequencedVerdict) -> Self {
        let verdict = &entry.verdict;
        let handle = &verdict.exit_event.process_handle;
        VerdictData {
            sequence: entry.sequence,
            pid: handle.pid,
            name: handle.name.clone(),
            classification: verdict.classification,
            confidence: verdict.confidence,
            factors: verdict
                .contributing_factors
                .iter()
                .map(|f| f.signal.clone())
                .collect(),
            detected_at: verdict.exit_event.detected_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub active_count: u32,
    pub pending_count: u32,
    pub verdict_count: u64,
    pub last_sequence: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl From<&StatusSnapshot> for StatusData {
    fn from(status: &StatusSnapshot) -> Self {
        StatusData {
            active_count: status.active_targets.len() as u32,
            pending_count: status.pending_targets as u32,
            verdict_count: status.verdict_count,
            last_sequence: status.last_sequence,
            last_tick_at: status.last_tick_at,
        }
    }
}
