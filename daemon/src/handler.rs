//! Answers IPC requests from the coordinator's published state

use crate::coordinator::Coordinator;
use crate::protocol::{Request, Response, StatusData, VerdictData};
use crate::socket::RequestHandler;
use serde_json::json;

const DEFAULT_VERDICT_LIMIT: u32 = 100;
const MAX_REPLAY: usize = 1000;

#[async_trait::async_trait]
impl RequestHandler for Coordinator {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetHealth => {
                let health = self.health().await;
                let status = if health.healthy { "healthy" } else { "unhealthy" };
                Response::data(json!({
                    "status": status,
                    "service": "crashsense",
                    "version": env!("CARGO_PKG_VERSION"),
                    "running": health.running,
                    "last_tick_at": health.last_tick_at,
                }))
            }

            Request::GetStatus => {
                let status = self.current_status().await;
                Response::Status {
                    data: StatusData::from(&status),
                }
            }

            Request::GetMetrics { params } => {
                let metrics = self.current_metrics().await;
                if params.normalized {
                    let data: Vec<_> = metrics
                        .iter()
                        .map(|m| {
                            json!({
                                "pid": m.handle.pid,
                                "name": m.handle.name,
                                "cpu_percent": (m.snapshot.cpu_percent / 100.0).clamp(0.0, 1.0),
                                "memory_bytes": (m.snapshot.memory_bytes as f64).ln_1p(),
                                "io_read_bytes": (m.snapshot.io_read_bytes as f64).ln_1p(),
                                "io_write_bytes": (m.snapshot.io_write_bytes as f64).ln_1p(),
                                "timestamp": m.snapshot.timestamp,
                            })
                        })
                        .collect();
                    Response::data(json!(data))
                } else {
                    to_response(&metrics)
                }
            }

            Request::GetSystemMetrics { params } => match self.current_system_metrics().await {
                None => Response::data(json!({})),
                Some(system) if params.normalized => to_response(&system.normalize()),
                Some(system) => to_response(&system),
            },

            Request::GetVerdicts { params } => {
                let since = params.since.unwrap_or(0);
                let limit = params.limit.unwrap_or(DEFAULT_VERDICT_LIMIT) as usize;
                to_response(&self.verdicts_since(since, limit).await)
            }

            Request::Subscribe { .. } => {
                let status = self.current_status().await;
                Response::data(json!({
                    "subscribed": true,
                    "last_sequence": status.last_sequence,
                }))
            }
        }
    }

    async fn backlog(&self, since: u64) -> Vec<VerdictData> {
        self.verdicts_since(since, MAX_REPLAY)
            .await
            .iter()
            .map(VerdictData::from)
            .collect()
    }
}

fn to_response<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::data(data),
        Err(e) => Response::error(e),
    }
}
