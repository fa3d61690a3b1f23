//! Local control socket
//!
//! Newline-delimited JSON. Every request gets exactly one reply, except
//! `subscribe`, which first replays the verdicts the client missed and then
//! switches the connection to receive verdict and status pushes.

use crate::protocol::{Request, Response, VerdictData};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const PUSH_CAPACITY: usize = 256;

#[async_trait::async_trait]
pub trait RequestHandler {
    async fn handle(&self, request: Request) -> Response;

    /// Verdicts with a sequence above `since`, oldest first.
    async fn backlog(&self, since: u64) -> Vec<VerdictData>;
}

pub struct ControlSocket {
    path: PathBuf,
    listener: UnixListener,
    pushes: broadcast::Sender<Response>,
}

impl ControlSocket {
    /// Replaces a socket file left behind by a previous run.
    pub async fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        let (pushes, _) = broadcast::channel(PUSH_CAPACITY);
        info!("Control socket listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            pushes,
        })
    }

    /// Sender for messages pushed to every subscribed client.
    pub fn pushes(&self) -> broadcast::Sender<Response> {
        self.pushes.clone()
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// `$CRASHSENSE_SOCKET`, else `/run/user/<uid>/crashsense.sock`.
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os("CRASHSENSE_SOCKET") {
            return PathBuf::from(path);
        }
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/run/user/{}/crashsense.sock", uid))
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Per-connection push filter.
#[derive(Debug, Default)]
struct Subscription {
    active: bool,
    /// Highest verdict sequence already written to this client.
    delivered_through: u64,
}

impl Subscription {
    fn start(&mut self, since: u64, replayed: &[VerdictData]) {
        self.active = true;
        self.delivered_through = replayed.iter().map(|v| v.sequence).fold(since, u64::max);
    }

    /// Verdicts replayed on subscribe may also be sitting in the push queue.
    fn admits(&mut self, push: &Response) -> bool {
        if !self.active {
            return false;
        }
        match push {
            Response::Verdict { data } if data.sequence <= self.delivered_through => false,
            Response::Verdict { data } => {
                self.delivered_through = data.sequence;
                true
            }
            _ => true,
        }
    }
}

pub async fn serve_client<H>(
    stream: UnixStream,
    mut pushes: broadcast::Receiver<Response>,
    handler: Arc<H>,
) where
    H: RequestHandler + Send + Sync + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut subscription = Subscription::default();
    let mut pushes_open = true;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Client read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let replies = match serde_json::from_str::<Request>(line.trim()) {
                    Ok(Request::Subscribe { params }) => {
                        let since = params.since;
                        let backlog = match since {
                            Some(since) => handler.backlog(since).await,
                            None => Vec::new(),
                        };
                        subscription.start(since.unwrap_or(0), &backlog);
                        let ack = handler.handle(Request::Subscribe { params }).await;
                        backlog
                            .into_iter()
                            .map(|data| Response::Verdict { data })
                            .chain(std::iter::once(ack))
                            .collect()
                    }
                    Ok(request) => vec![handler.handle(request).await],
                    Err(e) => {
                        warn!("Invalid request: {}", e);
                        vec![Response::error(e)]
                    }
                };
                for reply in &replies {
                    if let Err(e) = write_line(&mut writer, reply).await {
                        debug!("Client write failed: {}", e);
                        return;
                    }
                }
            }
            push = pushes.recv(), if pushes_open => match push {
                Ok(push) => {
                    if subscription.admits(&push) {
                        if let Err(e) = write_line(&mut writer, &push).await {
                            debug!("Client write failed: {}", e);
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Client too slow, dropped {} pushes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => pushes_open = false,
            }
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, response: &Response) -> io::Result<()> {
    let mut json = serde_json::to_string(response).map_err(io::Error::other)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await
}
