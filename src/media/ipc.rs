use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Short timeout for a single IPC request/response round-trip (spec §5
/// "Media IPC calls use a short timeout; on timeout the adapter returns
/// error").
const IPC_CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// JSON-line IPC client modeled on the mpv JSON IPC protocol (spec §6
/// "Media IPC"): newline-delimited JSON objects over a Unix domain socket
/// or Windows named pipe, commands of the form
/// `{"command": [...], "request_id": n}`, and an unsolicited event stream
/// (`{"event": "end-file", ...}`, `{"event": "property-change", ...}`).
pub struct IpcClient {
    writer: AsyncMutex<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>,
    pending: Arc<SyncMutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_request_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl IpcClient {
    /// Wraps an already-connected duplex stream. `on_event` is invoked for
    /// every line that is not a request response (i.e. every `"event"`
    /// message) from a dedicated reader task; it must not block.
    pub fn new<S>(stream: S, on_event: impl Fn(Value) + Send + Sync + 'static) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Arc<SyncMutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(SyncMutex::new(HashMap::new()));
        let pending_for_task = pending.clone();

        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let value: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, line, "ipc: malformed line from player");
                                continue;
                            }
                        };
                        if let Some(id) = value.get("request_id").and_then(Value::as_u64) {
                            if let Some(tx) = pending_for_task.lock().remove(&id) {
                                let _ = tx.send(value);
                                continue;
                            }
                        }
                        trace!(?value, "ipc: event");
                        on_event(value);
                    }
                    Ok(None) => {
                        warn!("ipc: player closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "ipc: read error");
                        break;
                    }
                }
            }
        });

        Self {
            writer: AsyncMutex::new(Box::new(write_half)),
            pending,
            next_request_id: AtomicU64::new(1),
            reader_task,
        }
    }

    /// Sends `{"command": command, "request_id": n}` and awaits the
    /// matching response, bounded by `IPC_CALL_TIMEOUT`.
    pub async fn command(&self, command: Vec<Value>) -> anyhow::Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let payload = json!({ "command": command, "request_id": id });
        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&line).await {
                self.pending.lock().remove(&id);
                anyhow::bail!("ipc write failed: {e}");
            }
        }

        match tokio::time::timeout(IPC_CALL_TIMEOUT, rx).await {
            Ok(Ok(response)) => {
                if response.get("error").and_then(Value::as_str) == Some("success") {
                    Ok(response.get("data").cloned().unwrap_or(Value::Null))
                } else {
                    let err = response
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    anyhow::bail!("ipc command failed: {err}")
                }
            }
            Ok(Err(_)) => anyhow::bail!("ipc response channel dropped"),
            Err(_) => {
                self.pending.lock().remove(&id);
                anyhow::bail!("ipc command timed out")
            }
        }
    }

    pub async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.command(vec![json!("set_property"), json!(name), value])
            .await?;
        Ok(())
    }

    pub async fn get_property(&self, name: &str) -> anyhow::Result<Value> {
        self.command(vec![json!("get_property"), json!(name)]).await
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
