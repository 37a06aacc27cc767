//! JSON-RPC over stdio transport.
//!
//! One `ProtocolClient` owns one module's input and output streams:
//! - Requests are written as one JSON object per line under a writer lock,
//!   so frames never interleave and go out in submission order.
//! - A persistent reader task splits the output stream on newlines and
//!   resolves pending requests strictly by id. Responses may arrive in any
//!   order.
//! - Every request carries its own deadline. Expiry, caller cancellation and
//!   resolution all remove the pending entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::errors::BridgeError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type Waiter = oneshot::Sender<Result<serde_json::Value, BridgeError>>;

/// Boxed write half of a module's stdio.
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Pending Table ──────────────────────────────────────────────────────────

/// A request that has been written and is awaiting its response.
struct PendingRequest {
    waiter: Waiter,
    method: String,
    sent_at: Instant,
}

/// Why the client no longer accepts requests.
#[derive(Debug, Clone)]
enum Closed {
    /// Output stream ended or failed.
    Stream(String),
    /// Manager shutdown cancelled everything in flight.
    Shutdown,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    closed: Option<Closed>,
}

struct Shared {
    module: String,
    table: Mutex<PendingTable>,
}

impl Shared {
    fn closed_error(&self, closed: &Closed) -> BridgeError {
        match closed {
            Closed::Stream(reason) => BridgeError::Transport {
                module: self.module.clone(),
                reason: reason.clone(),
            },
            Closed::Shutdown => BridgeError::Shutdown {
                module: self.module.clone(),
            },
        }
    }

    fn register(&self, id: u64, method: &str, waiter: Waiter) -> Result<(), BridgeError> {
        let mut table = self.table.lock();
        if let Some(closed) = &table.closed {
            return Err(self.closed_error(closed));
        }
        table.entries.insert(
            id,
            PendingRequest {
                waiter,
                method: method.to_string(),
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn remove(&self, id: u64) -> Option<PendingRequest> {
        self.table.lock().entries.remove(&id)
    }

    /// Mark the table closed and reject every pending request.
    ///
    /// The first close reason wins; later calls only drain what is left.
    fn close(&self, reason: Closed) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.clone());
            }
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(
                module = %self.module,
                id,
                method = %entry.method,
                "rejecting pending request"
            );
            let _ = entry.waiter.send(Err(self.closed_error(&reason)));
        }
        count
    }

    /// Route one line from the module's output stream to its waiter.
    fn dispatch(&self, line: &[u8]) {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return;
        }

        let response: JsonRpcResponse = match serde_json::from_slice(trimmed) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(
                    module = %self.module,
                    error = %e,
                    frame = %String::from_utf8_lossy(truncate_frame(trimmed)),
                    "protocol anomaly: discarding malformed frame"
                );
                return;
            }
        };

        let Some(id) = response.id else {
            if let Some(method) = &response.method {
                tracing::debug!(
                    module = %self.module,
                    method = %method,
                    "ignoring notification from module"
                );
            } else {
                tracing::warn!(
                    module = %self.module,
                    "protocol anomaly: discarding frame without id"
                );
            }
            return;
        };

        let Some(entry) = self.remove(id) else {
            tracing::warn!(
                module = %self.module,
                id,
                "protocol anomaly: no pending request for response id"
            );
            return;
        };

        tracing::debug!(
            module = %self.module,
            id,
            method = %entry.method,
            elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
            "response correlated"
        );
        let _ = entry.waiter.send(extract_result(&self.module, response));
    }
}

/// Holds the writer for one frame. A frame abandoned half-way leaves the
/// stream unframed, so the writer is dropped and the input closed.
struct FrameWrite<'a> {
    module: &'a str,
    slot: tokio::sync::MutexGuard<'a, Option<FrameWriter>>,
    finished: bool,
}

impl Drop for FrameWrite<'_> {
    fn drop(&mut self) {
        if !self.finished && self.slot.take().is_some() {
            tracing::warn!(module = %self.module, "frame write abandoned, closing input stream");
        }
    }
}

/// Removes a pending entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove(self.id);
    }
}

// ─── ProtocolClient ─────────────────────────────────────────────────────────

/// Correlating JSON-RPC client over one module's byte streams.
pub struct ProtocolClient {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    next_id: AtomicU64,
    default_timeout: Duration,
    reader: JoinHandle<()>,
}

impl ProtocolClient {
    /// Wrap a module's streams and start the persistent reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R>(module: &str, writer: FrameWriter, reader: R, default_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            module: module.to_string(),
            table: Mutex::new(PendingTable::default()),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), reader));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(writer)),
            next_id: AtomicU64::new(1),
            default_timeout,
            reader,
        }
    }

    /// Name of the module this client talks to.
    pub fn module(&self) -> &str {
        &self.shared.module
    }

    /// Deadline applied by [`ProtocolClient::request`].
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send a request with the default deadline and await its correlated result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        self.request_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Send a request and await the response carrying the same id.
    ///
    /// The pending entry is gone by the time this returns, whatever the
    /// outcome, and also if the returned future is dropped early.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        let mut frame = serde_json::to_vec(&JsonRpcRequest::new(id, method, params)).map_err(
            |e| BridgeError::Protocol {
                module: self.module().to_string(),
                reason: format!("failed to serialize request: {e}"),
            },
        )?;
        frame.push(b'\n');

        let (tx, mut rx) = oneshot::channel();
        self.shared.register(id, method, tx)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        // The deadline covers the write too; a module that stops reading
        // its input must not hold the caller past it. Cancellation can
        // also arrive while the frame is still being written.
        tokio::select! {
            written = tokio::time::timeout_at(deadline, self.write_frame(&frame)) => match written {
                Ok(result) => result?,
                Err(_) => return Err(self.timed_out(id, method, timeout)),
            },
            outcome = &mut rx => return self.received(outcome),
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(outcome) => self.received(outcome),
            Err(_) => Err(self.timed_out(id, method, timeout)),
        }
    }

    fn received(
        &self,
        outcome: Result<Result<serde_json::Value, BridgeError>, oneshot::error::RecvError>,
    ) -> Result<serde_json::Value, BridgeError> {
        outcome.unwrap_or_else(|_| {
            Err(BridgeError::Transport {
                module: self.module().to_string(),
                reason: "response channel dropped".into(),
            })
        })
    }

    fn timed_out(&self, id: u64, method: &str, timeout: Duration) -> BridgeError {
        tracing::warn!(
            module = %self.module(),
            id,
            method,
            timeout_ms = timeout.as_millis() as u64,
            "request timed out"
        );
        BridgeError::Timeout {
            module: self.module().to_string(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BridgeError> {
        let mut frame = serde_json::to_vec(&JsonRpcNotification::new(method, params)).map_err(
            |e| BridgeError::Protocol {
                module: self.module().to_string(),
                reason: format!("failed to serialize notification: {e}"),
            },
        )?;
        frame.push(b'\n');
        tokio::time::timeout(self.default_timeout, self.write_frame(&frame))
            .await
            .map_err(|_| BridgeError::Timeout {
                module: self.module().to_string(),
                method: method.to_string(),
                timeout_ms: self.default_timeout.as_millis() as u64,
            })?
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), BridgeError> {
        let mut write = FrameWrite {
            module: self.module(),
            slot: self.writer.lock().await,
            finished: false,
        };
        let writer = write.slot.as_mut().ok_or_else(|| BridgeError::Transport {
            module: self.module().to_string(),
            reason: "input stream closed".into(),
        })?;

        writer
            .write_all(frame)
            .await
            .map_err(|e| BridgeError::Transport {
                module: self.module().to_string(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| BridgeError::Transport {
            module: self.module().to_string(),
            reason: format!("failed to flush stdin: {e}"),
        })?;
        write.finished = true;
        Ok(())
    }

    /// Close the module's input stream. Further writes fail.
    ///
    /// Gives up after `within` if a write still holds the stream, and
    /// returns whether the stream was closed.
    pub async fn close_input(&self, within: Duration) -> bool {
        let Ok(mut slot) = tokio::time::timeout(within, self.writer.lock()).await else {
            tracing::warn!(module = %self.module(), "input stream busy, not closed");
            return false;
        };
        if let Some(mut writer) = slot.take() {
            let _ = tokio::time::timeout(within, writer.shutdown()).await;
        }
        true
    }

    /// Whether the input stream has been closed or abandoned.
    pub async fn is_input_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    /// Reject every pending request with `Shutdown` and refuse new ones.
    ///
    /// Returns the number of requests that were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.shared.close(Closed::Shutdown)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table.lock().entries.len()
    }

    /// Whether a request id is still awaiting a response.
    pub fn is_pending(&self, id: u64) -> bool {
        self.shared.table.lock().entries.contains_key(&id)
    }

    /// Whether the output stream has ended or the client was cancelled.
    pub fn is_closed(&self) -> bool {
        self.shared.table.lock().closed.is_some()
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Persistent reader: one line per frame until the stream ends.
async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                let rejected = shared.close(Closed::Stream(
                    "module output stream closed (process may have exited)".into(),
                ));
                tracing::debug!(module = %shared.module, rejected, "reader reached end of stream");
                break;
            }
            Ok(_) => shared.dispatch(&line),
            Err(e) => {
                let rejected = shared.close(Closed::Stream(format!("failed to read stdout: {e}")));
                tracing::warn!(module = %shared.module, error = %e, rejected, "reader failed");
                break;
            }
        }
    }
}

// ─── Response Helpers ───────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `BridgeError`.
pub fn extract_result(
    module: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, BridgeError> {
    if let Some(err) = response.error {
        return Err(BridgeError::Remote {
            module: module.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| BridgeError::Remote {
        module: module.to_string(),
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

fn truncate_frame(frame: &[u8]) -> &[u8] {
    const MAX_LOGGED: usize = 200;
    &frame[..frame.len().min(MAX_LOGGED)]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
