//! Request/response correlation over a `Transport`.
//!
//! Every outbound request gets a fresh id and a oneshot completion slot in
//! the pending table. A single reader task owns the child's output stream,
//! parses each frame and wakes whichever caller is waiting on that id.
//! When the stream closes (or the client is stopped) every pending slot is
//! completed with `TransportError` and no new request is accepted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    capability_array, Dialect, InboundFrame, InvocationOutput, Notification, Operation, Request,
    ResponseBody, RpcError,
};
use crate::bridge::transport::{ChildProcess, FrameReader, FrameWriter, Transport};
use crate::error::{BridgeError, Result};
use crate::schema::{CapabilityDescriptor, Invoke};

/// What the reader task delivers into a completion slot: the remote result
/// or remote error, or a local failure (transport closed, malformed response).
type Reply = Result<std::result::Result<Value, RpcError>>;

/// Longest frame excerpt written to logs.
const LOG_EXCERPT_CHARS: usize = 200;

/// Timing and dialect settings for one client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub dialect: Dialect,
    /// Deadline for the `initialize` handshake.
    pub init_timeout: Duration,
    /// Deadline for every other request.
    pub request_timeout: Duration,
    /// How long `stop()` waits for the child to exit before killing it.
    pub shutdown_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::Bridge,
            init_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingTable {
    slots: HashMap<u64, oneshot::Sender<Reply>>,
    /// Set once the stream is gone; carries the reason handed to later callers.
    closed: Option<String>,
}

/// State shared between callers and the reader task.
struct Shared {
    pending: Mutex<PendingTable>,
    unmatched: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, id: u64, slot: oneshot::Sender<Reply>) -> Result<()> {
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(BridgeError::Transport(reason.clone()));
        }
        table.slots.insert(id, slot);
        Ok(())
    }

    fn closed_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        self.lock().slots.remove(&id)
    }

    /// Mark the channel closed and complete every pending slot with `TransportError`.
    fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.slots.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!(pending = drained.len(), reason, "failing pending requests");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(BridgeError::Transport(reason.to_string())));
        }
    }

    fn dispatch(&self, line: &str) {
        match InboundFrame::parse(line) {
            Ok(InboundFrame::Response { id, body }) => {
                let Some(slot) = self.take(id) else {
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        id,
                        "response with unknown correlation id dropped: {}",
                        excerpt(line)
                    );
                    return;
                };
                let reply = match body {
                    ResponseBody::Result(value) => Ok(Ok(value)),
                    ResponseBody::Error(err) => Ok(Err(err)),
                    ResponseBody::Malformed => Err(BridgeError::Protocol(format!(
                        "response {id} has neither result nor error"
                    ))),
                };
                tracing::debug!(id, "response received");
                let _ = slot.send(reply);
            }
            Ok(InboundFrame::Notification { method }) => {
                tracing::debug!(%method, "notification from tool server ignored");
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable frame dropped: {}", excerpt(line));
            }
        }
    }
}

fn excerpt(line: &str) -> String {
    if line.chars().count() > LOG_EXCERPT_CHARS {
        let cut: String = line.chars().take(LOG_EXCERPT_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

/// The only place that reads the child's output stream.
async fn read_loop(mut reader: FrameReader, shared: Arc<Shared>, cancel: CancellationToken) {
    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break "session stopped".to_string(),
            next = reader.read_line() => next,
        };
        match next {
            Ok(Some(line)) => shared.dispatch(&line),
            Ok(None) => {
                tracing::info!("tool server closed its output stream");
                break "tool server exited".to_string();
            }
            Err(e) => break e.to_string(),
        }
    };
    shared.fail_all(&reason);
}

/// Multiplexed request/response client bound to one child process.
pub struct ProtocolClient {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<FrameWriter>,
    process: tokio::sync::Mutex<ChildProcess>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    next_id: AtomicU64,
    initialized: AtomicBool,
    stopped: AtomicBool,
    options: ClientOptions,
}

impl ProtocolClient {
    /// Take ownership of `transport` and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Transport, options: ClientOptions) -> Self {
        let (reader, writer, process) = transport.into_parts();
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable {
                slots: HashMap::new(),
                closed: None,
            }),
            unmatched: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared), cancel.clone()));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            process: tokio::sync::Mutex::new(process),
            reader_task: Mutex::new(Some(reader_task)),
            cancel,
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            options,
        }
    }

    /// Whether the channel to the child is still open.
    pub fn is_connected(&self) -> bool {
        self.shared.closed_reason().is_none()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Responses that arrived with an id no caller was waiting for.
    pub fn unmatched_responses(&self) -> u64 {
        self.shared.unmatched.load(Ordering::Relaxed)
    }

    /// Perform the handshake. Must succeed before any other call.
    ///
    /// Returns the child's capability summary.
    pub async fn initialize(&self) -> Result<Value> {
        let dialect = self.options.dialect;
        let method = dialect.method(Operation::Initialize);
        let reply = self
            .request(
                method,
                dialect.initialize_params(),
                self.options.init_timeout,
            )
            .await?;

        let summary = match reply {
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                return Err(BridgeError::Protocol(format!(
                    "handshake result is not an object: {other}"
                )))
            }
            Err(err) => {
                return Err(BridgeError::Protocol(format!("handshake rejected: {err}")))
            }
        };

        if let Some(notification) = dialect.initialized_notification() {
            self.notify(notification).await?;
        }

        self.initialized.store(true, Ordering::Release);
        tracing::info!(?dialect, "tool server initialized");
        Ok(summary)
    }

    /// Fetch the capability descriptors in the order the child declared them.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>> {
        self.ensure_initialized()?;
        let method = self.options.dialect.method(Operation::ListCapabilities);
        let result = match self
            .request(method, None, self.options.request_timeout)
            .await?
        {
            Ok(value) => value,
            Err(err) => {
                return Err(BridgeError::Protocol(format!(
                    "capability listing rejected: {err}"
                )))
            }
        };

        let descriptors = capability_array(result)?
            .into_iter()
            .map(CapabilityDescriptor::from_value)
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(count = descriptors.len(), "capabilities discovered");
        Ok(descriptors)
    }

    /// Invoke a capability and return the concatenated text of its result.
    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        self.ensure_initialized()?;
        let method = self.options.dialect.method(Operation::InvokeCapability);
        let params = serde_json::json!({
            "name": name,
            "arguments": Value::Object(arguments),
        });

        let value = match self
            .request(method, Some(params), self.options.request_timeout)
            .await?
        {
            Ok(value) => value,
            Err(err) => {
                return Err(BridgeError::ToolExecution {
                    tool: name.to_string(),
                    message: err.to_string(),
                })
            }
        };

        let output = InvocationOutput::from_value(value)?;
        let text = output.text(name);
        if output.is_error {
            return Err(BridgeError::ToolExecution {
                tool: name.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    /// Close the channel, fail pending requests and stop the child. Idempotent.
    ///
    /// Never waits on a writer that is stuck on a full pipe: if the input
    /// stream is busy it is left to the killed child (or the writer's own
    /// deadline) to release it.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.fail_all("session stopped");
        self.cancel.cancel();

        match self.writer.try_lock() {
            Ok(mut writer) => {
                let shutdown = self.options.shutdown_timeout;
                if tokio::time::timeout(shutdown, writer.close()).await.is_err() {
                    tracing::warn!("closing the tool server input stream timed out");
                }
            }
            Err(_) => tracing::warn!("input stream busy, not waiting for it to close"),
        }
        self.process
            .lock()
            .await
            .stop(self.options.shutdown_timeout)
            .await;

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("protocol client stopped");
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::State(
                "initialize must succeed before other requests".to_string(),
            ))
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let line = serde_json::to_vec(&Notification::new(method))
            .map_err(|e| BridgeError::Protocol(format!("cannot encode notification: {e}")))?;
        self.send_frame(&line, method, self.options.request_timeout)
            .await
    }

    /// Write one frame, giving up after `timeout`.
    ///
    /// A write cut short by the deadline may leave a partial frame behind, so
    /// the input stream is discarded and the channel closed.
    async fn send_frame(&self, line: &[u8], method: &str, timeout: Duration) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            if let Some(reason) = self.shared.closed_reason() {
                writer.discard();
                return Err(BridgeError::Transport(reason));
            }
            writer.write_line(line).await
        };

        let result = match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(method, "write to tool server timed out, closing the channel");
                self.shared.fail_all("write to tool server timed out");
                if let Ok(mut writer) = self.writer.try_lock() {
                    writer.discard();
                }
                return Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        if let Err(BridgeError::Transport(reason)) = &result {
            self.shared.fail_all(reason);
        }
        result
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<std::result::Result<Value, RpcError>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_vec(&Request::new(id, method, params))
            .map_err(|e| BridgeError::Protocol(format!("cannot encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.shared.register(id, tx)?;
        tracing::debug!(id, method, "request sent");

        // The write and the wait for the reply share one deadline.
        let deadline = Instant::now() + timeout;
        if let Err(e) = self.send_frame(&line, method, timeout).await {
            self.shared.take(id);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BridgeError::Transport(
                "response slot dropped before completion".to_string(),
            )),
            Err(_) => {
                self.shared.take(id);
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Invoke for ProtocolClient {
    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        ProtocolClient::invoke(self, name, arguments).await
    }
}
