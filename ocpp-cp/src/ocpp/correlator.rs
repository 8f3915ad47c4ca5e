//! Request/response correlation
//!
//! Every CALL this charge point sends is registered here under its message ID
//! together with a single-use resolver and an armed timeout. The entry is
//! removed by whichever comes first:
//! - a matching CALLRESULT (resolves with the payload)
//! - a matching CALLERROR (resolves with [`OcppError::Remote`])
//! - the timeout (resolves with [`OcppError::Timeout`])
//! - the connection going away (resolves with [`OcppError::ConnectionClosed`])
//!
//! Later arrivals for a removed ID are stray and ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::messages::*;

/// Outbound half of the active transport
pub trait FrameSink: Send + Sync {
    /// Queue one encoded frame for sending
    fn send_frame(&self, text: String) -> Result<(), OcppError>;
}

impl FrameSink for mpsc::UnboundedSender<String> {
    fn send_frame(&self, text: String) -> Result<(), OcppError> {
        self.send(text).map_err(|_| OcppError::ConnectionClosed)
    }
}

/// Outstanding locally-initiated call
struct PendingCall {
    action: Action,
    resolver: oneshot::Sender<Result<Value, OcppError>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn finish(self, outcome: Result<Value, OcppError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing to do then
        let _ = self.resolver.send(outcome);
    }
}

struct Inner {
    pending: Mutex<HashMap<String, PendingCall>>,
    link: Mutex<Option<Arc<dyn FrameSink>>>,
    counter: AtomicU64,
    timeout: Duration,
}

/// Handle to a response that has not arrived yet
#[derive(Debug)]
pub struct PendingResponse {
    message_id: String,
    action: Action,
    rx: oneshot::Receiver<Result<Value, OcppError>>,
}

impl PendingResponse {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Wait for the outcome of the call
    pub async fn wait(self) -> Result<Value, OcppError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(OcppError::ConnectionClosed),
        }
    }
}

/// Tracks outstanding CALLs and sends frames through the attached link
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("attached", &self.is_attached())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl Correlator {
    /// Create a correlator with the given request timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                counter: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    /// Route outbound frames through a freshly opened transport
    pub fn attach(&self, link: Arc<dyn FrameSink>) {
        *self.inner.link.lock() = Some(link);
    }

    /// Drop the transport and reject everything still pending
    pub fn detach(&self) -> usize {
        self.inner.link.lock().take();
        self.reject_all()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Generate a process-unique message ID: `msg-<counter>-<epochMillis>`
    pub fn next_message_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("msg-{}-{}", n, chrono::Utc::now().timestamp_millis())
    }

    /// Register and enqueue a CALL without waiting for its response
    ///
    /// The frame is handed to the link before this returns, so calls started
    /// one after another go out in that order.
    pub fn start_call(
        &self,
        action: Action,
        payload: impl Serialize,
    ) -> Result<PendingResponse, OcppError> {
        let link = self
            .inner
            .link
            .lock()
            .clone()
            .ok_or(OcppError::NotConnected)?;

        let payload = serde_json::to_value(payload)?;
        let message_id = self.next_message_id();
        let text = encode_call(&message_id, action.as_str(), &payload);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            message_id.clone(),
            PendingCall {
                action,
                resolver: tx,
                timer: None,
            },
        );

        let timer = self.arm_timeout(message_id.clone());
        if let Some(call) = self.inner.pending.lock().get_mut(&message_id) {
            call.timer = Some(timer);
        }

        debug!("Sending {} ({}): {}", action, message_id, payload);

        if let Err(e) = link.send_frame(text) {
            if let Some(call) = self.inner.pending.lock().remove(&message_id) {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
            }
            return Err(e);
        }

        Ok(PendingResponse {
            message_id,
            action,
            rx,
        })
    }

    /// Send a CALL and wait for its response payload
    pub async fn send(&self, action: Action, payload: impl Serialize) -> Result<Value, OcppError> {
        self.start_call(action, payload)?.wait().await
    }

    /// Best-effort CALL: failures are logged, never returned
    pub fn notify(&self, action: Action, payload: impl Serialize) {
        match self.start_call(action, payload) {
            Ok(pending) => {
                tokio::spawn(async move {
                    let message_id = pending.message_id().to_string();
                    if let Err(e) = pending.wait().await {
                        warn!("{} ({}) failed: {}", action, message_id, e);
                    }
                });
            }
            Err(e) => warn!("Could not send {}: {}", action, e),
        }
    }

    /// Send a CALLRESULT for an inbound CALL
    pub fn respond(&self, message_id: &str, payload: &Value) -> Result<(), OcppError> {
        self.send_raw(encode_result(message_id, payload))
    }

    /// Send a CALLERROR for an inbound CALL
    pub fn respond_error(
        &self,
        message_id: &str,
        code: ErrorCode,
        description: &str,
    ) -> Result<(), OcppError> {
        self.send_raw(encode_error(message_id, code, description))
    }

    fn send_raw(&self, text: String) -> Result<(), OcppError> {
        let link = self
            .inner
            .link
            .lock()
            .clone()
            .ok_or(OcppError::NotConnected)?;
        link.send_frame(text)
    }

    /// Resolve a pending call with its CALLRESULT; false if nothing matched
    pub fn resolve_result(&self, result: CallResult) -> bool {
        let entry = self.inner.pending.lock().remove(&result.message_id);
        match entry {
            Some(call) => {
                debug!("{} ({}) answered", call.action, result.message_id);
                call.finish(Ok(result.payload));
                true
            }
            None => {
                warn!("Stray CALLRESULT for {}", result.message_id);
                false
            }
        }
    }

    /// Resolve a pending call with its CALLERROR; false if nothing matched
    pub fn resolve_error(&self, error: CallError) -> bool {
        let entry = self.inner.pending.lock().remove(&error.message_id);
        match entry {
            Some(call) => {
                warn!(
                    "{} ({}) rejected by CSMS: {} - {}",
                    call.action, error.message_id, error.error_code, error.error_description
                );
                call.finish(Err(OcppError::Remote {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                }));
                true
            }
            None => {
                warn!(
                    "Stray CALLERROR for {}: {} - {}",
                    error.message_id, error.error_code, error.error_description
                );
                false
            }
        }
    }

    /// Reject every pending call with `ConnectionClosed`
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self.inner.pending.lock().drain().collect();
        let count = drained.len();
        for (message_id, call) in drained {
            debug!("Rejecting {} ({}): connection closed", call.action, message_id);
            call.finish(Err(OcppError::ConnectionClosed));
        }
        count
    }

    fn arm_timeout(&self, message_id: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let entry = inner.pending.lock().remove(&message_id);
            if let Some(call) = entry {
                warn!("{} ({}) timed out after {:?}", call.action, message_id, timeout);
                let action = call.action.to_string();
                // Dropping our own handle does not abort this task
                let _ = call.resolver.send(Err(OcppError::Timeout { action }));
            }
        })
    }
}
