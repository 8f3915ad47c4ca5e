//! Inbound CALL dispatch
//!
//! Handlers are registered per [`Action`]. A handler answers synchronously
//! with a [`Reply`]; work that must happen after the answer is on the wire
//! (the diagnostics upload, device transitions) rides along as a follow-up
//! future that the dispatcher spawns only once the CALLRESULT has been sent.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CpConfig;
use crate::ocpp::{
    Action, Correlator, ErrorCode, GetConfigurationRequest, GetConfigurationResponse, KeyValue,
    OcppError,
};

/// Answer to an inbound CALL
pub struct Reply {
    pub payload: Value,
    pub follow_up: Option<BoxFuture<'static, ()>>,
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("payload", &self.payload)
            .field("follow_up", &self.follow_up.is_some())
            .finish()
    }
}

impl Reply {
    pub fn new(payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            payload: serde_json::to_value(payload)?,
            follow_up: None,
        })
    }

    /// `{"status": "Accepted"}`
    pub fn accepted() -> Self {
        Self {
            payload: json!({ "status": "Accepted" }),
            follow_up: None,
        }
    }

    /// `{}`
    pub fn empty() -> Self {
        Self {
            payload: json!({}),
            follow_up: None,
        }
    }

    /// Run `work` after the reply has been sent
    pub fn then(mut self, work: impl Future<Output = ()> + Send + 'static) -> Self {
        self.follow_up = Some(work.boxed());
        self
    }
}

/// Handles one inbound action
pub trait CallHandler: Send + Sync {
    fn handle(&self, payload: Value) -> Result<Reply, OcppError>;
}

impl<F> CallHandler for F
where
    F: Fn(Value) -> Result<Reply, OcppError> + Send + Sync,
{
    fn handle(&self, payload: Value) -> Result<Reply, OcppError> {
        self(payload)
    }
}

/// Routes inbound CALLs to their handlers and sends the answers
pub struct Dispatcher {
    correlator: Correlator,
    handlers: HashMap<Action, Arc<dyn CallHandler>>,
}

impl Dispatcher {
    pub fn new(correlator: Correlator) -> Self {
        Self {
            correlator,
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for `action`
    pub fn register(&mut self, action: Action, handler: impl CallHandler + 'static) -> &mut Self {
        self.handlers.insert(action, Arc::new(handler));
        self
    }

    /// Register the actions that are only acknowledged
    pub fn register_defaults(&mut self, config: &CpConfig) -> &mut Self {
        self.register(Action::Reset, |payload: Value| -> Result<Reply, OcppError> {
            info!("Reset requested: {}", payload);
            Ok(Reply::accepted())
        });
        self.register(Action::ChangeConfiguration, |payload: Value| -> Result<Reply, OcppError> {
            info!("ChangeConfiguration requested: {}", payload);
            Ok(Reply::accepted())
        });
        self.register(Action::GetConfiguration, ConfigurationKeys::from_config(config));
        self
    }

    pub fn is_registered(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    /// Answer one inbound CALL
    ///
    /// Returns the follow-up task, if the handler produced one.
    pub fn dispatch(&self, message_id: &str, action: &str, payload: Value) -> Option<JoinHandle<()>> {
        let handler = action
            .parse::<Action>()
            .ok()
            .and_then(|a| self.handlers.get(&a).cloned());

        let Some(handler) = handler else {
            warn!("Unhandled action {} ({}), answering with {{}}", action, message_id);
            self.send_reply(message_id, &Reply::empty().payload);
            return None;
        };

        debug!("Dispatching {} ({})", action, message_id);

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload)))
            .unwrap_or_else(|_| Err(OcppError::Handler(format!("{} handler panicked", action))));

        match outcome {
            Ok(reply) => {
                self.send_reply(message_id, &reply.payload);
                reply.follow_up.map(tokio::spawn)
            }
            Err(e) => {
                error!("{} handler failed ({}): {}", action, message_id, e);
                if let Err(send_err) =
                    self.correlator
                        .respond_error(message_id, ErrorCode::InternalError, &e.to_string())
                {
                    warn!("Could not send CALLERROR for {}: {}", message_id, send_err);
                }
                None
            }
        }
    }

    fn send_reply(&self, message_id: &str, payload: &Value) {
        if let Err(e) = self.correlator.respond(message_id, payload) {
            warn!("Could not answer {}: {}", message_id, e);
        }
    }
}

/// GetConfiguration answered from a fixed key set
#[derive(Debug, Clone)]
pub struct ConfigurationKeys {
    keys: Vec<KeyValue>,
}

impl ConfigurationKeys {
    pub fn new(keys: Vec<KeyValue>) -> Self {
        Self { keys }
    }

    pub fn from_config(config: &CpConfig) -> Self {
        let entry = |key: &str, value: u64| KeyValue {
            key: key.to_string(),
            readonly: false,
            value: Some(value.to_string()),
        };
        Self::new(vec![
            entry("HeartbeatInterval", config.default_heartbeat_interval.as_secs()),
            entry("ConnectionTimeOut", config.request_timeout.as_secs()),
            entry("MeterValueSampleInterval", config.meter_interval.as_secs()),
        ])
    }

    fn lookup(&self, request: GetConfigurationRequest) -> GetConfigurationResponse {
        match request.key.filter(|keys| !keys.is_empty()) {
            None => GetConfigurationResponse {
                configuration_key: self.keys.clone(),
                unknown_key: Vec::new(),
            },
            Some(requested) => {
                let mut configuration_key = Vec::new();
                let mut unknown_key = Vec::new();
                for key in requested {
                    match self.keys.iter().find(|kv| kv.key == key) {
                        Some(kv) => configuration_key.push(kv.clone()),
                        None => unknown_key.push(key),
                    }
                }
                GetConfigurationResponse {
                    configuration_key,
                    unknown_key,
                }
            }
        }
    }
}

impl CallHandler for ConfigurationKeys {
    fn handle(&self, payload: Value) -> Result<Reply, OcppError> {
        let request: GetConfigurationRequest = if payload.is_null() {
            GetConfigurationRequest::default()
        } else {
            serde_json::from_value(payload)?
        };
        Reply::new(self.lookup(request))
    }
}
