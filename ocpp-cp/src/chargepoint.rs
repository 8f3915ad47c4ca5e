//! Charge point assembly
//!
//! Wires the components together:
//!
//! ```text
//!  CSMS ──WebSocket──► ConnectionManager ──CALL──► Dispatcher ──► handlers
//!                            │   ▲                                   │
//!              CALLRESULT/   │   │ frames                            │
//!              CALLERROR     ▼   │                                   ▼
//!                          Correlator ◄────── Device / DiagnosticsWorkflow
//!                                                     │
//!                                                     ▼
//!                                                  EventBus ──► observers
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::config::{ConfigError, CpConfig};
use crate::connection::{ConnectionManager, ConnectionState, InboundCalls};
use crate::device::Device;
use crate::diagnostics::{DiagnosticsWorkflow, FileSource, Uploader};
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::ocpp::{Action, Call, Correlator, OcppError};

impl InboundCalls for Dispatcher {
    fn on_call(&self, call: Call) {
        self.dispatch(&call.message_id, &call.action, call.payload);
    }
}

/// A fully wired charge point
pub struct ChargePoint {
    config: Arc<CpConfig>,
    correlator: Correlator,
    events: EventBus,
    device: Device,
    dispatcher: Dispatcher,
}

impl ChargePoint {
    /// Create a charge point with the simulated files and the HTTP uploader
    pub fn new(config: CpConfig) -> Result<Self, ConfigError> {
        ChargePointBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &CpConfig {
        &self.config
    }

    /// Handle for operator actions (plug, swipe, ...)
    pub fn device(&self) -> Device {
        self.device.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn correlator(&self) -> Correlator {
        self.correlator.clone()
    }

    /// Connect and serve the CSMS until `shutdown` turns true
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), OcppError> {
        info!(
            "Starting charge point {} ({} {})",
            self.config.charge_point_id, self.config.vendor, self.config.model
        );

        let manager = ConnectionManager::new(
            self.config.clone(),
            self.correlator.clone(),
            self.events.clone(),
            Arc::new(self.dispatcher),
        );

        // Mirror the link state into the device
        let mut state = manager.state();
        let device = self.device.clone();
        let bridge = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let ready = *state.borrow_and_update() == ConnectionState::Ready;
                device.set_connected(ready);
            }
        });

        let result = manager.run(shutdown).await;
        bridge.abort();
        self.device.set_connected(false);
        result
    }
}

/// Builder for [`ChargePoint`]
pub struct ChargePointBuilder {
    config: CpConfig,
    files: Option<Arc<dyn FileSource>>,
    uploader: Option<Arc<dyn Uploader>>,
}

impl ChargePointBuilder {
    pub fn new() -> Self {
        Self {
            config: CpConfig::default(),
            files: None,
            uploader: None,
        }
    }

    pub fn config(mut self, config: CpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn charge_point_id(mut self, id: impl Into<String>) -> Self {
        self.config.charge_point_id = id.into();
        self
    }

    pub fn csms_url(mut self, url: impl Into<String>) -> Self {
        self.config.csms_url = url.into();
        self
    }

    pub fn vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.config = self.config.with_vendor(vendor, model);
        self
    }

    /// Replace the files that go into the diagnostics bundle
    pub fn files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = Some(files);
        self
    }

    /// Replace the diagnostics uploader
    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn build(self) -> Result<ChargePoint, ConfigError> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let correlator = Correlator::new(config.request_timeout);
        let events = EventBus::new(config.event_capacity);
        let device = Device::new(&config, correlator.clone(), events.clone());

        let mut diagnostics = DiagnosticsWorkflow::new(&config, correlator.clone(), events.clone());
        if let Some(files) = self.files {
            diagnostics = diagnostics.with_files(files);
        }
        if let Some(uploader) = self.uploader {
            diagnostics = diagnostics.with_uploader(uploader);
        }

        let mut dispatcher = Dispatcher::new(correlator.clone());
        dispatcher.register_defaults(&config);
        dispatcher.register(Action::GetDiagnostics, diagnostics);

        let remote_start = device.clone();
        dispatcher.register(Action::RemoteStartTransaction, move |payload: Value| {
            remote_start.handle_remote_start(payload)
        });
        let remote_stop = device.clone();
        dispatcher.register(Action::RemoteStopTransaction, move |payload: Value| {
            remote_stop.handle_remote_stop(payload)
        });

        Ok(ChargePoint {
            config,
            correlator,
            events,
            device,
            dispatcher,
        })
    }
}

impl Default for ChargePointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;
    use crate::ocpp::{decode, encode_call, encode_result, Frame};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
    use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    #[test]
    fn test_builder_validates_config() {
        assert!(ChargePointBuilder::new().build().is_ok());
        assert!(matches!(
            ChargePointBuilder::new().csms_url("http://localhost/ocpp").build(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ChargePointBuilder::new().charge_point_id("").build(),
            Err(ConfigError::EmptyChargePointId)
        ));
    }

    #[test]
    fn test_registered_actions() {
        let cp = ChargePoint::new(CpConfig::default()).unwrap();
        for action in [
            Action::GetDiagnostics,
            Action::Reset,
            Action::ChangeConfiguration,
            Action::GetConfiguration,
            Action::RemoteStartTransaction,
            Action::RemoteStopTransaction,
        ] {
            assert!(cp.dispatcher.is_registered(action), "{} not registered", action);
        }
    }

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Text(text) = msg {
                return decode(text.as_bytes()).unwrap();
            }
        }
    }

    /// Answer every CALL with `{}` until the CALLRESULT for `message_id` shows up
    async fn serve_until_result(ws: &mut WebSocketStream<TcpStream>, message_id: &str) -> Vec<Frame> {
        let mut seen = Vec::new();
        loop {
            let frame = next_frame(ws).await;
            if let Frame::Call(call) = &frame {
                let payload = match call.action.as_str() {
                    "BootNotification" => json!({"status": "Accepted", "interval": 300}),
                    _ => json!({}),
                };
                ws.send(Message::Text(encode_result(&call.message_id, &payload).into()))
                    .await
                    .unwrap();
            }
            let done = matches!(&frame, Frame::CallResult(r) if r.message_id == message_id);
            seen.push(frame);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_remote_start_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cp = ChargePointBuilder::new()
            .charge_point_id("CP-E2E")
            .csms_url(format!("ws://{}/ocpp", addr))
            .build()
            .unwrap();
        let device = cp.device();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(cp.run(stop_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut resp: Response| {
            assert_eq!(req.uri().path(), "/ocpp/CP-E2E");
            resp.headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp1.6"));
            Ok(resp)
        })
        .await
        .unwrap();

        // Boot, then the initial StatusNotification
        let boot = match next_frame(&mut ws).await {
            Frame::Call(call) => call,
            other => panic!("Expected BootNotification, got {:?}", other),
        };
        assert_eq!(boot.action, "BootNotification");
        ws.send(Message::Text(
            encode_result(&boot.message_id, &json!({"status": "Accepted", "interval": 300})).into(),
        ))
        .await
        .unwrap();

        ws.send(Message::Text(
            encode_call("csms-1", "RemoteStartTransaction", &json!({"idTag": "REMOTE_TAG"})).into(),
        ))
        .await
        .unwrap();

        let frames = serve_until_result(&mut ws, "csms-1").await;
        match frames.last() {
            Some(Frame::CallResult(result)) => {
                assert_eq!(result.payload, json!({"status": "Accepted"}))
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }

        // The follow-up starts the transaction after the reply
        let mut started = false;
        for _ in 0..10 {
            if let Frame::Call(call) = next_frame(&mut ws).await {
                let payload = match call.action.as_str() {
                    "StartTransaction" => {
                        started = true;
                        json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 7})
                    }
                    _ => json!({}),
                };
                ws.send(Message::Text(encode_result(&call.message_id, &payload).into()))
                    .await
                    .unwrap();
                if started {
                    break;
                }
            }
        }
        assert!(started);

        tokio::time::timeout(Duration::from_secs(5), async {
            while device.snapshot().status != DeviceStatus::Charging {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("charging in time");
        assert_eq!(device.snapshot().transaction_id, Some(7));
        assert!(device.snapshot().ocpp_connected);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stopped in time")
            .unwrap()
            .unwrap();
        assert!(!device.snapshot().ocpp_connected);
    }
}
