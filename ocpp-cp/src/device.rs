//! Connector state machine
//!
//! One connector, driven locally (cable, RFID reader, fault input) and
//! remotely (RemoteStart/RemoteStopTransaction):
//!
//! ```text
//! Available --plug_in--> Preparing --swipe_card--> Charging
//!     ^                      |                        |
//!     |                  (rejected)           unplug / remote_stop
//!     |                      v                        v
//!     +----------------------+----------------- Finishing
//! ```
//!
//! Any state can go to Faulted; `clear_fault` returns to Available.
//! Every transition is published as a [`CpEvent::Device`] snapshot and
//! reported with a best-effort StatusNotification.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CpConfig;
use crate::dispatcher::Reply;
use crate::events::{CpEvent, EventBus, LogLevel};
use crate::ocpp::*;

/// Connector status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    Available,
    Preparing,
    Charging,
    Finishing,
    Faulted,
}

impl DeviceStatus {
    pub fn as_ocpp(self) -> ChargePointStatus {
        match self {
            DeviceStatus::Available => ChargePointStatus::Available,
            DeviceStatus::Preparing => ChargePointStatus::Preparing,
            DeviceStatus::Charging => ChargePointStatus::Charging,
            DeviceStatus::Finishing => ChargePointStatus::Finishing,
            DeviceStatus::Faulted => ChargePointStatus::Faulted,
        }
    }
}

/// Snapshot of the connector
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub status: DeviceStatus,
    pub connector_id: i32,
    /// Energy register in Wh, never decreases
    pub meter_value: i64,
    pub transaction_id: Option<i32>,
    pub id_tag: Option<String>,
    pub ocpp_connected: bool,
    pub error_code: ChargePointErrorCode,
}

impl DeviceState {
    pub fn new(connector_id: i32) -> Self {
        Self {
            status: DeviceStatus::Available,
            connector_id,
            meter_value: 0,
            transaction_id: None,
            id_tag: None,
            ocpp_connected: false,
            error_code: ChargePointErrorCode::NoError,
        }
    }
}

/// Errors from device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Cannot {operation} while {status:?}")]
    InvalidState {
        operation: &'static str,
        status: DeviceStatus,
    },

    #[error("Transaction {requested} is not active (active: {active:?})")]
    TransactionMismatch { requested: i32, active: Option<i32> },

    #[error("Authorization {0:?}")]
    Rejected(AuthorizationStatus),

    #[error(transparent)]
    Ocpp(#[from] OcppError),
}

struct DeviceInner {
    state: Mutex<DeviceState>,
    correlator: Correlator,
    events: EventBus,
    meter_interval: Duration,
    meter_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the connector; cheap to clone
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("state", &self.snapshot()).finish()
    }
}

impl Device {
    /// Create a new device in `Available`
    pub fn new(config: &CpConfig, correlator: Correlator, events: EventBus) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                state: Mutex::new(DeviceState::new(config.connector_id)),
                correlator,
                events,
                meter_interval: config.meter_interval,
                meter_task: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> DeviceState {
        self.inner.state.lock().clone()
    }

    /// Record the OCPP link state; on connect the current status is reported
    pub fn set_connected(&self, connected: bool) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.ocpp_connected == connected {
                return;
            }
            state.ocpp_connected = connected;
            state.clone()
        };

        self.inner.events.emit(CpEvent::Device {
            snapshot: snapshot.clone(),
        });
        if connected {
            self.report_status(&snapshot);
        }
    }

    /// Cable connected
    pub fn plug_in(&self) -> Result<(), DeviceError> {
        self.transition("plug in", &[DeviceStatus::Available], |state| {
            state.status = DeviceStatus::Preparing;
        })?;
        self.inner
            .events
            .log(LogLevel::Success, "Cable plugged in, preparing");
        Ok(())
    }

    /// RFID card presented; starts a transaction
    pub async fn swipe_card(&self, id_tag: impl Into<String>) -> Result<i32, DeviceError> {
        let id_tag = id_tag.into();
        let (connector_id, meter_start) = {
            let mut state = self.inner.state.lock();
            if state.status != DeviceStatus::Preparing {
                return Err(DeviceError::InvalidState {
                    operation: "swipe card",
                    status: state.status,
                });
            }
            state.id_tag = Some(id_tag.clone());
            (state.connector_id, state.meter_value)
        };

        self.inner
            .events
            .log(LogLevel::Success, format!("Card {} read, starting transaction", id_tag));

        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.clone(),
            meter_start,
            timestamp: chrono::Utc::now(),
        };

        let outcome = self
            .inner
            .correlator
            .send(Action::StartTransaction, request)
            .await
            .and_then(|payload| Ok(serde_json::from_value::<StartTransactionResponse>(payload)?));

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.inner.state.lock().id_tag = None;
                self.inner
                    .events
                    .log(LogLevel::Error, format!("StartTransaction failed: {}", e));
                return Err(e.into());
            }
        };

        if response.id_tag_info.status != AuthorizationStatus::Accepted {
            let status = response.id_tag_info.status;
            // Unplugged or faulted meanwhile: that state stands
            let _ = self.transition("reject card", &[DeviceStatus::Preparing], |state| {
                state.status = DeviceStatus::Available;
                state.id_tag = None;
            });
            self.inner
                .events
                .log(LogLevel::Error, format!("Charging rejected: {:?}", status));
            return Err(DeviceError::Rejected(status));
        }

        let transaction_id = response.transaction_id.unwrap_or(1);
        let started = self.transition("start charging", &[DeviceStatus::Preparing], |state| {
            state.status = DeviceStatus::Charging;
            state.transaction_id = Some(transaction_id);
        });
        if let Err(e) = started {
            self.abandon_transaction(transaction_id, id_tag, meter_start).await;
            return Err(e);
        }
        self.start_meter();
        self.inner.events.log(
            LogLevel::Success,
            format!("Charging started (transaction {})", transaction_id),
        );

        Ok(transaction_id)
    }

    /// Cable removed; ends the active transaction first
    pub async fn unplug(&self) -> Result<(), DeviceError> {
        let status = self.snapshot().status;
        if matches!(status, DeviceStatus::Available | DeviceStatus::Faulted) {
            return Err(DeviceError::InvalidState {
                operation: "unplug",
                status,
            });
        }

        self.stop_transaction(StopReason::Local).await;
        self.force_transition(|state| {
            state.status = DeviceStatus::Available;
            state.transaction_id = None;
            state.id_tag = None;
        });
        self.inner.events.log(LogLevel::Info, "Cable unplugged");
        Ok(())
    }

    /// RemoteStartTransaction: plug in (if needed) and authorize `id_tag`
    pub async fn remote_start(&self, id_tag: impl Into<String>) -> Result<i32, DeviceError> {
        if self.snapshot().status == DeviceStatus::Available {
            self.plug_in()?;
        }
        self.swipe_card(id_tag).await
    }

    /// RemoteStopTransaction: end `transaction_id` and release the connector
    pub async fn remote_stop(&self, transaction_id: i32) -> Result<(), DeviceError> {
        let active = self.snapshot().transaction_id;
        if active != Some(transaction_id) {
            return Err(DeviceError::TransactionMismatch {
                requested: transaction_id,
                active,
            });
        }

        self.stop_transaction(StopReason::Remote).await;
        self.force_transition(|state| {
            state.status = DeviceStatus::Available;
            state.transaction_id = None;
            state.id_tag = None;
        });
        self.inner
            .events
            .log(LogLevel::Info, format!("Transaction {} stopped remotely", transaction_id));
        Ok(())
    }

    /// Hardware fault; an active transaction is stopped first
    pub async fn fault(&self, error_code: ChargePointErrorCode) {
        if self.snapshot().transaction_id.is_some() {
            self.stop_transaction(StopReason::EmergencyStop).await;
        }
        self.stop_meter();
        self.force_transition(|state| {
            state.status = DeviceStatus::Faulted;
            state.transaction_id = None;
            state.id_tag = None;
            state.error_code = error_code;
        });
        self.inner
            .events
            .log(LogLevel::Error, format!("Connector faulted: {:?}", error_code));
    }

    pub fn clear_fault(&self) -> Result<(), DeviceError> {
        self.transition("clear fault", &[DeviceStatus::Faulted], |state| {
            state.status = DeviceStatus::Available;
            state.error_code = ChargePointErrorCode::NoError;
        })?;
        self.inner.events.log(LogLevel::Success, "Fault cleared");
        Ok(())
    }

    // ========================================================================
    // Inbound CALL handlers
    // ========================================================================

    /// RemoteStartTransaction: accepted while Available or Preparing
    pub fn handle_remote_start(&self, payload: Value) -> Result<Reply, OcppError> {
        let request: RemoteStartTransactionRequest = serde_json::from_value(payload)?;
        let status = self.snapshot().status;

        if !matches!(status, DeviceStatus::Available | DeviceStatus::Preparing) {
            info!("RemoteStartTransaction rejected while {:?}", status);
            return Reply::new(RemoteStartStopResponse {
                status: RemoteStartStopStatus::Rejected,
            });
        }

        let device = self.clone();
        Ok(Reply::new(RemoteStartStopResponse {
            status: RemoteStartStopStatus::Accepted,
        })?
        .then(async move {
            if let Err(e) = device.remote_start(request.id_tag).await {
                device
                    .inner
                    .events
                    .log(LogLevel::Error, format!("Remote start failed: {}", e));
            }
        }))
    }

    /// RemoteStopTransaction: accepted when the id matches the active transaction
    pub fn handle_remote_stop(&self, payload: Value) -> Result<Reply, OcppError> {
        let request: RemoteStopTransactionRequest = serde_json::from_value(payload)?;
        let active = self.snapshot().transaction_id;

        if active != Some(request.transaction_id) {
            info!(
                "RemoteStopTransaction {} rejected (active: {:?})",
                request.transaction_id, active
            );
            return Reply::new(RemoteStartStopResponse {
                status: RemoteStartStopStatus::Rejected,
            });
        }

        let device = self.clone();
        Ok(Reply::new(RemoteStartStopResponse {
            status: RemoteStartStopStatus::Accepted,
        })?
        .then(async move {
            if let Err(e) = device.remote_stop(request.transaction_id).await {
                device
                    .inner
                    .events
                    .log(LogLevel::Error, format!("Remote stop failed: {}", e));
            }
        }))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Finishing + StopTransaction; no-op without an active transaction
    async fn stop_transaction(&self, reason: StopReason) {
        self.stop_meter();

        let stop = {
            let mut state = self.inner.state.lock();
            match state.transaction_id {
                Some(transaction_id) => {
                    state.status = DeviceStatus::Finishing;
                    Some((
                        state.clone(),
                        StopTransactionRequest {
                            transaction_id,
                            meter_stop: state.meter_value,
                            timestamp: chrono::Utc::now(),
                            id_tag: state.id_tag.clone(),
                            reason: Some(reason),
                        },
                    ))
                }
                None => None,
            }
        };

        let Some((snapshot, request)) = stop else {
            return;
        };
        self.publish(&snapshot);

        info!(
            "Stopping transaction {} at {} Wh ({:?})",
            request.transaction_id, request.meter_stop, reason
        );
        if let Err(e) = self
            .inner
            .correlator
            .send(Action::StopTransaction, request)
            .await
        {
            self.inner
                .events
                .log(LogLevel::Error, format!("StopTransaction failed: {}", e));
        }
    }

    /// Close a transaction the CSMS opened after the connector moved on
    async fn abandon_transaction(&self, transaction_id: i32, id_tag: String, meter_start: i64) {
        let reason = match self.snapshot().status {
            DeviceStatus::Faulted => StopReason::EmergencyStop,
            _ => StopReason::Local,
        };
        warn!(
            "Transaction {} accepted after the connector left Preparing, stopping it ({:?})",
            transaction_id, reason
        );

        let request = StopTransactionRequest {
            transaction_id,
            meter_stop: meter_start,
            timestamp: chrono::Utc::now(),
            id_tag: Some(id_tag),
            reason: Some(reason),
        };
        if let Err(e) = self
            .inner
            .correlator
            .send(Action::StopTransaction, request)
            .await
        {
            self.inner
                .events
                .log(LogLevel::Error, format!("StopTransaction failed: {}", e));
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        allowed: &[DeviceStatus],
        apply: impl FnOnce(&mut DeviceState),
    ) -> Result<(), DeviceError> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if !allowed.contains(&state.status) {
                return Err(DeviceError::InvalidState {
                    operation,
                    status: state.status,
                });
            }
            apply(&mut state);
            state.clone()
        };
        self.publish(&snapshot);
        Ok(())
    }

    fn force_transition(&self, apply: impl FnOnce(&mut DeviceState)) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            apply(&mut state);
            state.clone()
        };
        self.publish(&snapshot);
    }

    fn publish(&self, snapshot: &DeviceState) {
        debug!("Device now {:?}", snapshot.status);
        self.inner.events.emit(CpEvent::Device {
            snapshot: snapshot.clone(),
        });
        self.report_status(snapshot);
    }

    fn report_status(&self, snapshot: &DeviceState) {
        self.inner.correlator.notify(
            Action::StatusNotification,
            StatusNotificationRequest {
                connector_id: snapshot.connector_id,
                error_code: snapshot.error_code,
                status: snapshot.status.as_ocpp(),
                timestamp: Some(chrono::Utc::now()),
            },
        );
    }

    fn start_meter(&self) {
        let weak: Weak<DeviceInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.meter_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let value = {
                    let mut state = inner.state.lock();
                    if state.status != DeviceStatus::Charging {
                        return;
                    }
                    state.meter_value += rand::thread_rng().gen_range(50..150);
                    state.meter_value
                };
                inner.events.emit(CpEvent::Meter { value });
            }
        });

        if let Some(previous) = self.inner.meter_task.lock().replace(handle) {
            warn!("Meter task was still running, replacing it");
            previous.abort();
        }
    }

    fn stop_meter(&self) {
        if let Some(task) = self.inner.meter_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Answers every CALL right away and remembers it
    fn auto_csms(correlator: &Correlator, start_status: &'static str) -> Arc<Mutex<Vec<Call>>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        correlator.attach(Arc::new(tx));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (correlator, recorded) = (correlator.clone(), seen.clone());
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Ok(Frame::Call(call)) = decode(text.as_bytes()) {
                    let payload = match call.action.as_str() {
                        "StartTransaction" => {
                            json!({"idTagInfo": {"status": start_status}, "transactionId": 42})
                        }
                        _ => json!({}),
                    };
                    recorded.lock().push(call.clone());
                    correlator.resolve_result(CallResult {
                        message_id: call.message_id,
                        payload,
                    });
                }
            }
        });
        seen
    }

    fn device(start_status: &'static str) -> (Device, Arc<Mutex<Vec<Call>>>) {
        let config = CpConfig::default();
        let correlator = Correlator::new(config.request_timeout);
        let calls = auto_csms(&correlator, start_status);
        (Device::new(&config, correlator, EventBus::default()), calls)
    }

    fn reported_statuses(calls: &Mutex<Vec<Call>>) -> Vec<String> {
        calls
            .lock()
            .iter()
            .filter(|c| c.action == "StatusNotification")
            .filter_map(|c| c.payload["status"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_plug_swipe_remote_stop() {
        let (device, calls) = device("Accepted");

        device.plug_in().unwrap();
        assert_eq!(device.snapshot().status, DeviceStatus::Preparing);

        let transaction_id = device.swipe_card("DEMO_CARD_002").await.unwrap();
        assert_eq!(transaction_id, 42);

        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Charging);
        assert_eq!(state.transaction_id, Some(42));
        assert_eq!(state.id_tag.as_deref(), Some("DEMO_CARD_002"));

        tokio::time::sleep(Duration::from_secs(7)).await;
        let meter_at_stop = device.snapshot().meter_value;
        assert!(meter_at_stop >= 150, "meter advanced: {}", meter_at_stop);

        let reply = device
            .handle_remote_stop(json!({"transactionId": 42}))
            .unwrap();
        assert_eq!(reply.payload, json!({"status": "Accepted"}));
        reply.follow_up.unwrap().await;

        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Available);
        assert_eq!(state.transaction_id, None);
        assert_eq!(state.id_tag, None);
        assert_eq!(state.meter_value, meter_at_stop);

        // No more increments after leaving Charging
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(device.snapshot().meter_value, meter_at_stop);

        let stop = calls
            .lock()
            .iter()
            .find(|c| c.action == "StopTransaction")
            .cloned()
            .unwrap();
        assert_eq!(stop.payload["transactionId"], 42);
        assert_eq!(stop.payload["meterStop"], meter_at_stop);
        assert_eq!(stop.payload["reason"], "Remote");

        assert_eq!(
            reported_statuses(&calls),
            vec!["Preparing", "Charging", "Finishing", "Available"]
        );
    }

    /// Like `auto_csms`, but StartTransaction is handed to the test unanswered
    fn held_start_csms(
        correlator: &Correlator,
    ) -> (Arc<Mutex<Vec<Call>>>, mpsc::UnboundedReceiver<Call>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        correlator.attach(Arc::new(tx));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (held_tx, held_rx) = mpsc::unbounded_channel::<Call>();
        let (correlator, recorded) = (correlator.clone(), seen.clone());
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Ok(Frame::Call(call)) = decode(text.as_bytes()) {
                    recorded.lock().push(call.clone());
                    if call.action == "StartTransaction" {
                        let _ = held_tx.send(call);
                    } else {
                        correlator.resolve_result(CallResult {
                            message_id: call.message_id,
                            payload: json!({}),
                        });
                    }
                }
            }
        });
        (seen, held_rx)
    }

    #[tokio::test]
    async fn test_unplug_during_start_stops_late_transaction() {
        let config = CpConfig::default();
        let correlator = Correlator::new(config.request_timeout);
        let (calls, mut held) = held_start_csms(&correlator);
        let device = Device::new(&config, correlator.clone(), EventBus::default());

        device.plug_in().unwrap();
        let swiping = tokio::spawn({
            let device = device.clone();
            async move { device.swipe_card("DEMO_CARD_002").await }
        });
        let start = held.recv().await.unwrap();

        device.unplug().await.unwrap();
        correlator.resolve_result(CallResult {
            message_id: start.message_id,
            payload: json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 42}),
        });

        let result = swiping.await.unwrap();
        assert!(matches!(
            result,
            Err(DeviceError::InvalidState {
                status: DeviceStatus::Available,
                ..
            })
        ));

        let stop = calls
            .lock()
            .iter()
            .find(|c| c.action == "StopTransaction")
            .cloned()
            .expect("late transaction is stopped");
        assert_eq!(stop.payload["transactionId"], 42);
        assert_eq!(stop.payload["reason"], "Local");
        assert_eq!(stop.payload["idTag"], "DEMO_CARD_002");

        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Available);
        assert_eq!(state.transaction_id, None);
    }

    #[tokio::test]
    async fn test_rejection_after_fault_keeps_faulted() {
        let config = CpConfig::default();
        let correlator = Correlator::new(config.request_timeout);
        let (calls, mut held) = held_start_csms(&correlator);
        let device = Device::new(&config, correlator.clone(), EventBus::default());

        device.plug_in().unwrap();
        let swiping = tokio::spawn({
            let device = device.clone();
            async move { device.swipe_card("UNKNOWN").await }
        });
        let start = held.recv().await.unwrap();

        device.fault(ChargePointErrorCode::GroundFailure).await;
        correlator.resolve_result(CallResult {
            message_id: start.message_id,
            payload: json!({"idTagInfo": {"status": "Invalid"}}),
        });

        assert!(matches!(
            swiping.await.unwrap(),
            Err(DeviceError::Rejected(AuthorizationStatus::Invalid))
        ));
        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Faulted);
        assert_eq!(state.error_code, ChargePointErrorCode::GroundFailure);
        assert!(!calls.lock().iter().any(|c| c.action == "StopTransaction"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_card_returns_to_available() {
        let (device, _calls) = device("Invalid");

        device.plug_in().unwrap();
        let err = device.swipe_card("UNKNOWN").await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(AuthorizationStatus::Invalid)));

        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Available);
        assert_eq!(state.id_tag, None);
        assert_eq!(state.transaction_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swipe_requires_cable() {
        let (device, calls) = device("Accepted");

        let err = device.swipe_card("DEMO_CARD_002").await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidState {
                status: DeviceStatus::Available,
                ..
            }
        ));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplug_stops_local_transaction() {
        let (device, calls) = device("Accepted");

        device.plug_in().unwrap();
        device.swipe_card("DEMO_CARD_002").await.unwrap();
        device.unplug().await.unwrap();

        assert_eq!(device.snapshot().status, DeviceStatus::Available);
        let stop = calls
            .lock()
            .iter()
            .find(|c| c.action == "StopTransaction")
            .cloned()
            .unwrap();
        assert_eq!(stop.payload["reason"], "Local");
        assert_eq!(stop.payload["idTag"], "DEMO_CARD_002");

        assert!(device.unplug().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_start_from_available() {
        let (device, _calls) = device("Accepted");

        let reply = device
            .handle_remote_start(json!({"idTag": "REMOTE_TAG", "connectorId": 1}))
            .unwrap();
        assert_eq!(reply.payload, json!({"status": "Accepted"}));
        reply.follow_up.unwrap().await;

        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Charging);
        assert_eq!(state.id_tag.as_deref(), Some("REMOTE_TAG"));

        // Busy connector refuses a second start
        let reply = device
            .handle_remote_start(json!({"idTag": "OTHER"}))
            .unwrap();
        assert_eq!(reply.payload, json!({"status": "Rejected"}));
        assert!(reply.follow_up.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_stop_wrong_transaction() {
        let (device, _calls) = device("Accepted");

        let reply = device
            .handle_remote_stop(json!({"transactionId": 7}))
            .unwrap();
        assert_eq!(reply.payload, json!({"status": "Rejected"}));

        assert!(matches!(
            device.remote_stop(7).await,
            Err(DeviceError::TransactionMismatch { requested: 7, active: None })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_and_clear() {
        let (device, calls) = device("Accepted");

        assert!(device.clear_fault().is_err());

        device.fault(ChargePointErrorCode::GroundFailure).await;
        let state = device.snapshot();
        assert_eq!(state.status, DeviceStatus::Faulted);
        assert_eq!(state.error_code, ChargePointErrorCode::GroundFailure);
        assert!(device.plug_in().is_err());

        device.clear_fault().unwrap();
        assert_eq!(device.snapshot().status, DeviceStatus::Available);
        assert_eq!(device.snapshot().error_code, ChargePointErrorCode::NoError);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let faulted = calls
            .lock()
            .iter()
            .find(|c| c.payload["status"] == "Faulted")
            .cloned()
            .unwrap();
        assert_eq!(faulted.payload["errorCode"], "GroundFailure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_current_status() {
        let (device, calls) = device("Accepted");

        device.set_connected(true);
        device.set_connected(true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(device.snapshot().ocpp_connected);
        assert_eq!(reported_statuses(&calls), vec!["Available"]);
    }
}
