//! Connection lifecycle
//!
//! Owns the WebSocket to the CSMS and drives:
//! - the BootNotification handshake (retried while Pending/Rejected)
//! - the Heartbeat keep-alive at the interval the CSMS granted
//! - reconnection after a fixed delay when the transport is lost
//!
//! The rules live in [`Lifecycle`], a pure state machine that turns
//! [`LinkEvent`]s into [`LinkAction`]s. [`ConnectionManager`] is the single
//! task that feeds it events and performs the actions. Timer and boot results
//! are tagged with the connection epoch they belong to; anything from an
//! earlier connection is discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::config::CpConfig;
use crate::events::{CpEvent, EventBus, LogLevel};
use crate::ocpp::*;

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;

/// Connection state as seen by the rest of the charge point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No transport; a reconnect may be scheduled
    Disconnected,
    /// WebSocket handshake in progress
    Connecting,
    /// Transport open, BootNotification not accepted yet
    AwaitingBootAck,
    /// Registered with the CSMS
    Ready,
}

/// Inputs to the lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Start,
    ReconnectDue,
    Opened,
    /// Zero means the CSMS did not grant an interval
    BootAccepted { interval: Duration },
    /// Pending, Rejected or a failed boot call; zero means no hint
    BootNotAccepted { retry_after: Duration },
    BootRetryDue,
    Closed,
    Shutdown,
}

/// Side effects requested by the lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Connect,
    SendBoot,
    StartHeartbeat(Duration),
    StopHeartbeat,
    RejectPending,
    ScheduleReconnect(Duration),
    ScheduleBootRetry(Duration),
    CloseTransport,
}

/// Connection lifecycle rules
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    shut_down: bool,
    reconnect_delay: Duration,
    default_interval: Duration,
}

impl Lifecycle {
    /// Create a new lifecycle in `Disconnected`
    pub fn new(reconnect_delay: Duration, default_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            shut_down: false,
            reconnect_delay,
            default_interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Apply one event and return the actions to perform, in order
    pub fn handle_event(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        debug!("Lifecycle event {:?} in {:?}", event, self.state);

        match event {
            LinkEvent::Start | LinkEvent::ReconnectDue => {
                if self.shut_down || self.state != ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.state = ConnectionState::Connecting;
                vec![LinkAction::Connect]
            }

            LinkEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    return Vec::new();
                }
                self.state = ConnectionState::AwaitingBootAck;
                vec![LinkAction::SendBoot]
            }

            LinkEvent::BootAccepted { interval } => {
                if self.state != ConnectionState::AwaitingBootAck {
                    return Vec::new();
                }
                self.state = ConnectionState::Ready;
                vec![LinkAction::StartHeartbeat(self.or_default(interval))]
            }

            LinkEvent::BootNotAccepted { retry_after } => {
                if self.state != ConnectionState::AwaitingBootAck {
                    return Vec::new();
                }
                vec![LinkAction::ScheduleBootRetry(self.or_default(retry_after))]
            }

            LinkEvent::BootRetryDue => {
                if self.state != ConnectionState::AwaitingBootAck {
                    return Vec::new();
                }
                vec![LinkAction::SendBoot]
            }

            LinkEvent::Closed => {
                if self.state == ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;
                let mut actions = vec![LinkAction::StopHeartbeat, LinkAction::RejectPending];
                if !self.shut_down {
                    actions.push(LinkAction::ScheduleReconnect(self.reconnect_delay));
                }
                actions
            }

            LinkEvent::Shutdown => {
                self.shut_down = true;
                if self.state == ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;
                vec![
                    LinkAction::StopHeartbeat,
                    LinkAction::RejectPending,
                    LinkAction::CloseTransport,
                ]
            }
        }
    }

    fn or_default(&self, interval: Duration) -> Duration {
        if interval.is_zero() {
            self.default_interval
        } else {
            interval
        }
    }
}

/// Receives the CALLs the CSMS sends
pub trait InboundCalls: Send + Sync {
    fn on_call(&self, call: Call);
}

/// Runs the connection lifecycle on one task
pub struct ConnectionManager {
    config: Arc<CpConfig>,
    correlator: Correlator,
    events: EventBus,
    inbound: Arc<dyn InboundCalls>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Per-connection tasks owned by the driver
#[derive(Default)]
struct Tasks {
    reader: Option<WsReader>,
    writer: Option<JoinHandle<()>>,
    boot: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_timers(&mut self) {
        for handle in [self.boot.take(), self.heartbeat.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    fn drop_transport(&mut self) {
        self.reader = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(
        config: Arc<CpConfig>,
        correlator: Correlator,
        events: EventBus,
        inbound: Arc<dyn InboundCalls>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            correlator,
            events,
            inbound,
            state_tx,
        }
    }

    /// Subscribe to connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Run until `shutdown` turns true (or its sender is dropped)
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), OcppError> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(u64, LinkEvent)>();
        let mut lifecycle = Lifecycle::new(
            self.config.reconnect_delay,
            self.config.default_heartbeat_interval,
        );
        let mut tasks = Tasks::default();
        let mut epoch: u64 = 0;
        let mut queue = VecDeque::from([LinkEvent::Start]);

        loop {
            while let Some(event) = queue.pop_front() {
                let before = lifecycle.state();
                let actions = lifecycle.handle_event(event);
                if lifecycle.state() != before {
                    self.publish(lifecycle.state());
                }

                for action in actions {
                    match action {
                        LinkAction::Connect => {
                            epoch += 1;
                            let url = self.config.ws_url();
                            info!("Connecting to CSMS: {} (connection #{})", url, epoch);

                            tokio::select! {
                                result = open(&url, self.config.handshake_timeout) => match result {
                                    Ok(stream) => {
                                        info!("WebSocket connected to {}", url);
                                        let reader = self.attach(stream, &mut tasks);
                                        tasks.reader = Some(reader);
                                        queue.push_back(LinkEvent::Opened);
                                    }
                                    Err(e) => {
                                        error!("WebSocket connection failed: {}", e);
                                        queue.push_back(LinkEvent::Closed);
                                    }
                                },
                                _ = shutdown_requested(&mut shutdown) => {
                                    info!("Shutdown requested while connecting");
                                    queue.push_back(LinkEvent::Shutdown);
                                }
                            }
                        }

                        LinkAction::SendBoot => {
                            if let Some(old) = tasks.boot.take() {
                                old.abort();
                            }
                            tasks.boot = Some(self.spawn_boot(epoch, event_tx.clone()));
                        }

                        LinkAction::StartHeartbeat(interval) => {
                            self.events.log(
                                LogLevel::Success,
                                format!("Registered with CSMS, heartbeat every {}s", interval.as_secs()),
                            );
                            if let Some(old) = tasks.heartbeat.take() {
                                old.abort();
                            }
                            tasks.heartbeat = Some(self.spawn_heartbeat(interval));
                        }

                        LinkAction::StopHeartbeat => {
                            if let Some(heartbeat) = tasks.heartbeat.take() {
                                heartbeat.abort();
                            }
                            if let Some(boot) = tasks.boot.take() {
                                boot.abort();
                            }
                        }

                        LinkAction::RejectPending => {
                            let rejected = self.correlator.detach();
                            if rejected > 0 {
                                warn!("Rejected {} pending calls: connection closed", rejected);
                            }
                        }

                        LinkAction::ScheduleReconnect(delay) => {
                            info!("Reconnecting in {:?}", delay);
                            tasks.reconnect =
                                Some(schedule(delay, epoch, LinkEvent::ReconnectDue, event_tx.clone()));
                        }

                        LinkAction::ScheduleBootRetry(delay) => {
                            info!("Retrying BootNotification in {:?}", delay);
                            tasks.boot =
                                Some(schedule(delay, epoch, LinkEvent::BootRetryDue, event_tx.clone()));
                        }

                        LinkAction::CloseTransport => {
                            tasks.reader = None;
                            // The writer sends a Close frame once the link is detached
                            if let Some(writer) = tasks.writer.take() {
                                if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
                                    debug!("Writer did not finish closing in time");
                                }
                            }
                        }
                    }
                }
            }

            if lifecycle.is_shut_down() && lifecycle.state() == ConnectionState::Disconnected {
                break;
            }

            tokio::select! {
                frame = next_message(&mut tasks.reader) => match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received: {}", text.as_str());
                        self.route(text.as_str());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring binary WebSocket message");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed by CSMS: {:?}", frame);
                        tasks.drop_transport();
                        queue.push_back(LinkEvent::Closed);
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        tasks.drop_transport();
                        queue.push_back(LinkEvent::Closed);
                    }
                    None => {
                        info!("WebSocket stream ended");
                        tasks.drop_transport();
                        queue.push_back(LinkEvent::Closed);
                    }
                },

                Some((tag, event)) = event_rx.recv() => {
                    if tag == epoch {
                        queue.push_back(event);
                    } else {
                        debug!("Discarding {:?} from connection #{}", event, tag);
                    }
                }

                _ = shutdown_requested(&mut shutdown), if !lifecycle.is_shut_down() => {
                    info!("Shutdown requested");
                    queue.push_back(LinkEvent::Shutdown);
                }
            }
        }

        tasks.abort_timers();
        tasks.drop_transport();
        self.correlator.detach();
        info!("Connection manager stopped");
        Ok(())
    }

    fn publish(&self, state: ConnectionState) {
        info!("Connection state: {:?}", state);
        self.state_tx.send_replace(state);
        self.events.emit(CpEvent::Connection { state });
    }

    /// Split the stream, start the writer and hand its sender to the correlator
    fn attach(&self, stream: WsStream, tasks: &mut Tasks) -> WsReader {
        let (mut ws_tx, ws_rx) = stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();

        tasks.writer = Some(tokio::spawn(async move {
            while let Some(text) = send_rx.recv().await {
                debug!("Sending: {}", text);
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        }));

        self.correlator.attach(Arc::new(send_tx));
        ws_rx
    }

    fn route(&self, text: &str) {
        match decode(text.as_bytes()) {
            Ok(Frame::Call(call)) => self.inbound.on_call(call),
            Ok(Frame::CallResult(result)) => {
                self.correlator.resolve_result(result);
            }
            Ok(Frame::CallError(error)) => {
                self.correlator.resolve_error(error);
            }
            Err(e) => warn!("Discarding malformed frame: {} ({})", e, text),
        }
    }

    fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: self.config.vendor.clone(),
            charge_point_model: self.config.model.clone(),
            charge_point_serial_number: self.config.serial_number.clone(),
            charge_box_serial_number: self.config.serial_number.clone(),
            firmware_version: self.config.firmware_version.clone(),
            meter_type: self.config.meter_type.clone(),
            meter_serial_number: None,
        }
    }

    fn spawn_boot(&self, epoch: u64, events: mpsc::UnboundedSender<(u64, LinkEvent)>) -> JoinHandle<()> {
        let correlator = self.correlator.clone();
        let request = self.boot_request();

        tokio::spawn(async move {
            let outcome = correlator
                .send(Action::BootNotification, request)
                .await
                .and_then(|payload| Ok(serde_json::from_value::<BootNotificationResponse>(payload)?));

            let event = match outcome {
                Ok(response) => {
                    let interval = Duration::from_secs(
                        response.interval.filter(|s| *s > 0).unwrap_or(0) as u64,
                    );
                    match response.status {
                        RegistrationStatus::Accepted => LinkEvent::BootAccepted { interval },
                        status => {
                            warn!("BootNotification {:?}", status);
                            LinkEvent::BootNotAccepted { retry_after: interval }
                        }
                    }
                }
                Err(e) => {
                    warn!("BootNotification failed: {}", e);
                    LinkEvent::BootNotAccepted {
                        retry_after: Duration::ZERO,
                    }
                }
            };

            let _ = events.send((epoch, event));
        })
    }

    fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let correlator = self.correlator.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                // The next tick must not wait on this answer
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    heartbeat_ack(correlator.send(Action::Heartbeat, HeartbeatRequest {}).await);
                });
            }
        })
    }
}

/// Log the CSMS clock from a Heartbeat answer
fn heartbeat_ack(outcome: Result<Value, OcppError>) -> Option<DateTime<Utc>> {
    let parsed = outcome
        .and_then(|payload| Ok(serde_json::from_value::<HeartbeatResponse>(payload)?));
    match parsed {
        Ok(response) => {
            debug!("Heartbeat acknowledged, CSMS time {}", response.current_time);
            Some(response.current_time)
        }
        Err(e) => {
            warn!("Heartbeat failed: {}", e);
            None
        }
    }
}

/// Open the WebSocket with the OCPP subprotocol
async fn open(url: &str, handshake_timeout: Duration) -> Result<WsStream, OcppError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OCPP_SUBPROTOCOL),
    );

    let (stream, response) = tokio::time::timeout(handshake_timeout, connect_async(request))
        .await
        .map_err(|_| OcppError::WebSocket(format!("handshake timed out after {:?}", handshake_timeout)))?
        .map_err(|e| OcppError::WebSocket(e.to_string()))?;

    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "CSMS did not accept the {} subprotocol, got: {:?}",
            OCPP_SUBPROTOCOL, accepted_protocol
        );
    }

    Ok(stream)
}

async fn next_message(
    reader: &mut Option<WsReader>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn schedule(
    delay: Duration,
    epoch: u64,
    event: LinkEvent,
    events: mpsc::UnboundedSender<(u64, LinkEvent)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send((epoch, event));
    })
}
