//! Notification events for presentation layers
//!
//! Events are one-way and best-effort: with no subscriber attached they are
//! simply dropped, and a slow subscriber loses the oldest ones.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::connection::ConnectionState;
use crate::device::DeviceState;
use crate::ocpp::DiagnosticsStatus;

/// Severity attached to operator-facing log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Something observers may want to render
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CpEvent {
    Connection { state: ConnectionState },
    Device { snapshot: DeviceState },
    Meter { value: i64 },
    Log { level: LogLevel, message: String },
    Diagnostics {
        status: DiagnosticsStatus,
        location: String,
    },
}

/// Fan-out point for [`CpEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CpEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CpEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CpEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Log through tracing and forward the line to observers
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.emit(CpEvent::Log { level, message });
    }
}

/// Next event for an observer; skipped events are logged, not fatal
///
/// Returns `None` once every sender is gone.
pub async fn next_event(rx: &mut broadcast::Receiver<CpEvent>) -> Option<CpEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event observer fell behind, {} events skipped", skipped)
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        bus.emit(CpEvent::Meter { value: 10 });
        bus.log(LogLevel::Info, "nobody listens");
    }

    #[tokio::test]
    async fn test_subscriber_sees_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(CpEvent::Meter { value: 1 });
        bus.log(LogLevel::Warning, "second");

        assert!(matches!(rx.recv().await.unwrap(), CpEvent::Meter { value: 1 }));
        match rx.recv().await.unwrap() {
            CpEvent::Log { level, message } => {
                assert_eq!(level, LogLevel::Warning);
                assert_eq!(message, "second");
            }
            other => panic!("Expected log, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lagging_observer_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for value in 0..5 {
            bus.emit(CpEvent::Meter { value });
        }
        // The two newest survive
        assert!(matches!(next_event(&mut rx).await, Some(CpEvent::Meter { value: 3 })));
        assert!(matches!(next_event(&mut rx).await, Some(CpEvent::Meter { value: 4 })));

        bus.emit(CpEvent::Meter { value: 5 });
        assert!(matches!(next_event(&mut rx).await, Some(CpEvent::Meter { value: 5 })));

        drop(bus);
        assert!(next_event(&mut rx).await.is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(CpEvent::Diagnostics {
            status: DiagnosticsStatus::Uploading,
            location: "http://sink.example/upload".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "diagnostics");
        assert_eq!(json["status"], "Uploading");
    }
}
