//! # OCPP 1.6J Charge Point
//!
//! A simulated charging station that speaks OCPP 1.6J over WebSocket and
//! honors `GetDiagnostics` the way many field units do: it zips its
//! configuration and log files and uploads them to whatever URL the CSMS
//! names, without validating it.
//!
//! ## Architecture
//!
//! ```text
//! OCPP CSMS (Backend)
//!       │ WebSocket JSON arrays (ocpp1.6)
//!       ▼
//! ┌──────────────────────────────────────────┐
//! │  ConnectionManager  (boot, heartbeat,    │
//! │                      reconnect)          │
//! │        │ CALL              ▲ frames      │
//! │        ▼                   │             │
//! │  Dispatcher ──────► Correlator           │
//! │   ├─ DiagnosticsWorkflow ──┐             │
//! │   ├─ Device (remote start/stop)          │
//! │   └─ Reset / ChangeConfiguration /       │
//! │      GetConfiguration                    │
//! └────────────────────────────┼─────────────┘
//!                              │ HTTP multipart POST (unvalidated URL)
//!                              ▼
//!                      receiving endpoint
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_cp::{ChargePoint, CpConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CpConfig::new(
//!         "CP001",
//!         "ws://localhost:8180/steve/websocket/CentralSystemService",
//!     );
//!
//!     let charge_point = ChargePoint::new(config)?;
//!     let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//!     charge_point.run(stop_rx).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## GetDiagnostics Flow
//!
//! 1. CSMS sends `GetDiagnostics {location}`
//! 2. Charge point replies `{fileName}` immediately
//! 3. `DiagnosticsStatusNotification {Uploading}`
//! 4. ZIP of the configuration files is POSTed to `location`
//! 5. `DiagnosticsStatusNotification {Uploaded | UploadFailed}`

pub mod ocpp;
pub mod config;
pub mod events;
pub mod connection;
pub mod dispatcher;
pub mod diagnostics;
pub mod device;
pub mod chargepoint;

pub use chargepoint::{ChargePoint, ChargePointBuilder};
pub use config::{ConfigError, CpConfig};
pub use connection::{ConnectionManager, ConnectionState, Lifecycle, LinkAction, LinkEvent};
pub use device::{Device, DeviceError, DeviceState, DeviceStatus};
pub use diagnostics::{DiagnosticsWorkflow, HttpUploader, UploadError, Uploader};
pub use dispatcher::{CallHandler, Dispatcher, Reply};
pub use events::{next_event, CpEvent, EventBus, LogLevel};

// Re-export key types
pub use ocpp::{Action, Correlator, ErrorCode, Frame, OcppError};
