//! Configuration for the charge point
//!
//! Identity reported in BootNotification, the CSMS endpoint and the timers
//! that drive the connection, device and diagnostics components.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Uri;

/// Startup configuration problems; the only fatal errors in the system
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid CSMS URL {0}")]
    InvalidUrl(String),

    #[error("Unsupported CSMS URL scheme {0} (expected ws or wss)")]
    UnsupportedScheme(String),

    #[error("Charge point ID must not be empty")]
    EmptyChargePointId,
}

/// Complete charge point configuration
#[derive(Debug, Clone)]
pub struct CpConfig {
    /// CSMS WebSocket URL (without charge point ID)
    pub csms_url: String,

    /// Charge point identity (appended to URL, used in diagnostics filenames)
    pub charge_point_id: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,

    /// Connector reported in StatusNotification and transactions
    pub connector_id: i32,

    /// Fixed delay before reconnecting after the transport drops
    pub reconnect_delay: Duration,

    /// How long a CALL may stay unanswered
    pub request_timeout: Duration,

    /// WebSocket handshake timeout
    pub handshake_timeout: Duration,

    /// Heartbeat interval used when BootNotification does not carry one
    pub default_heartbeat_interval: Duration,

    /// Meter increment period while charging
    pub meter_interval: Duration,

    /// Timeout for the diagnostics HTTP upload
    pub upload_timeout: Duration,

    /// Buffer size of the event channel
    pub event_capacity: usize,
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            charge_point_id: "CP001".to_string(),
            vendor: "PowerCharge".to_string(),
            model: "Pro-3000".to_string(),
            serial_number: Some("SN-DEMO-001".to_string()),
            firmware_version: Some("1.0.0".to_string()),
            meter_type: Some("VirtualMeter".to_string()),
            connector_id: 1,
            reconnect_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            default_heartbeat_interval: Duration::from_secs(60),
            meter_interval: Duration::from_secs(2),
            upload_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl CpConfig {
    /// Create config with basic parameters
    pub fn new(charge_point_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            csms_url: csms_url.into(),
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    /// Set serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_meter_interval(mut self, interval: Duration) -> Self {
        self.meter_interval = interval;
        self
    }

    /// Full WebSocket URL: `<csms_url>/<charge_point_id>`
    pub fn ws_url(&self) -> String {
        build_ocpp_url(&self.csms_url, &self.charge_point_id)
    }

    /// Reject configurations the charge point cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.charge_point_id.trim().is_empty() {
            return Err(ConfigError::EmptyChargePointId);
        }

        let url = self.ws_url();
        let uri: Uri = url
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(url.clone()))?;

        match uri.scheme_str() {
            Some("ws") | Some("wss") => {}
            Some(other) => return Err(ConfigError::UnsupportedScheme(other.to_string())),
            None => return Err(ConfigError::InvalidUrl(url)),
        }

        if uri.host().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidUrl(url));
        }

        Ok(())
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, charge_point_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
}
