//! Diagnostics bundle
//!
//! The charge point has no real filesystem to collect from, so the bundle is
//! built from a [`FileSource`]. [`SimulatedFiles`] serves the configuration
//! and log files a field unit would carry, credentials included.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::upload::UploadError;

/// One file to put in the bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticFile {
    /// Path inside the archive, no leading slash
    pub path: String,
    pub content: String,
}

impl DiagnosticFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Where the bundle contents come from
pub trait FileSource: Send + Sync {
    fn files(&self) -> Vec<DiagnosticFile>;
}

/// Built-in configuration and log files of the simulated unit
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedFiles;

impl SimulatedFiles {
    /// Everything in one text dump, with a header per file
    pub fn combined_dump(&self) -> String {
        let mut dump = String::new();
        dump.push_str("========================================\n");
        dump.push_str("CHARGE POINT DIAGNOSTICS DUMP\n");
        dump.push_str(&format!("Generated: {}\n", chrono::Utc::now().to_rfc3339()));
        dump.push_str("========================================\n\n");

        for (path, content) in SIMULATED {
            dump.push_str(&format!("### FILE: /{} ###\n", path));
            dump.push_str(content);
            dump.push('\n');
        }

        dump.push_str("======== END OF DIAGNOSTICS ========\n");
        dump
    }
}

impl FileSource for SimulatedFiles {
    fn files(&self) -> Vec<DiagnosticFile> {
        let mut files: Vec<_> = SIMULATED
            .iter()
            .map(|(path, content)| DiagnosticFile::new(*path, *content))
            .collect();
        files.push(DiagnosticFile::new("diagnostics.txt", self.combined_dump()));
        files
    }
}

/// Build an in-memory ZIP (deflate) from `files`
pub fn build_archive(files: &[DiagnosticFile]) -> Result<Vec<u8>, UploadError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in files {
        writer.start_file(file.path.as_str(), options)?;
        writer.write_all(file.content.as_bytes())?;
    }

    Ok(writer.finish()?.into_inner())
}

const SIMULATED: [(&str, &str); 4] = [
    ("etc/wpa_supplicant/wpa_supplicant.conf", WPA_SUPPLICANT_CONF),
    ("etc/chargepoint/ocpp.conf", OCPP_CONF),
    ("var/log/chargepoint/system_info.log", SYSTEM_INFO_LOG),
    ("var/log/chargepoint/error.log", ERROR_LOG),
];

const WPA_SUPPLICANT_CONF: &str = r#"# /etc/wpa_supplicant/wpa_supplicant.conf
# WARNING: This file contains sensitive credentials!
# Last modified: 2024-12-20

ctrl_interface=/var/run/wpa_supplicant
update_config=1
country=TR

network={
    ssid="CompanySecure"
    psk="Admin123!"
    key_mgmt=WPA-PSK
    priority=5
}

network={
    ssid="ChargePointBackup"
    psk="Backup@2024#Secure"
    key_mgmt=WPA-PSK
    priority=3
}

network={
    ssid="MaintenanceWiFi"
    psk="M4int3n4nc3P@ss"
    key_mgmt=WPA-PSK
    priority=1
}
"#;

const OCPP_CONF: &str = r#"# /etc/chargepoint/ocpp.conf
# OCPP Client Configuration
# DO NOT SHARE - Contains authentication credentials

[connection]
csms_url=ws://csms.company.com:8180/ocpp
charge_point_id=CP001
connection_timeout=30

[authentication]
# Basic Auth credentials for CSMS
auth_username=cp_service_account
auth_password=CsmsP@ssw0rd!2024

# Client certificate paths
client_cert=/etc/chargepoint/certs/client.pem
client_key=/etc/chargepoint/certs/client.key
# Private key password
key_password=CertKeyP@ss!

[backend_api]
# REST API for remote management
api_endpoint=https://api.company.com/chargepoints
api_key=sk_test_mock_api_key_for_demo
api_secret=whsec_mock_secret_for_demo

[database]
# Local SQLite for transaction logs
db_path=/var/lib/chargepoint/transactions.db
db_password=LocalDb#Secret
"#;

const SYSTEM_INFO_LOG: &str = r#"# /var/log/chargepoint/system_info.log
# System Information Dump
# Generated: 2024-12-25 10:30:00

=== SYSTEM ===
Hostname: CP001-Istanbul
Model: PowerCharge Pro 150kW
Firmware: v2.4.1
Serial: PCH-2024-001234

=== NETWORK ===
eth0: 192.168.1.50/24
wlan0: 192.168.2.105/24
Default Gateway: 192.168.1.1
DNS: 8.8.8.8, 8.8.4.4

=== WIFI STATUS ===
SSID: CompanySecure
Signal: -45 dBm
Frequency: 5.2 GHz
Security: WPA2-PSK

=== VPN ===
OpenVPN Status: Connected
VPN Server: vpn.company.com
VPN Username: chargepoint_cp001
VPN Password: VpnAccess@2024

=== REMOTE ACCESS ===
SSH: Enabled (Port 22)
SSH User: admin
SSH Password: SshAdmin#2024

Telnet: Enabled (Port 23)
Telnet Password: TelnetPass123
"#;

const ERROR_LOG: &str = r#"# /var/log/chargepoint/error.log
# Error log - Last 50 entries

[2024-12-25 08:15:32] ERROR: OCPP connection failed
  Reason: Authentication failed
  URL: ws://csms.company.com:8180/ocpp
  Credentials used: cp_service_account / CsmsP@ssw0rd!2024

[2024-12-25 08:20:15] WARN: Payment gateway timeout
  Gateway: https://payment.company.com/api/v1
  API Key: pk_test_mock_key_12345

[2024-12-25 09:00:00] INFO: Firmware update check
  Update server: https://firmware.company.com
  Auth token: eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9.secret
"#;
