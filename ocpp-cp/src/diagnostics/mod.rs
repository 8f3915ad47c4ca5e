//! GetDiagnostics handling
//!
//! The charge point answers with the file name right away, then in the
//! background:
//! 1. reports `Uploading`
//! 2. zips its configuration and log files
//! 3. POSTs the archive to the requested location, unchecked
//! 4. reports `Uploaded` or `UploadFailed`
//!
//! There is no retry; `retries`, `retryInterval`, `startTime` and `stopTime`
//! are logged and otherwise ignored.

pub mod archive;
pub mod upload;

pub use archive::{build_archive, DiagnosticFile, FileSource, SimulatedFiles};
pub use upload::{HttpUploader, UploadError, Uploader};

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::CpConfig;
use crate::dispatcher::{CallHandler, Reply};
use crate::events::{CpEvent, EventBus, LogLevel};
use crate::ocpp::{
    Action, Correlator, DiagnosticsStatus, DiagnosticsStatusNotificationRequest,
    GetDiagnosticsRequest, GetDiagnosticsResponse, OcppError,
};

/// One upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsJob {
    pub location: String,
    pub file_name: String,
}

/// Handler for inbound GetDiagnostics
#[derive(Clone)]
pub struct DiagnosticsWorkflow {
    charge_point_id: String,
    correlator: Correlator,
    events: EventBus,
    files: Arc<dyn FileSource>,
    uploader: Arc<dyn Uploader>,
}

impl DiagnosticsWorkflow {
    /// Create a workflow that uploads the simulated files over HTTP
    pub fn new(config: &CpConfig, correlator: Correlator, events: EventBus) -> Self {
        Self {
            charge_point_id: config.charge_point_id.clone(),
            correlator,
            events,
            files: Arc::new(SimulatedFiles),
            uploader: Arc::new(HttpUploader::new(config.upload_timeout)),
        }
    }

    pub fn with_files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = files;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = uploader;
        self
    }

    /// `diagnostics_<chargePointId>_<epochMillis>.zip`
    pub fn file_name(&self) -> String {
        format!(
            "diagnostics_{}_{}.zip",
            self.charge_point_id,
            chrono::Utc::now().timestamp_millis()
        )
    }

    /// Run one upload attempt and report its outcome
    pub async fn upload(&self, job: DiagnosticsJob) -> DiagnosticsStatus {
        self.report(DiagnosticsStatus::Uploading, &job.location);

        let result = match build_archive(&self.files.files()) {
            Ok(archive) => {
                info!(
                    "Uploading {} ({} bytes) to {}",
                    job.file_name,
                    archive.len(),
                    job.location
                );
                self.uploader
                    .upload(&job.location, &job.file_name, archive)
                    .await
            }
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(code) => {
                self.events.log(
                    LogLevel::Success,
                    format!("Diagnostics uploaded to {} (HTTP {})", job.location, code),
                );
                DiagnosticsStatus::Uploaded
            }
            Err(e) => {
                self.events.log(
                    LogLevel::Error,
                    format!("Diagnostics upload to {} failed: {}", job.location, e),
                );
                DiagnosticsStatus::UploadFailed
            }
        };

        self.report(status, &job.location);
        status
    }

    fn report(&self, status: DiagnosticsStatus, location: &str) {
        self.events.emit(CpEvent::Diagnostics {
            status,
            location: location.to_string(),
        });
        self.correlator.notify(
            Action::DiagnosticsStatusNotification,
            DiagnosticsStatusNotificationRequest { status },
        );
    }
}

impl CallHandler for DiagnosticsWorkflow {
    fn handle(&self, payload: Value) -> Result<Reply, OcppError> {
        let request: GetDiagnosticsRequest = if payload.is_null() {
            GetDiagnosticsRequest::default()
        } else {
            serde_json::from_value(payload)?
        };

        // Blank means absent; anything else is used exactly as sent
        let location = request
            .location
            .clone()
            .filter(|l| !l.trim().is_empty());

        let Some(location) = location else {
            self.events
                .log(LogLevel::Warning, "GetDiagnostics without location, nothing to upload");
            return Reply::new(GetDiagnosticsResponse {
                file_name: String::new(),
            });
        };

        if request.retries.is_some()
            || request.retry_interval.is_some()
            || request.start_time.is_some()
            || request.stop_time.is_some()
        {
            info!(
                "Ignoring GetDiagnostics hints: retries={:?} retryInterval={:?} startTime={:?} stopTime={:?}",
                request.retries, request.retry_interval, request.start_time, request.stop_time
            );
        }

        warn!("GetDiagnostics location {} accepted without validation", location);
        self.events.log(
            LogLevel::Warning,
            format!("CSMS requested diagnostics upload to {}", location),
        );

        let job = DiagnosticsJob {
            location,
            file_name: self.file_name(),
        };
        let reply = Reply::new(GetDiagnosticsResponse {
            file_name: job.file_name.clone(),
        })?;

        let workflow = self.clone();
        Ok(reply.then(async move {
            workflow.upload(job).await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::ocpp::{decode, Frame, FrameSink};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Entry {
        Sent(Frame),
        Upload {
            location: String,
            file_name: String,
            entries: Vec<String>,
        },
    }

    #[derive(Default)]
    struct Timeline(Mutex<Vec<Entry>>);

    impl Timeline {
        fn entries(&self) -> Vec<Entry> {
            self.0.lock().clone()
        }
    }

    impl FrameSink for Timeline {
        fn send_frame(&self, text: String) -> Result<(), OcppError> {
            self.0.lock().push(Entry::Sent(decode(text.as_bytes())?));
            Ok(())
        }
    }

    struct MockUploader {
        timeline: Arc<Timeline>,
        status: u16,
    }

    impl Uploader for MockUploader {
        fn upload<'a>(
            &'a self,
            location: &'a str,
            file_name: &'a str,
            archive: Vec<u8>,
        ) -> BoxFuture<'a, Result<u16, UploadError>> {
            async move {
                let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))?;
                let entries = (0..zip.len())
                    .map(|i| zip.by_index(i).map(|entry| entry.name().to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                self.timeline.0.lock().push(Entry::Upload {
                    location: location.to_string(),
                    file_name: file_name.to_string(),
                    entries,
                });
                if (200..300).contains(&self.status) {
                    Ok(self.status)
                } else {
                    Err(UploadError::Status(self.status))
                }
            }
            .boxed()
        }
    }

    fn setup(status: u16) -> (Dispatcher, Arc<Timeline>, EventBus) {
        let config = CpConfig::new("CP001", "ws://localhost:9000/ocpp");
        let correlator = Correlator::new(Duration::from_secs(30));
        let timeline = Arc::new(Timeline::default());
        correlator.attach(timeline.clone());

        let events = EventBus::default();
        let workflow = DiagnosticsWorkflow::new(&config, correlator.clone(), events.clone())
            .with_uploader(Arc::new(MockUploader {
                timeline: timeline.clone(),
                status,
            }));

        let mut dispatcher = Dispatcher::new(correlator);
        dispatcher.register(Action::GetDiagnostics, workflow);
        (dispatcher, timeline, events)
    }

    fn diagnostics_status(entry: &Entry) -> Option<String> {
        match entry {
            Entry::Sent(Frame::Call(call)) if call.action == "DiagnosticsStatusNotification" => {
                call.payload["status"].as_str().map(str::to_string)
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_no_location_means_no_upload() {
        let (dispatcher, timeline, _events) = setup(200);

        assert!(dispatcher.dispatch("gd-1", "GetDiagnostics", json!({})).is_none());
        assert!(dispatcher
            .dispatch("gd-2", "GetDiagnostics", json!({"location": "  "}))
            .is_none());

        let entries = timeline.entries();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            match entry {
                Entry::Sent(Frame::CallResult(result)) => {
                    assert_eq!(result.payload, json!({"fileName": ""}));
                }
                other => panic!("Expected CallResult, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_successful_upload_order() {
        let (dispatcher, timeline, events) = setup(200);
        let mut rx = events.subscribe();

        let task = dispatcher
            .dispatch(
                "gd-3",
                "GetDiagnostics",
                json!({"location": "http://203.0.113.7:3000/upload", "retries": 3}),
            )
            .unwrap();
        task.await.unwrap();

        let entries = timeline.entries();
        assert_eq!(entries.len(), 4, "{:?}", entries);

        let file_name = match &entries[0] {
            Entry::Sent(Frame::CallResult(result)) => {
                assert_eq!(result.message_id, "gd-3");
                result.payload["fileName"].as_str().unwrap().to_string()
            }
            other => panic!("Expected CallResult first, got {:?}", other),
        };
        assert!(file_name.starts_with("diagnostics_CP001_"));
        assert!(file_name.ends_with(".zip"));

        assert_eq!(diagnostics_status(&entries[1]).as_deref(), Some("Uploading"));
        assert_eq!(
            entries[2],
            Entry::Upload {
                location: "http://203.0.113.7:3000/upload".into(),
                file_name,
                entries: vec![
                    "etc/wpa_supplicant/wpa_supplicant.conf".into(),
                    "etc/chargepoint/ocpp.conf".into(),
                    "var/log/chargepoint/system_info.log".into(),
                    "var/log/chargepoint/error.log".into(),
                    "diagnostics.txt".into(),
                ],
            }
        );
        assert_eq!(diagnostics_status(&entries[3]).as_deref(), Some("Uploaded"));

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CpEvent::Diagnostics { status, .. } = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![DiagnosticsStatus::Uploading, DiagnosticsStatus::Uploaded]
        );
    }

    #[tokio::test]
    async fn test_server_error_reports_failure_once() {
        let (dispatcher, timeline, _events) = setup(500);

        dispatcher
            .dispatch("gd-4", "GetDiagnostics", json!({"location": "http://sink/upload"}))
            .unwrap()
            .await
            .unwrap();

        let entries = timeline.entries();
        let uploads = entries
            .iter()
            .filter(|e| matches!(e, Entry::Upload { .. }))
            .count();
        assert_eq!(uploads, 1);

        let statuses: Vec<_> = entries.iter().filter_map(diagnostics_status).collect();
        assert_eq!(statuses, vec!["Uploading", "UploadFailed"]);
    }

    #[tokio::test]
    async fn test_location_is_used_verbatim() {
        let (dispatcher, timeline, _events) = setup(200);
        let location = " http://sink.example/upload?cp=CP001 ";

        dispatcher
            .dispatch("gd-5", "GetDiagnostics", json!({ "location": location }))
            .unwrap()
            .await
            .unwrap();

        let uploaded: Vec<_> = timeline
            .entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Upload { location, .. } => Some(location),
                _ => None,
            })
            .collect();
        assert_eq!(uploaded, vec![location.to_string()]);
    }

    #[test]
    fn test_file_name_format() {
        let config = CpConfig::new("CP-9", "ws://localhost/ocpp");
        let workflow = DiagnosticsWorkflow::new(&config, Correlator::new(Duration::from_secs(1)), EventBus::default());

        let name = workflow.file_name();
        let millis = name
            .strip_prefix("diagnostics_CP-9_")
            .and_then(|rest| rest.strip_suffix(".zip"))
            .unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
    }
}
