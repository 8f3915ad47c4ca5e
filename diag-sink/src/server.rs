//! HTTP receiver
//!
//! Routes:
//! - `POST /upload`, `PUT /upload/{*path}`: multipart upload, field `file`
//! - `GET /health`: liveness
//! - `GET /files`: stored uploads
//! - `GET /files/{name}`: download a stored upload

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::error::SinkError;
use crate::scanner::{self, Analysis};

/// Largest accepted upload body
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

const EVENT_CAPACITY: usize = 64;

/// Emitted for every stored upload
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SinkEvent {
    #[serde(rename_all = "camelCase")]
    UploadReceived {
        filename: String,
        original_name: String,
        size: usize,
        source_addr: SocketAddr,
        analysis: Analysis,
    },
}

/// Shared receiver state
#[derive(Clone)]
pub struct SinkState {
    inner: Arc<StateInner>,
}

struct StateInner {
    storage_dir: PathBuf,
    events: broadcast::Sender<SinkEvent>,
}

impl SinkState {
    /// Create state storing uploads under `storage_dir` (must exist)
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StateInner {
                storage_dir: storage_dir.into(),
                events,
            }),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.inner.storage_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.inner.events.subscribe()
    }
}

/// Next event for a subscriber, riding over lag; `None` once the sink is gone
pub async fn next_event(rx: &mut broadcast::Receiver<SinkEvent>) -> Option<SinkEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event subscriber fell behind, {} uploads not reported", skipped)
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredFile {
    filename: String,
    size: u64,
    received_at: Option<String>,
}

// ============================================================================
// Routing
// ============================================================================

pub fn router(state: SinkState) -> Router {
    Router::new()
        .route("/upload", post(receive_upload))
        .route("/upload/{*path}", put(receive_upload))
        .route("/health", get(health))
        .route("/files", get(list_files))
        .route("/files/{name}", get(download_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Serve `router(state)` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: SinkState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

// ============================================================================
// Handlers
// ============================================================================

async fn receive_upload(
    State(state): State<SinkState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Json<Value>, SinkError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let original_name = field.file_name().unwrap_or("upload.bin").to_string();
            let bytes = field.bytes().await?;
            upload = Some((original_name, bytes));
            break;
        }
    }
    let (original_name, bytes) = upload.ok_or(SinkError::NoFile)?;

    let filename = store(state.storage_dir(), Utc::now(), &original_name, &bytes).await?;
    info!(
        "Received {} ({} bytes) from {}, saved as {}",
        original_name,
        bytes.len(),
        addr,
        filename
    );

    let analysis = scanner::analyze(&bytes);
    let sensitive = !analysis.matches.is_empty();
    if sensitive {
        warn!(
            "{} sensitive lines found in {}",
            analysis.matches.len(),
            filename
        );
    }

    // No subscribers is fine
    let _ = state.inner.events.send(SinkEvent::UploadReceived {
        filename: filename.clone(),
        original_name,
        size: bytes.len(),
        source_addr: addr,
        analysis,
    });

    Ok(Json(json!({
        "success": true,
        "message": "File received and analyzed",
        "filename": filename,
        "sensitiveDataFound": sensitive,
    })))
}

async fn health(State(state): State<SinkState>) -> Json<Value> {
    Json(json!({
        "status": "online",
        "service": "diag-sink",
        "time": Utc::now().to_rfc3339(),
        "subscribers": state.inner.events.receiver_count(),
    }))
}

async fn list_files(State(state): State<SinkState>) -> Result<Json<Value>, SinkError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(state.storage_dir()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        files.push(StoredFile {
            filename: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            received_at: metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    Ok(Json(json!({
        "count": files.len(),
        "files": files,
    })))
}

async fn download_file(
    State(state): State<SinkState>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Result<impl IntoResponse, SinkError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(SinkError::InvalidName(name));
    }

    let path = state.storage_dir().join(&name);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SinkError::NotFound(name))
        }
        Err(e) => return Err(e.into()),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        bytes,
    ))
}

/// `<timestamp>_<name>` with `:` and `.` in the timestamp replaced by `-`.
/// Only the final component of the client-supplied name is kept.
fn stored_name(now: DateTime<Utc>, original_name: &str) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let base = original_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or("upload.bin");
    format!("{}_{}", stamp, base)
}

/// Write `bytes` under a fresh name; a taken name gets a `-<n>` suffix
/// before the first underscore.
async fn store(
    dir: &Path,
    now: DateTime<Utc>,
    original_name: &str,
    bytes: &[u8],
) -> std::io::Result<String> {
    let name = stored_name(now, original_name);
    let mut attempt = 0u32;
    loop {
        let candidate = match attempt {
            0 => name.clone(),
            n => name.replacen('_', &format!("-{}_", n), 1),
        };
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&candidate))
            .await;
        match opened {
            Ok(mut file) => {
                file.write_all(bytes).await?;
                file.flush().await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}
