//! Diagnostics upload
//!
//! A single multipart POST of the archive to the location the CSMS asked
//! for. Whatever URL arrives is used as is.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::debug;

/// Upload failures; all of them end in `UploadFailed`
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected with HTTP status {0}")]
    Status(u16),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sends a finished archive somewhere
pub trait Uploader: Send + Sync {
    /// Upload `archive` as `file_name`; Ok carries the (2xx) status code
    fn upload<'a>(
        &'a self,
        location: &'a str,
        file_name: &'a str,
        archive: Vec<u8>,
    ) -> BoxFuture<'a, Result<u16, UploadError>>;
}

/// Multipart HTTP uploader
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUploader {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn post(&self, location: &str, file_name: &str, archive: Vec<u8>) -> Result<u16, UploadError> {
        let size = archive.len();
        let part = Part::bytes(archive)
            .file_name(file_name.to_string())
            .mime_str("application/zip")?;
        let form = Form::new().part("file", part);

        debug!("POST {} ({} bytes as {})", location, size, file_name);

        let response = self
            .client
            .post(location)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(UploadError::Status(status.as_u16()))
        }
    }
}

impl Uploader for HttpUploader {
    fn upload<'a>(
        &'a self,
        location: &'a str,
        file_name: &'a str,
        archive: Vec<u8>,
    ) -> BoxFuture<'a, Result<u16, UploadError>> {
        self.post(location, file_name, archive).boxed()
    }
}
