//! # Diagnostics Sink
//!
//! A small HTTP receiver for diagnostics archives. Whatever arrives on
//! `/upload` is stored on disk and scanned for credential-looking lines.
//!
//! ```text
//! charge point ──multipart POST/PUT──► /upload ──► storage dir
//!                                          │
//!                                          ▼
//!                                      scanner ──► SinkEvent::UploadReceived
//! ```
//!
//! Used to demonstrate what a charge point hands over when it uploads
//! diagnostics to an unvalidated location.

pub mod error;
pub mod scanner;
pub mod server;

pub use error::SinkError;
pub use scanner::{analyze, Analysis, SensitiveMatch, SENSITIVE_KEYWORDS};
pub use server::{next_event, router, serve, SinkEvent, SinkState};
