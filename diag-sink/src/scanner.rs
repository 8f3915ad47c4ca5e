//! Keyword scanner for uploaded files
//!
//! Pure functions from bytes to findings. ZIP archives are opened and every
//! entry is scanned on its own; anything else is read as (lossy) UTF-8 text.

use std::io::{Cursor, Read};

use serde::Serialize;
use tracing::warn;

/// Keywords that mark a line as sensitive (matched case-insensitively)
pub const SENSITIVE_KEYWORDS: [&str; 14] = [
    "password",
    "passwd",
    "pwd",
    "ssid",
    "wpa_psk",
    "psk",
    "wpa_passphrase",
    "secret",
    "api_key",
    "apikey",
    "token",
    "credential",
    "private_key",
    "auth",
];

const CONTEXT_LIMIT: usize = 200;
const PREVIEW_LIMIT: usize = 500;

/// One keyword hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensitiveMatch {
    pub keyword: String,
    /// 1-based line number within the file (or archive entry)
    pub line: usize,
    /// Trimmed line, prefixed with `[entry]` for archive members
    pub context: String,
}

/// Everything the scanner found in one upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub is_zip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_files: Option<Vec<String>>,
    pub matches: Vec<SensitiveMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// ZIP local file header magic
pub fn is_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK")
}

/// Scan text line by line; one match per keyword per line
pub fn scan_text(content: &str) -> Vec<SensitiveMatch> {
    let mut matches = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let lower = line.to_lowercase();
        for keyword in SENSITIVE_KEYWORDS {
            if lower.contains(keyword) {
                matches.push(SensitiveMatch {
                    keyword: keyword.to_string(),
                    line: index + 1,
                    context: truncate(line.trim(), CONTEXT_LIMIT),
                });
            }
        }
    }

    matches
}

/// Analyze an upload, archive or plain text
pub fn analyze(bytes: &[u8]) -> Analysis {
    if is_zip(bytes) {
        match analyze_zip(bytes) {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Failed to open ZIP upload: {}", e);
                Analysis {
                    is_zip: true,
                    ..Default::default()
                }
            }
        }
    } else {
        let content = String::from_utf8_lossy(bytes);
        Analysis {
            is_zip: false,
            extracted_files: None,
            matches: scan_text(&content),
            preview: Some(truncate(&content, PREVIEW_LIMIT)),
        }
    }
}

fn analyze_zip(bytes: &[u8]) -> Result<Analysis, zip::result::ZipError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut extracted = Vec::new();
    let mut matches = Vec::new();
    let mut combined = String::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        extracted.push(name.clone());

        let mut content = String::new();
        if let Err(e) = entry.read_to_string(&mut content) {
            warn!("Could not read entry {} as text: {}", name, e);
            continue;
        }

        combined.push_str(&format!("\n--- {} ---\n{}", name, content));
        matches.extend(scan_text(&content).into_iter().map(|m| SensitiveMatch {
            context: format!("[{}] {}", name, m.context),
            ..m
        }));
    }

    Ok(Analysis {
        is_zip: true,
        extracted_files: Some(extracted),
        matches,
        preview: Some(truncate(&combined, PREVIEW_LIMIT)),
    })
}

/// First `limit` characters (not bytes)
fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
