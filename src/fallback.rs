//! Append-only CSV log of failed media deliveries.
//!
//! Each failed attempt adds one `Phone Number,File Path` row. Rows are never
//! rewritten or deduplicated; the file is the retry queue for whoever
//! resends the media later. Appends are serialized by a mutex and flushed
//! per row.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

/// Header row written when the log is created.
pub const HEADER: [&str; 2] = ["Phone Number", "File Path"];

/// Failure to append to the fallback log.
#[derive(Debug, thiserror::Error)]
#[error("Failed to append to {}: {reason}", path.display())]
pub struct FallbackError {
    /// Log file.
    pub path: PathBuf,
    /// What went wrong.
    pub reason: String,
}

/// Durable recorder of failed deliveries.
pub struct FallbackRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FallbackRecorder {
    /// Recorder appending to `path`. Nothing is written until the first record.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Log file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row for `recipient` and `file_path`.
    ///
    /// Returns the confirmation message shown to callers.
    ///
    /// # Errors
    ///
    /// Returns [`FallbackError`] when the file cannot be opened or written.
    pub fn record(&self, recipient: &str, file_path: &Path) -> Result<String, FallbackError> {
        let result = self.append(recipient, file_path);
        match &result {
            Ok(_) => info!(
                recipient,
                file = %file_path.display(),
                log = %self.path.display(),
                "failed delivery recorded"
            ),
            Err(e) => warn!(
                recipient,
                file = %file_path.display(),
                error = %e,
                "could not record failed delivery"
            ),
        }
        result
    }

    fn append(&self, recipient: &str, file_path: &Path) -> Result<String, FallbackError> {
        let _held = self.lock.lock().map_err(|e| self.error(format!("lock poisoned: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.error(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.error(e.to_string()))?;
        let is_new = file
            .metadata()
            .map_err(|e| self.error(e.to_string()))?
            .len()
            == 0;

        let mut rows = String::new();
        if is_new {
            rows.push_str(&csv_row(&HEADER));
        }
        let path_text = file_path.to_string_lossy();
        rows.push_str(&csv_row(&[recipient, &path_text]));

        file.write_all(rows.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| self.error(e.to_string()))?;

        Ok(format!(
            "Data successfully appended to {}",
            self.path.display()
        ))
    }

    fn error(&self, reason: String) -> FallbackError {
        FallbackError {
            path: self.path.clone(),
            reason,
        }
    }
}

/// One CSV line (RFC 4180 quoting, `\r\n` terminated).
fn csv_row(fields: &[&str]) -> String {
    let mut line = fields
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}
