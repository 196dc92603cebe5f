//! Media preparation: content type, optional transcode, size policy, and
//! base64 encoding of files about to be sent.
//!
//! A [`MediaPayload`] exists only for the duration of one send attempt. A
//! transcoded copy lives in a uniquely named temp file that is removed before
//! [`MediaPreparer::prepare`] returns, whatever the outcome.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;

pub mod transcode;

use transcode::{converted_output, needs_transcode, FfmpegTranscoder, Transcoder};

/// Default size above which a warning is attached: 50 MiB.
pub const DEFAULT_SIZE_WARNING_BYTES: u64 = 50 * 1024 * 1024;

/// Content type of a successful transcode.
const TRANSCODED_CONTENT_TYPE: &str = "video/mp4";

/// Known extensions and their content types.
const CONTENT_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("3gp", "video/3gpp"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

/// Target kind of a media send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Video, uploaded as an encoded payload.
    Video,
    /// Image, sent by path.
    Image,
}

impl MediaKind {
    /// Content type used when the extension does not resolve to this kind.
    pub fn generic_content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Image => "image/jpeg",
        }
    }

    fn type_prefix(self) -> &'static str {
        match self {
            Self::Video => "video/",
            Self::Image => "image/",
        }
    }
}

/// How [`MediaPreparer::prepare`] should encode the working file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Base64 with a `data:{content_type};base64,` header.
    DataUrl,
    /// Bare base64.
    Base64,
    /// No payload; the file is only checked for readability. For media
    /// that is sent by path.
    Skip,
}

/// Errors from media preparation.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The source file does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Reading or encoding the file failed, including allocation failure.
    #[error("failed to encode {}: {reason}", path.display())]
    Encoding {
        /// File being encoded.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// A string is not a base64 data URL.
    #[error("invalid data URL: {0}")]
    InvalidDataUrl(String),
}

impl MediaError {
    fn encoding(path: &Path, reason: impl Into<String>) -> Self {
        Self::Encoding {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// A file ready to hand to the connection.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    /// File the caller asked for.
    pub source_path: PathBuf,
    /// Resolved content type.
    pub content_type: String,
    /// File that was actually encoded (a transcode output, already removed,
    /// or the source).
    pub working_path: PathBuf,
    /// Base64 payload, with a `data:` prefix when requested. Empty for
    /// [`PayloadEncoding::Skip`].
    pub encoded: String,
    /// Size of the working file.
    pub size_bytes: u64,
    /// Size is at or above the warning threshold.
    pub size_warning: bool,
    /// A transcode produced the working file.
    pub transcoded: bool,
}

impl MediaPayload {
    /// File name of the source, for display to the recipient.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Content type for a path's extension, if known.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    CONTENT_TYPES
        .iter()
        .find(|(known, _)| ext.eq_ignore_ascii_case(known))
        .map(|(_, content_type)| *content_type)
}

/// Prepares media files for sending.
#[derive(Clone)]
pub struct MediaPreparer {
    transcoder: Arc<dyn Transcoder>,
    size_warning_bytes: u64,
}

impl MediaPreparer {
    /// Create a preparer with an explicit transcoder and size threshold.
    pub fn new(transcoder: Arc<dyn Transcoder>, size_warning_bytes: u64) -> Self {
        Self {
            transcoder,
            size_warning_bytes,
        }
    }

    /// Preparer using ffmpeg and the configured threshold.
    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            Arc::new(FfmpegTranscoder::new(config.ffmpeg_path.clone())),
            config.size_warning_bytes(),
        )
    }

    /// Size threshold in bytes.
    pub fn size_warning_bytes(&self) -> u64 {
        self.size_warning_bytes
    }

    /// Resolve, optionally transcode, and encode the file at `path`.
    ///
    /// Preparation runs on the calling thread, so concurrent calls for the
    /// same source each get their own transcode output.
    ///
    /// Unknown content types, transcode failures and oversized files are
    /// logged and tolerated.
    ///
    /// # Errors
    ///
    /// [`MediaError::FileNotFound`] when `path` does not exist,
    /// [`MediaError::Encoding`] when the working file cannot be read or
    /// encoded in memory.
    pub fn prepare(
        &self,
        path: &Path,
        kind: MediaKind,
        encoding: PayloadEncoding,
        allow_transcode: bool,
    ) -> Result<MediaPayload, MediaError> {
        if !path.exists() {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }

        let mut content_type = match content_type_for(path) {
            Some(resolved) if resolved.starts_with(kind.type_prefix()) => resolved,
            other => {
                let fallback = kind.generic_content_type();
                warn!(
                    path = %path.display(),
                    detected = ?other,
                    fallback,
                    "could not resolve a matching content type"
                );
                fallback
            }
        };

        let mut working_path = path.to_path_buf();
        let mut transcoded = false;
        // Held until return so a transcode output is removed on every path.
        let mut temp_output = None;

        if allow_transcode && needs_transcode(path) {
            match converted_output(path) {
                Ok(output) => {
                    match self.transcoder.transcode(path, &output) {
                        Ok(()) => {
                            info!(from = %path.display(), to = %output.display(), "converted video");
                            working_path = output.to_path_buf();
                            content_type = TRANSCODED_CONTENT_TYPE;
                            transcoded = true;
                        }
                        Err(e) => warn!(
                            path = %path.display(),
                            error = %e,
                            "continuing with original file after transcode failure"
                        ),
                    }
                    temp_output = Some(output);
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "no temp file for transcode output, sending original"
                ),
            }
        }

        let size_bytes = std::fs::metadata(&working_path)
            .map_err(|e| MediaError::encoding(&working_path, e.to_string()))?
            .len();
        let size_warning = size_bytes >= self.size_warning_bytes;
        if size_warning {
            warn!(
                path = %working_path.display(),
                size_bytes,
                limit_bytes = self.size_warning_bytes,
                "file exceeds the recommended size limit, consider compressing"
            );
        }

        let encoded = match encoding {
            PayloadEncoding::Skip => {
                File::open(&working_path)
                    .map_err(|e| MediaError::encoding(&working_path, e.to_string()))?;
                String::new()
            }
            PayloadEncoding::DataUrl | PayloadEncoding::Base64 => {
                let bytes = read_fully(&working_path)?;
                let prefix = (encoding == PayloadEncoding::DataUrl).then_some(content_type);
                let encoded = encode_payload(&bytes, prefix)
                    .map_err(|reason| MediaError::encoding(&working_path, reason))?;
                debug!(
                    path = %working_path.display(),
                    content_type,
                    encoded_len = encoded.len(),
                    "media encoded"
                );
                encoded
            }
        };

        if let Some(output) = temp_output {
            let output_path = output.to_path_buf();
            match output.close() {
                Ok(()) => debug!(path = %output_path.display(), "removed transcode output"),
                Err(e) => warn!(
                    path = %output_path.display(),
                    error = %e,
                    "failed to remove transcode output"
                ),
            }
        }

        Ok(MediaPayload {
            source_path: path.to_path_buf(),
            content_type: content_type.to_owned(),
            working_path,
            encoded,
            size_bytes,
            size_warning,
            transcoded,
        })
    }
}

/// Read a whole file, reporting allocation failure as an encoding error.
fn read_fully(path: &Path) -> Result<Vec<u8>, MediaError> {
    let mut file = File::open(path).map_err(|e| MediaError::encoding(path, e.to_string()))?;
    let len = file
        .metadata()
        .map_err(|e| MediaError::encoding(path, e.to_string()))?
        .len();
    let len = usize::try_from(len)
        .map_err(|_| MediaError::encoding(path, format!("{len} bytes do not fit in memory")))?;

    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|e| MediaError::encoding(path, format!("cannot allocate {len} bytes: {e}")))?;
    file.read_to_end(&mut bytes)
        .map_err(|e| MediaError::encoding(path, e.to_string()))?;
    Ok(bytes)
}

/// Base64-encode `bytes`, prefixed with a data URL header when a content
/// type is given.
fn encode_payload(bytes: &[u8], data_url_type: Option<&str>) -> Result<String, String> {
    let header = data_url_type
        .map(|content_type| format!("data:{content_type};base64,"))
        .unwrap_or_default();
    let body_len = base64::encoded_len(bytes.len(), true)
        .ok_or_else(|| format!("{} bytes are too large to encode", bytes.len()))?;
    let total = header
        .len()
        .checked_add(body_len)
        .ok_or_else(|| "encoded payload length overflows".to_owned())?;

    let mut out = String::new();
    out.try_reserve_exact(total)
        .map_err(|e| format!("cannot allocate {total} bytes for encoding: {e}"))?;
    out.push_str(&header);
    base64::engine::general_purpose::STANDARD.encode_string(bytes, &mut out);
    Ok(out)
}

/// Build a base64 data URL for `bytes`.
///
/// # Errors
///
/// Returns [`MediaError::InvalidDataUrl`] if the encoded form cannot be
/// allocated.
pub fn to_data_url(content_type: &str, bytes: &[u8]) -> Result<String, MediaError> {
    encode_payload(bytes, Some(content_type)).map_err(MediaError::InvalidDataUrl)
}

/// Split a base64 data URL into its content type and decoded bytes.
///
/// # Errors
///
/// Returns [`MediaError::InvalidDataUrl`] when the header is malformed or
/// the body is not valid base64.
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), MediaError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| MediaError::InvalidDataUrl("missing data: scheme".to_owned()))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| MediaError::InvalidDataUrl("missing ',' separator".to_owned()))?;
    let content_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| MediaError::InvalidDataUrl("payload is not base64".to_owned()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| MediaError::InvalidDataUrl(e.to_string()))?;
    Ok((content_type.to_owned(), bytes))
}
