//! Delivery pipeline: one send attempt from validated input to a final
//! [`DeliveryOutcome`].
//!
//! Text sends either succeed or fail. Media sends either succeed or fail
//! with exactly one row appended to the fallback log, whatever the cause:
//! missing file, encoding failure, connection not ready, dispatch timeout,
//! or a missing/negative acknowledgment.
//!
//! Every method here blocks the calling thread while the dispatch worker runs
//! the operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::{DispatchBridge, DispatchError, DispatchSettings, MediaSend, Operation, Reply};
use crate::fallback::FallbackRecorder;
use crate::lifecycle::{Connected, ConnectionState, LifecycleError};
use crate::media::{MediaError, MediaKind, MediaPreparer, PayloadEncoding};
use crate::whatsapp::{chat_id, Ack, ConnectionFactory, SendReceipt};

/// Why a delivery attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Required input was missing or empty.
    #[error("{0}")]
    InvalidInput(String),

    /// The connection is not live.
    #[error("WhatsApp client not initialized. Please call initialize() first.")]
    ConnectionNotReady,

    /// Connecting failed or timed out.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The media file does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The media file could not be read, transcoded or encoded.
    #[error("Failed to encode file: {0}")]
    Encoding(String),

    /// The dispatch deadline passed; the send may still happen.
    #[error("Timeout after {0:?} waiting for the send; outcome unknown")]
    Timeout(Duration),

    /// The connection answered without a positive acknowledgment.
    #[error("Failed to send: no positive acknowledgment (ack: {ack:?})")]
    Rejected {
        /// Raw code returned, if any.
        ack: Option<i64>,
    },

    /// The connection failed the call, or the worker could not run it.
    #[error("Error: {0}")]
    Dispatch(String),
}

impl From<MediaError> for DeliveryError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::FileNotFound(path) => Self::FileNotFound(path),
            other => Self::Encoding(other.to_string()),
        }
    }
}

impl From<DispatchError> for DeliveryError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Timeout(after) => Self::Timeout(after),
            DispatchError::Lifecycle(LifecycleError::NotReady(_)) => Self::ConnectionNotReady,
            DispatchError::Lifecycle(LifecycleError::Connection(reason)) => {
                Self::Connection(reason)
            }
            other => Self::Dispatch(other.to_string()),
        }
    }
}

/// Result of one API call, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable description, including the fallback result on failure.
    pub message: String,
    /// Acknowledgment code reported by the connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
    /// The media file was at or above the size warning threshold.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub size_warning: bool,
}

impl DeliveryOutcome {
    fn succeeded(message: impl Into<String>, ack: Option<Ack>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ack: ack.map(Ack::code),
            size_warning: false,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ack: None,
            size_warning: false,
        }
    }

    fn with_size_warning(mut self, size_warning: bool) -> Self {
        self.size_warning = size_warning;
        self
    }
}

/// Liveness report for the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    /// Always `healthy` while the process answers.
    pub status: &'static str,
    /// Whether the connection is live.
    pub connection_live: bool,
    /// Published connection state; absent when no worker runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
}

/// Strip surrounding whitespace and one leading `+` from a phone number.
///
/// # Errors
///
/// [`DeliveryError::InvalidInput`] when nothing remains.
pub fn normalize_recipient(raw: &str) -> Result<String, DeliveryError> {
    let trimmed = raw.trim();
    let number = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if number.is_empty() {
        return Err(DeliveryError::InvalidInput(
            "Phone number is required".to_owned(),
        ));
    }
    Ok(number.to_owned())
}

/// Composes the bridge, media preparation and fallback log.
pub struct DeliveryPipeline {
    bridge: Arc<DispatchBridge>,
    media: MediaPreparer,
    fallback: FallbackRecorder,
    transcode: bool,
}

impl DeliveryPipeline {
    /// Assemble a pipeline from its parts.
    pub fn new(
        bridge: Arc<DispatchBridge>,
        media: MediaPreparer,
        fallback: FallbackRecorder,
        transcode: bool,
    ) -> Self {
        Self {
            bridge,
            media,
            fallback,
            transcode,
        }
    }

    /// Assemble a pipeline from configuration and a connection factory.
    pub fn from_config(config: &Config, factory: Arc<dyn ConnectionFactory>) -> Self {
        let bridge = DispatchBridge::new(factory, DispatchSettings::from(&config.dispatch));
        Self::new(
            Arc::new(bridge),
            MediaPreparer::from_config(&config.media),
            FallbackRecorder::new(config.fallback.path.clone()),
            config.media.transcode,
        )
    }

    /// The dispatch bridge.
    pub fn bridge(&self) -> &Arc<DispatchBridge> {
        &self.bridge
    }

    /// The fallback recorder.
    pub fn fallback(&self) -> &FallbackRecorder {
        &self.fallback
    }

    /// Whether the connection is live.
    pub fn is_live(&self) -> bool {
        self.bridge.is_live()
    }

    /// Liveness report.
    pub fn health(&self) -> Health {
        let state = self.bridge.state();
        Health {
            status: "healthy",
            connection_live: state == Some(ConnectionState::Connected),
            state,
        }
    }

    /// Connect, unless already connected.
    pub fn initialize(&self) -> DeliveryOutcome {
        if self.bridge.is_live() {
            return DeliveryOutcome::succeeded("Already initialized", None);
        }
        match self.bridge.submit(Operation::Connect) {
            Ok(Reply::Connected(Connected::Already)) => {
                DeliveryOutcome::succeeded("Already initialized", None)
            }
            Ok(Reply::Connected(Connected::Established(status))) => {
                info!(phone = ?status.phone_number, "WhatsApp client initialized");
                DeliveryOutcome::succeeded("Initialization successful", None)
            }
            Ok(other) => DeliveryOutcome::failed(format!(
                "Initialization error: unexpected reply {other:?}"
            )),
            Err(e) => {
                let err = DeliveryError::from(e);
                warn!(error = %err, "WhatsApp initialization failed");
                DeliveryOutcome::failed(format!("Initialization error: {err}"))
            }
        }
    }

    /// Send a text message. Failures are not recorded in the fallback log.
    pub fn send_text(&self, recipient: &str, message: &str) -> DeliveryOutcome {
        match self.try_send_text(recipient, message) {
            Ok((recipient, ack)) => {
                info!(recipient, ?ack, "message sent");
                DeliveryOutcome::succeeded("Message sent successfully", Some(ack))
            }
            Err(e) => {
                warn!(error = %e, "message send failed");
                DeliveryOutcome::failed(e.to_string())
            }
        }
    }

    /// Send a video file as an encoded upload.
    pub fn send_video(&self, recipient: &str, path: &Path, caption: &str) -> DeliveryOutcome {
        self.send_media(MediaKind::Video, recipient, path, caption)
    }

    /// Send an image file by path.
    pub fn send_image(&self, recipient: &str, path: &Path, caption: &str) -> DeliveryOutcome {
        self.send_media(MediaKind::Image, recipient, path, caption)
    }

    /// Close the connection and stop the dispatch worker.
    pub fn shutdown(&self) {
        self.bridge.shutdown();
    }

    fn try_send_text(&self, recipient: &str, message: &str) -> Result<(String, Ack), DeliveryError> {
        if recipient.trim().is_empty() || message.is_empty() {
            return Err(DeliveryError::InvalidInput(
                "Phone number and message are required".to_owned(),
            ));
        }
        let recipient = normalize_recipient(recipient)?;
        if !self.bridge.is_live() {
            return Err(DeliveryError::ConnectionNotReady);
        }
        let receipt = self.submit_send(Operation::SendText {
            recipient: recipient.clone(),
            text: message.to_owned(),
        })?;
        let ack = evaluate_ack(receipt)?;
        Ok((recipient, ack))
    }

    fn send_media(
        &self,
        kind: MediaKind,
        recipient: &str,
        path: &Path,
        caption: &str,
    ) -> DeliveryOutcome {
        if recipient.trim().is_empty() || path.as_os_str().is_empty() {
            return DeliveryOutcome::failed("Phone number and file path are required");
        }
        let normalized = match normalize_recipient(recipient) {
            Ok(number) => number,
            Err(e) => return DeliveryOutcome::failed(e.to_string()),
        };

        let mut size_warning = false;
        let result = self.try_send_media(kind, &normalized, path, caption, &mut size_warning);
        match result {
            Ok(ack) => {
                info!(recipient = %normalized, file = %path.display(), ?ack, "file sent");
                DeliveryOutcome::succeeded("File sent successfully", Some(ack))
                    .with_size_warning(size_warning)
            }
            Err(e) => {
                warn!(
                    recipient = %normalized,
                    file = %path.display(),
                    error = %e,
                    "file send failed, falling back to the log"
                );
                let fallback = match self.fallback.record(recipient.trim(), path) {
                    Ok(message) => message,
                    Err(fallback_err) => fallback_err.to_string(),
                };
                DeliveryOutcome::failed(format!("{e}. Fallback: {fallback}"))
                    .with_size_warning(size_warning)
            }
        }
    }

    fn try_send_media(
        &self,
        kind: MediaKind,
        recipient: &str,
        path: &Path,
        caption: &str,
        size_warning: &mut bool,
    ) -> Result<Ack, DeliveryError> {
        if !path.exists() {
            return Err(DeliveryError::FileNotFound(path.to_path_buf()));
        }
        if !self.bridge.is_live() {
            return Err(DeliveryError::ConnectionNotReady);
        }

        let payload = match kind {
            MediaKind::Video => {
                self.media
                    .prepare(path, kind, PayloadEncoding::DataUrl, self.transcode)?
            }
            // Images go by path; the bridge reads the file itself.
            MediaKind::Image => self.media.prepare(path, kind, PayloadEncoding::Skip, false)?,
        };
        *size_warning = payload.size_warning;

        let file_name = payload.file_name();
        let send = match kind {
            MediaKind::Video => MediaSend::File {
                chat_id: chat_id(recipient),
                payload: payload.encoded,
                file_name,
                caption: caption.to_owned(),
            },
            MediaKind::Image => MediaSend::Image {
                chat_id: chat_id(recipient),
                path: payload.working_path,
                file_name,
                caption: caption.to_owned(),
            },
        };
        let receipt = self.submit_send(Operation::SendMedia(send))?;
        evaluate_ack(receipt)
    }

    fn submit_send(&self, operation: Operation) -> Result<SendReceipt, DeliveryError> {
        match self.bridge.submit(operation)? {
            Reply::Sent(receipt) => Ok(receipt),
            other => Err(DeliveryError::Dispatch(format!("unexpected reply {other:?}"))),
        }
    }
}

/// Queued, delivered and read all count as delivered.
fn evaluate_ack(receipt: SendReceipt) -> Result<Ack, DeliveryError> {
    receipt
        .positive()
        .ok_or(DeliveryError::Rejected { ack: receipt.ack })
}
