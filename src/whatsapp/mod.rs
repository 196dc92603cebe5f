//! WhatsApp connection capability set and the HTTP bridge client.
//!
//! The [`Connection`] trait is everything the dispatch worker needs from the
//! messaging network. [`client::BridgeConnection`] implements it against a
//! WhatsApp bridge sidecar over HTTP; tests substitute their own stubs.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod client;

/// Errors from the WhatsApp connection.
#[derive(Debug, thiserror::Error)]
pub enum WhatsAppError {
    /// HTTP request to the bridge failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge is not running or not reachable.
    #[error("bridge not running")]
    BridgeNotRunning,

    /// The bridge answered with an error envelope.
    #[error("bridge error: {0}")]
    Bridge(String),
}

/// Delivery progress reported by the network for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// Accepted by the server, not yet on the device (code 1).
    Queued,
    /// Delivered to the recipient's device (code 2).
    Delivered,
    /// Read by the recipient (code 3).
    Read,
}

impl Ack {
    /// Map a raw acknowledgment code to a positive ack.
    ///
    /// Returns `None` for every code that does not mean delivery progress
    /// (errors, pending, or unknown values).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Queued),
            2 => Some(Self::Delivered),
            3 => Some(Self::Read),
            _ => None,
        }
    }

    /// Raw code for this ack.
    pub fn code(self) -> i64 {
        match self {
            Self::Queued => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }
}

/// Connection status reported by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatsAppStatus {
    /// Whether the bridge is connected to WhatsApp.
    pub connected: bool,
    /// The phone number linked, if connected.
    pub phone_number: Option<String>,
}

/// Result of a send call, carrying the raw acknowledgment code if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Raw acknowledgment code; `None` when the network reported nothing.
    pub ack: Option<i64>,
}

impl SendReceipt {
    /// Receipt carrying the given ack.
    pub fn acked(ack: Ack) -> Self {
        Self {
            ack: Some(ack.code()),
        }
    }

    /// Positive ack, if the code is one.
    pub fn positive(&self) -> Option<Ack> {
        self.ack.and_then(Ack::from_code)
    }
}

/// The capability set of the external messaging connection.
///
/// Implementations are not required to be `Sync`: the dispatch worker is the
/// only owner and calls one method at a time.
#[async_trait]
pub trait Connection: Send {
    /// Establish the session and report the resulting status.
    async fn connect(&mut self) -> Result<WhatsAppStatus, WhatsAppError>;

    /// Send a text message to a bare phone number.
    async fn send_text(&mut self, recipient: &str, text: &str)
        -> Result<SendReceipt, WhatsAppError>;

    /// Send an encoded file (data URL) to a chat.
    async fn send_file(
        &mut self,
        chat_id: &str,
        payload: &str,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError>;

    /// Send an image by path to a chat.
    async fn send_image(
        &mut self,
        chat_id: &str,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError>;

    /// Shut the session down.
    async fn close(&mut self) -> Result<(), WhatsAppError>;
}

/// Builds a fresh [`Connection`] each time the dispatch worker starts.
pub trait ConnectionFactory: Send + Sync {
    /// Create a new, not yet connected, connection.
    fn create(&self) -> Box<dyn Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Box<dyn Connection> + Send + Sync,
{
    fn create(&self) -> Box<dyn Connection> {
        self()
    }
}

/// Chat identifier for a normalized phone number.
pub fn chat_id(recipient: &str) -> String {
    format!("{recipient}@c.us")
}
