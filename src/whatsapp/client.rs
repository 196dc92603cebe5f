//! HTTP client for the WhatsApp bridge sidecar.
//!
//! All WhatsApp operations go through this client, which talks to a
//! Node.js bridge over HTTP. Every endpoint answers with the
//! `{success, data, error}` envelope.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Connection, SendReceipt, WhatsAppError, WhatsAppStatus};

/// Default port the WhatsApp bridge listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 3001;

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Acknowledgment payload returned by the send endpoints.
#[derive(Deserialize)]
struct AckData {
    ack: Option<i64>,
}

/// [`Connection`] backed by the WhatsApp bridge HTTP API.
pub struct BridgeConnection {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeConnection {
    /// Create a new client pointing at the given base URL.
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let base_url = base_url.trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    /// Create a client connecting to `http://127.0.0.1:{port}`.
    pub fn with_port(port: u16, request_timeout: Duration) -> Self {
        Self::new(format!("http://127.0.0.1:{port}"), request_timeout)
    }

    /// Returns the base URL of the bridge.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the current connection status from the bridge.
    pub async fn status(&self) -> Result<WhatsAppStatus, WhatsAppError> {
        let url = format!("{}/status", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: BridgeResponse<WhatsAppStatus> = resp.json().await?;
        body.data.ok_or(WhatsAppError::BridgeNotRunning)
    }

    /// POST a JSON body and unwrap the response envelope.
    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<Option<T>, WhatsAppError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            warn!(%status, path, "bridge request failed: {body_text}");
            return Err(WhatsAppError::Bridge(format!("{status}: {body_text}")));
        }
        let envelope: BridgeResponse<T> = resp.json().await?;
        if !envelope.success {
            return Err(WhatsAppError::Bridge(
                envelope
                    .error
                    .unwrap_or_else(|| "unknown bridge error".to_owned()),
            ));
        }
        Ok(envelope.data)
    }

    /// POST to a send endpoint and extract the acknowledgment code.
    async fn post_send(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<SendReceipt, WhatsAppError> {
        let data: Option<AckData> = self.post(path, body).await?;
        let ack = data.and_then(|d| d.ack);
        debug!(path, ?ack, "bridge send answered");
        Ok(SendReceipt { ack })
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn connect(&mut self) -> Result<WhatsAppStatus, WhatsAppError> {
        info!(url = %self.base_url, "connecting WhatsApp bridge session");
        let status: Option<WhatsAppStatus> =
            self.post("/connect", &serde_json::json!({})).await?;
        match status {
            Some(status) => Ok(status),
            // Older bridges answer /connect without a body; ask explicitly.
            None => self.status().await,
        }
    }

    async fn send_text(
        &mut self,
        recipient: &str,
        text: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        let body = serde_json::json!({ "jid": recipient, "text": text });
        self.post_send("/send", &body).await
    }

    async fn send_file(
        &mut self,
        chat_id: &str,
        payload: &str,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        let body = serde_json::json!({
            "jid": chat_id,
            "data": payload,
            "file_name": file_name,
            "caption": caption,
        });
        self.post_send("/send-file", &body).await
    }

    async fn send_image(
        &mut self,
        chat_id: &str,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        let body = serde_json::json!({
            "jid": chat_id,
            "path": path.to_string_lossy(),
            "file_name": file_name,
            "caption": caption,
        });
        self.post_send("/send-image", &body).await
    }

    async fn close(&mut self) -> Result<(), WhatsAppError> {
        let _: Option<serde_json::Value> = self.post("/close", &serde_json::json!({})).await?;
        info!("WhatsApp bridge session closed");
        Ok(())
    }
}
