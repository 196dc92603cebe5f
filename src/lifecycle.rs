//! Lifecycle of the single external connection.
//!
//! [`ConnectionManager`] owns the [`Connection`] and its [`ConnectionState`].
//! It lives inside the dispatch worker, which is the only code that ever
//! calls it; everyone else observes the state through the
//! [`watch::Receiver`] returned by [`ConnectionManager::new`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::whatsapp::{Connection, SendReceipt, WhatsAppError, WhatsAppStatus};

/// State of the external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing attempted yet.
    Uninitialized,
    /// A connect call is running.
    Initializing,
    /// Session established; sends are allowed.
    Connected,
    /// The last connect attempt failed. May be retried.
    Failed,
    /// Graceful shutdown in progress.
    Closing,
    /// Shut down. Terminal for this manager.
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Closing, Connected, Failed, Initializing, Uninitialized};
        matches!(
            (self, next),
            (Uninitialized | Failed, Initializing)
                | (Initializing, Connected | Failed)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors raised by the lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Connect failed, timed out, or the remote session is not connected.
    #[error("connection failed: {0}")]
    Connection(String),

    /// An operation needed a live connection.
    #[error("connection not ready (state: {0})")]
    NotReady(ConnectionState),

    /// Internal bug: a transition outside the legal edges was requested.
    #[error("illegal connection state transition {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: ConnectionState,
        /// Requested state.
        to: ConnectionState,
    },

    /// The connection rejected or failed a send.
    #[error("send failed: {0}")]
    Send(#[source] WhatsAppError),
}

/// Result of a successful [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connected {
    /// The session was already up; the capability was not invoked.
    Already,
    /// A new session was established.
    Established(WhatsAppStatus),
}

/// Owner of the external connection and its state.
pub struct ConnectionManager {
    connection: Box<dyn Connection>,
    state: ConnectionState,
    published: watch::Sender<ConnectionState>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Wrap a fresh connection. The receiver observes every state change.
    pub fn new(
        connection: Box<dyn Connection>,
        connect_timeout: Duration,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (published, observer) = watch::channel(ConnectionState::Uninitialized);
        let manager = Self {
            connection,
            state: ConnectionState::Uninitialized,
            published,
            connect_timeout,
        };
        (manager, observer)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True iff the state is [`ConnectionState::Connected`].
    pub fn is_live(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn transition(&mut self, next: ConnectionState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = %self.state, to = %next, "connection state transition");
        self.state = next;
        self.published.send_replace(next);
        Ok(())
    }

    fn fail(&mut self, reason: String) -> Result<Connected, LifecycleError> {
        self.transition(ConnectionState::Failed)?;
        warn!(%reason, "WhatsApp connect failed");
        Err(LifecycleError::Connection(reason))
    }

    /// Establish the session, bounded by the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Connection`] when the capability fails,
    /// times out, or reports a session that is not connected. The state is
    /// then [`ConnectionState::Failed`] and a later call may retry.
    pub async fn connect(&mut self) -> Result<Connected, LifecycleError> {
        if self.is_live() {
            return Ok(Connected::Already);
        }
        self.transition(ConnectionState::Initializing)?;
        info!("initializing WhatsApp connection");

        match tokio::time::timeout(self.connect_timeout, self.connection.connect()).await {
            Ok(Ok(status)) if status.connected => {
                self.transition(ConnectionState::Connected)?;
                info!(phone = ?status.phone_number, "WhatsApp connection established");
                Ok(Connected::Established(status))
            }
            Ok(Ok(_)) => self.fail("session not connected, scan the QR code".to_owned()),
            Ok(Err(e)) => self.fail(e.to_string()),
            Err(_) => self.fail(format!(
                "timed out after {}s, scan the QR code",
                self.connect_timeout.as_secs()
            )),
        }
    }

    /// Shut the session down. A no-op unless connected.
    ///
    /// Returns `true` when a shutdown happened. Errors from the capability are
    /// logged; the state still ends at [`ConnectionState::Closed`].
    ///
    /// # Errors
    ///
    /// Only [`LifecycleError::IllegalTransition`], which indicates a bug.
    pub async fn close(&mut self) -> Result<bool, LifecycleError> {
        if !self.is_live() {
            debug!(state = %self.state, "close requested while not connected, ignoring");
            return Ok(false);
        }
        self.transition(ConnectionState::Closing)?;
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "error closing WhatsApp connection");
        }
        self.transition(ConnectionState::Closed)?;
        info!("WhatsApp connection closed");
        Ok(true)
    }

    fn ensure_live(&self) -> Result<(), LifecycleError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(LifecycleError::NotReady(self.state))
        }
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotReady`] when not connected, [`LifecycleError::Send`]
    /// when the capability fails.
    pub async fn send_text(
        &mut self,
        recipient: &str,
        text: &str,
    ) -> Result<SendReceipt, LifecycleError> {
        self.ensure_live()?;
        self.connection
            .send_text(recipient, text)
            .await
            .map_err(LifecycleError::Send)
    }

    /// Send an encoded file.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionManager::send_text`].
    pub async fn send_file(
        &mut self,
        chat_id: &str,
        payload: &str,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, LifecycleError> {
        self.ensure_live()?;
        self.connection
            .send_file(chat_id, payload, file_name, caption)
            .await
            .map_err(LifecycleError::Send)
    }

    /// Send an image by path.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionManager::send_text`].
    pub async fn send_image(
        &mut self,
        chat_id: &str,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, LifecycleError> {
        self.ensure_live()?;
        self.connection
            .send_image(chat_id, path, file_name, caption)
            .await
            .map_err(LifecycleError::Send)
    }
}
