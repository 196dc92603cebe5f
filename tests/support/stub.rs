//! Scripted in-memory connection shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier::whatsapp::{
    Connection, ConnectionFactory, SendReceipt, WhatsAppError, WhatsAppStatus,
};

/// One call observed by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentCall {
    Text {
        recipient: String,
        text: String,
    },
    File {
        chat_id: String,
        payload: String,
        file_name: String,
        caption: String,
    },
    Image {
        chat_id: String,
        path: PathBuf,
        file_name: String,
        caption: String,
    },
}

/// Behaviour and observations shared by every connection a factory builds.
pub struct Script {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub connect_ok: AtomicBool,
    pub panic_on_send: AtomicBool,
    pub ack: Mutex<Option<i64>>,
    pub send_delay: Mutex<Duration>,
    pub connect_delay: Mutex<Duration>,
    pub sent: Mutex<Vec<SentCall>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connect_ok: AtomicBool::new(true),
            panic_on_send: AtomicBool::new(false),
            ack: Mutex::new(Some(1)),
            send_delay: Mutex::new(Duration::ZERO),
            connect_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_ack(&self, ack: Option<i64>) {
        *self.ack.lock().expect("ack lock") = ack;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().expect("delay lock") = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().expect("delay lock") = delay;
    }

    pub fn sent(&self) -> Vec<SentCall> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Factory handing out connections that follow this script.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectionFactory> {
        let script = Arc::clone(self);
        Arc::new(move || -> Box<dyn Connection> {
            Box::new(StubConnection {
                script: Arc::clone(&script),
            })
        })
    }

    async fn run_send(&self, call: SentCall) -> Result<SendReceipt, WhatsAppError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sent.lock().expect("sent lock").push(call);

        if self.panic_on_send.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            panic!("scripted panic during send");
        }

        let delay = *self.send_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let ack = *self.ack.lock().expect("ack lock");
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(SendReceipt { ack })
    }
}

struct StubConnection {
    script: Arc<Script>,
}

#[async_trait]
impl Connection for StubConnection {
    async fn connect(&mut self) -> Result<WhatsAppStatus, WhatsAppError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.script.connect_delay.lock().expect("delay lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.script.connect_ok.load(Ordering::SeqCst) {
            Ok(WhatsAppStatus {
                connected: true,
                phone_number: Some("15550000000".to_owned()),
            })
        } else {
            Err(WhatsAppError::Bridge("scripted connect failure".to_owned()))
        }
    }

    async fn send_text(
        &mut self,
        recipient: &str,
        text: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        self.script
            .run_send(SentCall::Text {
                recipient: recipient.to_owned(),
                text: text.to_owned(),
            })
            .await
    }

    async fn send_file(
        &mut self,
        chat_id: &str,
        payload: &str,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        self.script
            .run_send(SentCall::File {
                chat_id: chat_id.to_owned(),
                payload: payload.to_owned(),
                file_name: file_name.to_owned(),
                caption: caption.to_owned(),
            })
            .await
    }

    async fn send_image(
        &mut self,
        chat_id: &str,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        self.script
            .run_send(SentCall::Image {
                chat_id: chat_id.to_owned(),
                path: path.to_path_buf(),
                file_name: file_name.to_owned(),
                caption: caption.to_owned(),
            })
            .await
    }

    async fn close(&mut self) -> Result<(), WhatsAppError> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
