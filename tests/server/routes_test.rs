//! HTTP contract over a loopback listener.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use courier::config::Config;
use courier::pipeline::DeliveryPipeline;
use courier::server::{self, AppState};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::oneshot;

use crate::stub::{Script, SentCall};

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    script: Arc<Script>,
    pipeline: Arc<DeliveryPipeline>,
    config: Config,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.media.video_dir = dir.path().join("videos");
        config.media.image_dir = dir.path().join("images");
        config.fallback.path = dir.path().join("error_files.csv");
        config.captions.video = Some("video caption".to_owned());
        std::fs::create_dir_all(&config.media.video_dir).expect("video dir");
        std::fs::create_dir_all(&config.media.image_dir).expect("image dir");

        let script = Script::new();
        let pipeline = Arc::new(DeliveryPipeline::from_config(&config, script.factory()));
        let state = AppState::new(Arc::clone(&pipeline), &config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server::serve(listener, state, async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            client: reqwest::Client::new(),
            script,
            pipeline,
            config,
            stop: Some(stop),
            task,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("GET request");
        let status = resp.status();
        (status, resp.json().await.expect("JSON body"))
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await.expect("POST request");
        let status = resp.status();
        (status, resp.json().await.expect("JSON body"))
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let served = (&mut self.task).await.expect("server task");
        assert!(served.is_ok(), "server exited with error: {served:?}");
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.shutdown())
            .await
            .expect("bridge shutdown");
    }
}

#[tokio::test]
async fn health_reports_connection_state() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connection_live"], false);

    let (status, body) = server.post("/initialize", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = server.get("/health").await;
    assert_eq!(body["connection_live"], true);
    assert_eq!(body["state"], "connected");
    server.stop().await;
}

#[tokio::test]
async fn index_lists_endpoints() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["initialized"], false);
    assert!(body["endpoints"]["send_video_file"].is_string());
    server.stop().await;
}

#[tokio::test]
async fn initialize_failure_is_500() {
    let server = TestServer::start().await;
    server.script.connect_ok.store(false, Ordering::SeqCst);

    let (status, body) = server.post("/initialize", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    server.stop().await;
}

#[tokio::test]
async fn missing_body_or_fields_are_400() {
    let server = TestServer::start().await;

    for (path, body) in [
        ("/send_message", None),
        ("/send_message", Some(json!({ "phone_number": "1555" }))),
        ("/send_message", Some(json!({ "message": "hi" }))),
        ("/send_video_file", Some(json!({ "phone_number": "1555" }))),
        ("/send_image_file", Some(json!({ "file_name": "a.jpg" }))),
        ("/send_image_file", None),
    ] {
        let (status, response) = server.post(path, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path} {body:?}");
        assert_eq!(response["success"], false);
    }
    assert!(server.script.sent().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn escaping_file_names_are_400() {
    let server = TestServer::start().await;

    for file_name in ["../secret.mp4", "a/../../x.mp4", "/etc/passwd"] {
        let (status, _) = server
            .post(
                "/send_video_file",
                Some(json!({ "phone_number": "1555", "file_name": file_name })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{file_name}");
    }
    assert!(!server.config.fallback.path.exists());
    server.stop().await;
}

#[tokio::test]
async fn message_flow_end_to_end() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/send_message",
            Some(json!({ "phone_number": "+15551234567", "message": "hi" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);

    server.post("/initialize", None).await;
    let (status, body) = server
        .post(
            "/send_message",
            Some(json!({ "phone_number": "+15551234567", "message": "hi" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["ack"], 1);
    assert_eq!(
        server.script.sent(),
        vec![SentCall::Text {
            recipient: "15551234567".to_owned(),
            text: "hi".to_owned(),
        }]
    );
    server.stop().await;
}

#[tokio::test]
async fn video_uses_default_caption_and_missing_file_falls_back() {
    let server = TestServer::start().await;
    server.post("/initialize", None).await;
    std::fs::write(server.config.media.video_dir.join("clip.mp4"), b"mp4").expect("fixture");

    let (status, body) = server
        .post(
            "/send_video_file",
            Some(json!({ "phone_number": "1555", "file_name": "clip.mp4" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true, "{body}");
    match &server.script.sent()[0] {
        SentCall::File { caption, .. } => assert_eq!(caption, "video caption"),
        other => panic!("expected a file send, got {other:?}"),
    }

    let (status, body) = server
        .post(
            "/send_video_file",
            Some(json!({ "phone_number": "1555", "file_name": "missing.mp4", "caption": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    let message = body["message"].as_str().expect("message");
    assert!(message.contains("Fallback: Data successfully appended"), "{message}");

    let log = std::fs::read_to_string(&server.config.fallback.path).expect("fallback log");
    let expected = format!(
        "1555,{}",
        server.config.media.video_dir.join("missing.mp4").display()
    );
    assert!(log.contains(&expected), "{log}");
    assert_eq!(server.script.sent().len(), 1);
    server.stop().await;
}
