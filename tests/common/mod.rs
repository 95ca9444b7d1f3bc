#![allow(dead_code)]

use axum::routing::post;
use axum::{Json, Router};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::sleep;
use video_resize::job::{JobState, JobStatus, generate_id, now_ms};
use video_resize::{
    AppState, Config, EncodeError, EncodePlan, Encoder, Engines, MediaInfo, ProbeError, Prober,
    delivery_router, processing_router,
};

pub const API_KEY: &str = "test-api-key";
pub const CLIP_DURATION_SECS: f64 = 10.0;
/// Sources starting with this marker make the fake encoder fail.
pub const FAIL_MARKER: &[u8] = b"FAIL";
pub const MB: usize = 1024 * 1024;

/// Reports the real file size and a fixed duration.
pub struct FakeProber;

impl Prober for FakeProber {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<MediaInfo, ProbeError>> {
        async move {
            let size_bytes = tokio::fs::metadata(path)
                .await
                .map_err(|e| ProbeError::Malformed(e.to_string()))?
                .len();
            Ok(MediaInfo {
                duration_secs: CLIP_DURATION_SECS,
                size_bytes,
            })
        }
        .boxed()
    }
}

/// Keeps the first quarter of the source.
pub struct FakeEncoder;

impl Encoder for FakeEncoder {
    fn encode<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        _plan: EncodePlan,
    ) -> BoxFuture<'a, Result<(), EncodeError>> {
        async move {
            let data = tokio::fs::read(input).await.map_err(EncodeError::Spawn)?;
            if data.starts_with(FAIL_MARKER) {
                return Err(EncodeError::Failed {
                    status: "exit status: 1".into(),
                    diagnostic: "Invalid data found when processing input".into(),
                });
            }
            tokio::fs::write(output, &data[..data.len() / 4])
                .await
                .map_err(EncodeError::Spawn)?;
            Ok(())
        }
        .boxed()
    }
}

/// Test harness serving both routers on ephemeral ports
pub struct TestServer {
    pub state: AppState,
    processing_addr: SocketAddr,
    delivery_addr: SocketAddr,
    _workspace: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_config(|_| {}).await
    }

    pub async fn start_with_relay(relay: &MockRelay) -> Self {
        let url = relay.url();
        Self::start_with_config(move |config| {
            config.frontend_url = Some("https://example.com".into());
            config.notify_url = Some(url);
        })
        .await
    }

    pub async fn start_with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let mut config = Config {
            workspace: workspace.path().to_string_lossy().into_owned(),
            api_key: Some(API_KEY.into()),
            permits: 2,
            ..Default::default()
        };
        customize(&mut config);
        config.validate().unwrap();

        let engines = Engines {
            prober: Arc::new(FakeProber),
            encoder: Arc::new(FakeEncoder),
            ..Engines::from_config(&config)
        };
        let state = AppState::new(&config, engines).unwrap();

        let processing = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let delivery = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let processing_addr = processing.local_addr().unwrap();
        let delivery_addr = delivery.local_addr().unwrap();

        let processing_app = processing_router(state.clone(), config.max_upload_bytes());
        let delivery_app = delivery_router(state.clone());
        tokio::spawn(async move { axum::serve(processing, processing_app).await });
        tokio::spawn(async move { axum::serve(delivery, delivery_app).await });

        TestServer {
            state,
            processing_addr,
            delivery_addr,
            _workspace: workspace,
        }
    }

    pub fn processing_url(&self) -> String {
        format!("http://{}", self.processing_addr)
    }

    pub fn delivery_url(&self) -> String {
        format!("http://{}", self.delivery_addr)
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    /// POST /process-video with the given form fields.
    pub async fn upload(
        &self,
        client: &reqwest::Client,
        video: Option<(&str, &str, Vec<u8>)>,
        target_size: Option<&str>,
        email: Option<&str>,
    ) -> reqwest::Response {
        let mut form = reqwest::multipart::Form::new();
        if let Some(target_size) = target_size {
            form = form.text("targetSize", target_size.to_string());
        }
        if let Some(email) = email {
            form = form.text("email", email.to_string());
        }
        if let Some((file_name, mime, data)) = video {
            let part = reqwest::multipart::Part::bytes(data)
                .file_name(file_name.to_string())
                .mime_str(mime)
                .unwrap();
            form = form.part("video", part);
        }

        client
            .post(format!("{}/process-video", self.processing_url()))
            .bearer_auth(API_KEY)
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    pub async fn status(&self, client: &reqwest::Client, id: &str) -> reqwest::Response {
        client
            .get(format!("{}/video-status/{id}", self.processing_url()))
            .bearer_auth(API_KEY)
            .send()
            .await
            .unwrap()
    }

    pub async fn download(
        &self,
        client: &reqwest::Client,
        id: &str,
        filename: &str,
        range: Option<&str>,
    ) -> reqwest::Response {
        let mut request = client.get(format!(
            "{}/download-video/{id}/{filename}",
            self.delivery_url()
        ));
        if let Some(range) = range {
            request = request.header("Range", range);
        }
        request.send().await.unwrap()
    }

    /// Polls the status endpoint until the job reports completed.
    pub async fn wait_for_completion(&self, client: &reqwest::Client, id: &str) -> JobStatus {
        for _ in 0..500 {
            let response = self.status(client, id).await;
            if response.status() == 200 {
                let doc: JobStatus = response.json().await.unwrap();
                if doc.status == JobState::Completed {
                    return doc;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not complete");
    }

    /// Writes a finished job straight into the store.
    pub async fn seed_job(&self, age: Duration, content: &[u8]) -> JobStatus {
        let id = generate_id();
        let filename = "seeded-compressed.mp4".to_string();
        self.state.store.create(&id).await.unwrap();
        tokio::fs::write(self.state.store.file_path(&id, &filename), content)
            .await
            .unwrap();

        let doc = JobStatus {
            id: id.clone(),
            created_at: now_ms() - age.as_millis() as i64,
            original_size: content.len() as u64 * 4,
            new_size: Some(content.len() as u64),
            reduction_percentage: Some(75.0),
            compression_time: Some(1.0),
            filename,
            email: None,
            status: JobState::Completed,
        };
        self.state.store.write_status(&id, &doc).await.unwrap();
        doc
    }

    pub fn uploads_count(&self) -> usize {
        std::fs::read_dir(self.state.uploads_dir()).unwrap().count()
    }

    pub fn jobs_count(&self) -> usize {
        std::fs::read_dir(self.state.videos_dir()).unwrap().count()
    }
}

/// Mail relay capturing every notice it receives.
pub struct MockRelay {
    addr: SocketAddr,
    pub received_calls: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let received_calls = Arc::new(Mutex::new(Vec::new()));
        let calls = received_calls.clone();

        let app = Router::new().route(
            "/send",
            post(move |Json(body): Json<serde_json::Value>| {
                let calls = calls.clone();
                async move {
                    calls.lock().await.push(body);
                    "OK"
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        MockRelay {
            addr,
            received_calls,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/send", self.addr)
    }

    /// Wait for at least `count` notices, up to `timeout_secs`.
    pub async fn wait_for_calls(&self, count: usize, timeout_secs: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        while tokio::time::Instant::now() < deadline {
            if self.received_calls.lock().await.len() >= count {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn get_calls(&self) -> Vec<serde_json::Value> {
        self.received_calls.lock().await.clone()
    }
}

/// Source clip of `len` bytes that the fake engines accept.
pub fn clip(len: usize) -> Vec<u8> {
    vec![0x42; len]
}
