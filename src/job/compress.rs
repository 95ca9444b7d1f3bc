use crate::app_state::AppState;
use crate::error::ApiError;
use crate::job::{
    JobState, JobStatus, generate_id, now_ms, output_filename, reduction_percentage, round2,
};
use crate::media::{EncodePlan, plan};
use crate::notify::{CompletionNotice, notify_best_effort};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Raw uploaded bytes waiting to be encoded, owned by the orchestrator.
#[derive(Debug)]
pub struct UploadArtifact {
    path: PathBuf,
    original_name: String,
}

impl UploadArtifact {
    /// Streams `body` to `<uploads_dir>/<token><ext>`.
    ///
    /// A partial file is removed before the error is returned. Stream errors keep
    /// their own status, so an over-limit body still answers 413.
    pub async fn receive<S, E>(
        uploads_dir: &Path,
        original_name: &str,
        mut body: S,
    ) -> Result<Self, ApiError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<ApiError>,
    {
        let path = uploads_dir.join(upload_file_name(original_name));
        let mut file = tokio::fs::File::create(&path).await?;

        let artifact = Self {
            path,
            original_name: original_name.to_string(),
        };

        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    let error = error.into();
                    warn!(path = ?artifact.path, %error, "Upload stream failed");
                    artifact.discard().await;
                    return Err(error);
                }
            };

            if let Err(error) = file.write_all(&chunk).await {
                error!(path = ?artifact.path, ?error, "Failed to write upload file");
                artifact.discard().await;
                return Err(error.into());
            }
            written += chunk.len() as u64;
        }

        if let Err(error) = file.flush().await {
            error!(path = ?artifact.path, ?error, "Failed to flush upload file");
            artifact.discard().await;
            return Err(error.into());
        }

        debug!(path = ?artifact.path, written, "Upload stored");
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Best-effort removal; failures are only logged.
    pub async fn discard(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = ?self.path, "Upload removed"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(path = ?self.path, ?error, "Failed to delete upload file"),
        }
    }
}

/// `<token><ext>`, with the extension reduced to lowercase alphanumerics.
fn upload_file_name(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>();

    if ext.is_empty() {
        generate_id()
    } else {
        format!("{}.{ext}", generate_id())
    }
}

/// A validated upload request.
#[derive(Debug)]
pub struct Submission {
    pub upload: UploadArtifact,
    pub target_size_mb: f64,
    pub email: Option<String>,
}

/// One accepted encode: probed, validated and holding its job directory.
#[derive(Debug)]
pub struct CompressJob {
    pub id: String,
    pub filename: String,
    pub original_size: u64,
    pub target_size_bytes: u64,
    pub plan: EncodePlan,
    pub email: Option<String>,
    upload: UploadArtifact,
    accepted_at: Instant,
}

impl CompressJob {
    /// Probes the upload and checks it against the requested size.
    ///
    /// Every rejection discards the upload before returning.
    pub async fn prepare(state: &AppState, submission: Submission) -> Result<Self, ApiError> {
        let accepted_at = Instant::now();
        let Submission {
            upload,
            target_size_mb,
            email,
        } = submission;

        let info = match state.engines.prober.probe(upload.path()).await {
            Ok(info) => info,
            Err(error) => {
                error!(path = ?upload.path(), %error, "Probe failed");
                upload.discard().await;
                return Err(error.into());
            }
        };

        let target_size_bytes = (target_size_mb * BYTES_PER_MB).floor() as u64;
        if target_size_bytes >= info.size_bytes {
            upload.discard().await;
            return Err(ApiError::TargetTooLarge {
                original_size_mb: info.size_bytes as f64 / BYTES_PER_MB,
            });
        }

        let Some(plan) = plan(target_size_bytes, info.duration_secs) else {
            upload.discard().await;
            return Err(ApiError::validation(
                "Video duration could not be determined",
            ));
        };

        let id = generate_id();
        if let Err(error) = state.store.create(&id).await {
            error!(job_id = %id, ?error, "Failed to create job directory");
            upload.discard().await;
            return Err(error.into());
        }

        let filename = output_filename(upload.original_name(), &state.filename_suffix);
        info!(
            job_id = %id,
            %filename,
            original_size = info.size_bytes,
            target_size_bytes,
            duration_secs = info.duration_secs,
            video_bitrate = plan.video_bitrate,
            "Job accepted"
        );

        Ok(Self {
            id,
            filename,
            original_size: info.size_bytes,
            target_size_bytes,
            plan,
            email,
            upload,
            accepted_at,
        })
    }

    pub fn estimated_reduction_percentage(&self) -> f64 {
        round2(reduction_percentage(
            self.original_size,
            self.target_size_bytes,
        ))
    }

    /// Runs the encode in its own task so a dropped request cannot cancel it.
    ///
    /// Jobs with an email address get their completion notice from the same task.
    pub fn spawn(self, state: AppState) -> JoinHandle<Result<JobStatus, ApiError>> {
        tokio::spawn(async move {
            let doc = self.run(&state).await?;

            if let Some(email) = &self.email {
                let notice = CompletionNotice::new(
                    email,
                    &doc,
                    state.frontend_url.as_deref(),
                    state.ttl,
                );
                notify_best_effort(state.engines.notifier.as_ref(), notice).await;
            }

            self.upload.discard().await;
            Ok(doc)
        })
    }

    async fn run(&self, state: &AppState) -> Result<JobStatus, ApiError> {
        match self.encode_and_record(state).await {
            Ok(doc) => {
                info!(
                    job_id = %self.id,
                    new_size = doc.new_size,
                    compression_time = doc.compression_time,
                    "Job completed"
                );
                Ok(doc)
            }
            Err(error) => {
                error!(job_id = %self.id, %error, "Job failed");
                self.upload.discard().await;
                if let Err(error) = state.store.delete(&self.id).await {
                    warn!(job_id = %self.id, ?error, "Failed to remove failed job directory");
                }
                Err(error)
            }
        }
    }

    async fn encode_and_record(&self, state: &AppState) -> Result<JobStatus, ApiError> {
        let _permit = state
            .encode_permits
            .acquire()
            .await
            .map_err(|error| anyhow::anyhow!("encode permits closed: {error}"))?;
        debug!(job_id = %self.id, "Encode permit acquired");

        let final_path = state.store.file_path(&self.id, &self.filename);
        let partial_path = state
            .store
            .file_path(&self.id, &format!(".{}.partial", self.filename));

        state
            .engines
            .encoder
            .encode(self.upload.path(), &partial_path, self.plan)
            .await?;

        // the status document must never point at an unfinished file
        tokio::fs::rename(&partial_path, &final_path).await?;
        let new_size = tokio::fs::metadata(&final_path).await?.len();

        let doc = JobStatus {
            id: self.id.clone(),
            created_at: now_ms(),
            original_size: self.original_size,
            new_size: Some(new_size),
            reduction_percentage: Some(reduction_percentage(self.original_size, new_size)),
            compression_time: Some(self.accepted_at.elapsed().as_secs_f64()),
            filename: self.filename.clone(),
            email: self.email.clone(),
            status: JobState::Completed,
        };
        state.store.write_status(&self.id, &doc).await?;
        state.status_cache.remove(&self.id);

        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::Engines;
    use crate::config::Config;
    use crate::error::{EncodeError, ProbeError};
    use crate::media::{Encoder, MediaInfo, Prober};
    use crate::notify::Notifier;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    struct FixedProber {
        duration_secs: f64,
    }

    impl Prober for FixedProber {
        fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<MediaInfo, ProbeError>> {
            async move {
                let size_bytes = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| ProbeError::Malformed(e.to_string()))?
                    .len();
                Ok(MediaInfo {
                    duration_secs: self.duration_secs,
                    size_bytes,
                })
            }
            .boxed()
        }
    }

    /// Writes half of the input, or fails when told to.
    #[derive(Default)]
    struct HalvingEncoder {
        fail: bool,
        calls: AtomicUsize,
    }

    impl Encoder for HalvingEncoder {
        fn encode<'a>(
            &'a self,
            input: &'a Path,
            output: &'a Path,
            _plan: EncodePlan,
        ) -> BoxFuture<'a, Result<(), EncodeError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    return Err(EncodeError::Failed {
                        status: "exit status: 1".into(),
                        diagnostic: "Invalid data found when processing input".into(),
                    });
                }
                let data = tokio::fs::read(input).await.map_err(EncodeError::Spawn)?;
                tokio::fs::write(output, &data[..data.len() / 2])
                    .await
                    .map_err(EncodeError::Spawn)?;
                Ok(())
            }
            .boxed()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<CompletionNotice>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: CompletionNotice) -> BoxFuture<'_, anyhow::Result<()>> {
            self.notices.lock().push(notice);
            async { Ok(()) }.boxed()
        }
    }

    struct Fixture {
        state: AppState,
        encoder: Arc<HalvingEncoder>,
        notifier: Arc<RecordingNotifier>,
        _workspace: TempDir,
    }

    fn fixture(fail: bool, duration_secs: f64) -> Fixture {
        let workspace = tempdir().unwrap();
        let config = Config {
            workspace: workspace.path().to_string_lossy().into_owned(),
            api_key: Some("secret".into()),
            ..Default::default()
        };
        let encoder = Arc::new(HalvingEncoder {
            fail,
            ..Default::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let engines = Engines {
            prober: Arc::new(FixedProber { duration_secs }),
            encoder: encoder.clone(),
            notifier: notifier.clone(),
        };
        let state = AppState::new(&config, engines).unwrap();

        Fixture {
            state,
            encoder,
            notifier,
            _workspace: workspace,
        }
    }

    async fn upload(state: &AppState, name: &str, size: usize) -> UploadArtifact {
        let body = futures::stream::iter(vec![Ok::<_, ApiError>(Bytes::from(vec![
            7u8;
            size
        ]))]);
        UploadArtifact::receive(state.uploads_dir(), name, body)
            .await
            .unwrap()
    }

    fn uploads_count(state: &AppState) -> usize {
        std::fs::read_dir(state.uploads_dir()).unwrap().count()
    }

    #[test]
    fn test_upload_file_name() {
        let name = upload_file_name("My Clip.MOV");
        assert!(name.ends_with(".mov"));
        assert_eq!(name.len(), 32 + 4);

        let name = upload_file_name("noext");
        assert_eq!(name.len(), 32);

        let name = upload_file_name("weird.m/p4");
        assert!(!name.contains('/'));
    }

    #[tokio::test]
    async fn test_receive_discards_partial_upload_on_stream_error() {
        let f = fixture(false, 10.0);
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"first")),
            Err(ApiError::validation("connection reset")),
        ]);
        let result = UploadArtifact::receive(f.state.uploads_dir(), "clip.mp4", body).await;

        assert!(matches!(result, Err(ApiError::Validation(_))));
        assert_eq!(uploads_count(&f.state), 0);
    }

    #[tokio::test]
    async fn test_receive_keeps_body_limit_status() {
        let f = fixture(false, 10.0);
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"first")),
            Err(ApiError::PayloadTooLarge),
        ]);
        let result = UploadArtifact::receive(f.state.uploads_dir(), "clip.mp4", body).await;

        assert!(matches!(result, Err(ApiError::PayloadTooLarge)));
        assert_eq!(uploads_count(&f.state), 0);
    }

    #[tokio::test]
    async fn test_target_not_smaller_than_original_is_rejected() {
        let f = fixture(false, 10.0);
        let one_mb = 1024 * 1024;

        for target_size_mb in [1.0, 2.0] {
            let submission = Submission {
                upload: upload(&f.state, "clip.mp4", one_mb).await,
                target_size_mb,
                email: None,
            };
            let result = CompressJob::prepare(&f.state, submission).await;
            assert!(matches!(result, Err(ApiError::TargetTooLarge { .. })));
        }

        assert_eq!(f.encoder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(uploads_count(&f.state), 0);
        assert!(f.state.store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_duration_is_rejected() {
        let f = fixture(false, 0.0);
        let submission = Submission {
            upload: upload(&f.state, "clip.mp4", 1024 * 1024).await,
            target_size_mb: 0.5,
            email: None,
        };

        let result = CompressJob::prepare(&f.state, submission).await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
        assert_eq!(uploads_count(&f.state), 0);
    }

    #[tokio::test]
    async fn test_successful_job_writes_status_and_removes_upload() {
        let f = fixture(false, 10.0);
        let submission = Submission {
            upload: upload(&f.state, "clip.mp4", 1024 * 1024).await,
            target_size_mb: 0.5,
            email: None,
        };

        let job = CompressJob::prepare(&f.state, submission).await.unwrap();
        assert_eq!(job.filename, "clip-compressed.mp4");
        assert_eq!(job.plan.video_bitrate, 512 * 1024 * 8 / 10);
        assert_eq!(job.estimated_reduction_percentage(), 50.0);

        let id = job.id.clone();
        let doc = job.spawn(f.state.clone()).await.unwrap().unwrap();

        assert_eq!(doc.status, JobState::Completed);
        assert_eq!(doc.new_size, Some(512 * 1024));
        assert_eq!(doc.reduction_percentage, Some(50.0));
        assert_eq!(f.state.store.read_status(&id).await.unwrap(), Some(doc.clone()));

        let file = f.state.store.file_path(&id, &doc.filename);
        assert_eq!(std::fs::metadata(&file).unwrap().len(), 512 * 1024);
        assert_eq!(uploads_count(&f.state), 0);
        // no email, no notice
        assert!(f.notifier.notices.lock().is_empty());
    }

    #[tokio::test]
    async fn test_emailed_job_sends_notice_after_status_is_written() {
        let f = fixture(false, 10.0);
        let submission = Submission {
            upload: upload(&f.state, "clip.mp4", 1024 * 1024).await,
            target_size_mb: 0.5,
            email: Some("user@example.com".into()),
        };

        let job = CompressJob::prepare(&f.state, submission).await.unwrap();
        let id = job.id.clone();
        job.spawn(f.state.clone()).await.unwrap().unwrap();

        let notices = f.notifier.notices.lock().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].to, "user@example.com");
        assert_eq!(notices[0].job_id, id);
        let doc = f.state.store.read_status(&id).await.unwrap().unwrap();
        assert_eq!(doc.email.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn test_failed_encode_leaves_no_trace() {
        let f = fixture(true, 10.0);
        let submission = Submission {
            upload: upload(&f.state, "clip.mp4", 1024 * 1024).await,
            target_size_mb: 0.5,
            email: Some("user@example.com".into()),
        };

        let job = CompressJob::prepare(&f.state, submission).await.unwrap();
        let id = job.id.clone();
        let result = job.spawn(f.state.clone()).await.unwrap();

        assert!(matches!(result, Err(ApiError::Encode(_))));
        assert_eq!(f.state.store.read_status(&id).await.unwrap(), None);
        assert!(!f.state.store.job_dir(&id).exists());
        assert_eq!(uploads_count(&f.state), 0);
        assert!(f.notifier.notices.lock().is_empty());
    }
}
