use crate::AppState;
use crate::error::ApiError;
use crate::job::{
    CompressJob, JobState, JobStatus, Submission, UploadArtifact, expires_at, is_valid_job_id,
    now_ms, round2,
};
use axum::extract::{Extension, Multipart, Path as AxumPath};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, error, info, warn};

const VIDEO_FIELD: &str = "video";
const TARGET_SIZE_FIELD: &str = "targetSize";
const EMAIL_FIELD: &str = "email";

/// Returned right away when the job finishes in the background.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResponse {
    pub id: String,
    pub filename: String,
    pub expires_at: String,
    pub original_size: u64,
    pub estimated_new_size: u64,
    pub estimated_reduction_percentage: f64,
    pub email_notification: bool,
    pub email: String,
    pub status: JobState,
}

/// Returned once a synchronous job has finished.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedResponse {
    pub id: String,
    pub filename: String,
    pub expires_at: String,
    pub original_size: u64,
    pub new_size: u64,
    pub reduction_percentage: f64,
    pub compression_time: f64,
    pub status: JobState,
}

impl CompletedResponse {
    fn new(doc: &JobStatus, state: &AppState) -> Self {
        Self {
            id: doc.id.clone(),
            filename: doc.filename.clone(),
            expires_at: expires_at(doc.created_at, state.ttl),
            original_size: doc.original_size,
            new_size: doc.new_size.unwrap_or_default(),
            reduction_percentage: round2(doc.reduction_percentage.unwrap_or_default()),
            compression_time: doc.compression_time.unwrap_or_default(),
            status: doc.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub uptime_secs: u64,
}

/// Multipart fields collected before the job is validated.
#[derive(Default)]
struct UploadForm {
    upload: Option<UploadArtifact>,
    target_size: Option<String>,
    email: Option<String>,
}

impl UploadForm {
    async fn read(uploads_dir: &Path, multipart: &mut Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        if let Err(error) = form.read_fields(uploads_dir, multipart).await {
            form.discard().await;
            return Err(error);
        }
        Ok(form)
    }

    async fn read_fields(
        &mut self,
        uploads_dir: &Path,
        multipart: &mut Multipart,
    ) -> Result<(), ApiError> {
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                VIDEO_FIELD => {
                    if self.upload.is_some() {
                        return Err(ApiError::validation("Only one video file is allowed"));
                    }
                    let is_video = field
                        .content_type()
                        .is_some_and(|content_type| content_type.starts_with("video/"));
                    if !is_video {
                        return Err(ApiError::validation("Only video files are allowed"));
                    }

                    let original_name = field.file_name().unwrap_or_default().to_string();
                    self.upload =
                        Some(UploadArtifact::receive(uploads_dir, &original_name, field).await?);
                }
                TARGET_SIZE_FIELD => {
                    self.target_size = Some(field.text().await?);
                }
                EMAIL_FIELD => {
                    self.email = Some(field.text().await?);
                }
                _ => debug!(%name, "Ignoring unknown form field"),
            }
        }
        Ok(())
    }

    async fn discard(&self) {
        if let Some(upload) = &self.upload {
            upload.discard().await;
        }
    }

    /// Checks the non-file fields and hands the upload over to a submission.
    async fn into_submission(self) -> Result<Submission, ApiError> {
        let Some(upload) = self.upload else {
            return Err(ApiError::validation("No file uploaded"));
        };

        let checked = parse_target_size(self.target_size.as_deref())
            .and_then(|target| Ok((target, parse_email(self.email.as_deref())?)));

        match checked {
            Ok((target_size_mb, email)) => Ok(Submission {
                upload,
                target_size_mb,
                email,
            }),
            Err(error) => {
                upload.discard().await;
                Err(error)
            }
        }
    }
}

/// Megabytes, finite and strictly positive.
fn parse_target_size(raw: Option<&str>) -> Result<f64, ApiError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ApiError::validation("Target size is required"));
    }

    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(ApiError::validation("Target size must be a positive number")),
    }
}

/// An empty field means no notification.
fn parse_email(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(email) = raw.map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(None);
    };

    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
        && !email.chars().any(|c| c.is_whitespace() || c.is_control());
    if !valid {
        return Err(ApiError::validation("Invalid email address"));
    }
    Ok(Some(email.to_string()))
}

pub async fn process_video(
    Extension(state): Extension<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = UploadForm::read(state.uploads_dir(), &mut multipart).await?;
    let submission = form.into_submission().await?;
    let job = CompressJob::prepare(&state, submission).await?;

    if let Some(email) = job.email.clone() {
        let response = ProcessingResponse {
            id: job.id.clone(),
            filename: job.filename.clone(),
            expires_at: expires_at(now_ms(), state.ttl),
            original_size: job.original_size,
            estimated_new_size: job.target_size_bytes,
            estimated_reduction_percentage: job.estimated_reduction_percentage(),
            email_notification: true,
            email,
            status: JobState::Processing,
        };

        info!(job_id = %job.id, "Processing in background");
        // detached, the outcome is logged by the job itself
        drop(job.spawn(state));
        return Ok(Json(response).into_response());
    }

    let doc = job
        .spawn(state.clone())
        .await
        .map_err(|error| anyhow::anyhow!("job task failed: {error}"))??;

    Ok(Json(CompletedResponse::new(&doc, &state)).into_response())
}

pub async fn video_status(
    Extension(state): Extension<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<JobStatus>, ApiError> {
    if !is_valid_job_id(&id) {
        warn!(%id, "Invalid job ID format");
        return Err(ApiError::NotFound("Video not found"));
    }

    let doc = match state.status_cache.get(&id) {
        Some(doc) => doc,
        None => {
            let doc = match state.store.read_status(&id).await {
                Ok(Some(doc)) => doc,
                Ok(None) => return Err(ApiError::NotFound("Video not found")),
                Err(error) => {
                    error!(job_id = %id, ?error, "Failed to read status document");
                    return Err(ApiError::NotFound("Video not found"));
                }
            };
            // completed documents never change on disk
            if doc.status == JobState::Completed {
                state.status_cache.put(id.clone(), doc.clone());
            }
            doc
        }
    };

    if doc.status == JobState::Completed {
        let path = state.store.file_path(&id, &doc.filename);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(job_id = %id, ?path, "Backing file missing");
            state.status_cache.remove(&id);
            return Err(ApiError::NotFound("Video not found"));
        }
    }

    Ok(Json(doc.observed_at(now_ms(), state.ttl)))
}

fn health(state: &AppState, service: &str) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: service.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub async fn processing_health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    health(&state, "processing")
}

pub async fn delivery_health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    health(&state, "delivery")
}
