pub mod compress;
pub mod lifecycle;
pub mod store;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Re-exports for convenience
pub use compress::{CompressJob, Submission, UploadArtifact};
pub use lifecycle::{Lifecycle, SweepReport};
pub use store::JobStore;

pub const STATUS_FILE: &str = "stats.json";
pub const OUTPUT_EXTENSION: &str = "mp4";
const FALLBACK_STEM: &str = "video";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Processing,
    Completed,
    Expired,
}

/// The per-job status document, persisted as `stats.json` in the job directory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    /// Epoch milliseconds, set when the encode completed
    pub created_at: i64,
    pub original_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction_percentage: Option<f64>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_time: Option<f64>,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub status: JobState,
}

impl JobStatus {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at
    }

    pub fn is_expired(&self, now_ms: i64, ttl: Duration) -> bool {
        self.age_ms(now_ms) > ttl_ms(ttl)
    }

    /// Milliseconds left before expiry, zero once expired.
    pub fn remaining_ms(&self, now_ms: i64, ttl: Duration) -> i64 {
        (ttl_ms(ttl) - self.age_ms(now_ms)).max(0)
    }

    /// Copy of the document as seen by a reader at `now_ms`.
    pub fn observed_at(&self, now_ms: i64, ttl: Duration) -> Self {
        let mut doc = self.clone();
        if self.is_expired(now_ms, ttl) {
            doc.status = JobState::Expired;
        }
        doc
    }
}

pub fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// RFC 3339 instant at which a job anchored at `created_at_ms` expires.
pub fn expires_at(created_at_ms: i64, ttl: Duration) -> String {
    chrono::DateTime::from_timestamp_millis(created_at_ms.saturating_add(ttl_ms(ttl)))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// 128 random bits as 32 lowercase hex chars.
pub fn generate_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Validate job ID with basic rules
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id.len() == 32 && job_id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `(original - new) / original` as a percentage.
pub fn reduction_percentage(original_size: u64, new_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    (original_size as f64 - new_size as f64) / original_size as f64 * 100.0
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Derives the download name from the uploaded name.
///
/// `clip.mov` becomes `clip-<suffix>.mp4`; a stem that already carries the suffix
/// keeps its name so repeated passes do not stack suffixes.
pub fn output_filename(original_name: &str, suffix: &str) -> String {
    // Browsers may send a full client path
    let base = original_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let stem = Path::new(base)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | '/' | '\\'))
        .collect::<String>();
    let stem = stem.trim();
    let stem = if stem.is_empty() { FALLBACK_STEM } else { stem };

    if stem.to_lowercase().contains(&suffix.to_lowercase()) {
        format!("{stem}.{OUTPUT_EXTENSION}")
    } else {
        format!("{stem}-{suffix}.{OUTPUT_EXTENSION}")
    }
}
