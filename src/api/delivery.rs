use crate::AppState;
use crate::error::ApiError;
use crate::job::{is_valid_job_id, now_ms};
use axum::body::Body;
use axum::extract::{Extension, Path as AxumPath};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use mime_guess::from_path;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

pub const EXPIRES_IN_HEADER: &str = "x-expires-in";

/// How a `Range` header applies to a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    /// Inclusive bounds
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Single-range `bytes=` parsing. Anything malformed is ignored and served in full.
pub fn parse_range(headers: &HeaderMap, file_size: u64) -> ByteRange {
    let Some(ranges) = headers
        .get(header::RANGE)
        .and_then(|rh| rh.to_str().ok())
        .and_then(|s| s.trim().strip_prefix("bytes="))
    else {
        return ByteRange::Full;
    };

    // multiple ranges are not supported
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // suffix range: the last n bytes
        let Ok(suffix) = end.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || file_size == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial {
            start: file_size.saturating_sub(suffix),
            end: file_size - 1,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Full,
        }
    };

    if start >= file_size {
        return ByteRange::Unsatisfiable;
    }
    let last = file_size - 1;
    ByteRange::Partial {
        start,
        end: end.map_or(last, |end| end.min(last)),
    }
}

/// `<H>h <M>m`, both rounded down.
pub fn format_expires_in(remaining_ms: i64) -> String {
    let remaining_ms = remaining_ms.max(0);
    let hours = remaining_ms / (60 * 60 * 1000);
    let minutes = (remaining_ms % (60 * 60 * 1000)) / (60 * 1000);
    format!("{hours}h {minutes}m")
}

pub async fn download_video(
    Extension(state): Extension<AppState>,
    AxumPath((id, filename)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    if !is_valid_job_id(&id) {
        warn!(%id, "Invalid job ID format");
        return Err(ApiError::NotFound("Video not found"));
    }

    let doc = match state.store.read_status(&id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return Err(ApiError::NotFound("Video not found")),
        Err(error) => {
            error!(job_id = %id, ?error, "Failed to read status document");
            return Err(ApiError::NotFound("Video not found"));
        }
    };

    let now = now_ms();
    if doc.is_expired(now, state.ttl) {
        state.status_cache.remove(&id);
        let store = state.store.clone();
        tokio::spawn(async move {
            match store.delete(&id).await {
                Ok(true) => info!(job_id = %id, "Expired job removed on access"),
                Ok(false) => {}
                Err(error) => error!(job_id = %id, ?error, "Failed to remove expired job"),
            }
        });
        return Err(ApiError::NotFound("File has expired"));
    }

    // the on-disk path comes from the recorded name only
    if filename != doc.filename {
        warn!(job_id = %id, %filename, "Requested filename does not match job");
        return Err(ApiError::NotFound("Video file not found"));
    }
    let path = state.store.file_path(&id, &doc.filename);
    let Ok(metadata) = tokio::fs::metadata(&path).await else {
        warn!(job_id = %id, ?path, "Backing file missing");
        return Err(ApiError::NotFound("Video file not found"));
    };
    let size = metadata.len();

    let mut res = match parse_range(&headers, size) {
        ByteRange::Unsatisfiable => {
            debug!(job_id = %id, size, "Unsatisfiable range");
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            res.headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            res
        }
        ByteRange::Full => serve_file(path, 0, size).await?,
        ByteRange::Partial { start, end } => {
            let mut res = serve_file(path, start, end - start + 1).await?;
            *res.status_mut() = StatusCode::PARTIAL_CONTENT;
            res.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            res
        }
    };

    let headers = res.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(format!("attachment; filename=\"{}\"", doc.filename))?,
    );
    headers.insert(
        EXPIRES_IN_HEADER,
        header_value(format_expires_in(doc.remaining_ms(now, state.ttl)))?,
    );

    Ok(res)
}

/// Streams `len` bytes of `path` from `start`.
async fn serve_file(path: PathBuf, start: u64, len: u64) -> Result<Response<Body>, ApiError> {
    let mut fh = tokio::fs::File::open(&path).await?;
    fh.seek(std::io::SeekFrom::Start(start)).await?;

    let stream = ReaderStream::new(fh.take(len));
    debug!(?path, start, len, "Serving video file");

    let mut res = Response::new(Body::from_stream(stream));
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header_value(from_path(&path).first_or_octet_stream().to_string())?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(res)
}

fn header_value(value: String) -> Result<HeaderValue, ApiError> {
    HeaderValue::try_from(value)
        .map_err(|error| ApiError::Internal(anyhow::anyhow!("invalid header value: {error}")))
}
