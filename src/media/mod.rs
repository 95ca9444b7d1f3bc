pub mod ffmpeg;
pub mod planner;

use crate::error::{EncodeError, ProbeError};
use futures::future::BoxFuture;
use std::path::Path;

pub use ffmpeg::{FfmpegEncoder, FfmpegProber};
pub use planner::{AUDIO_BITRATE, EncodePlan, plan};

/// Container-level metadata of a source file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// Reads container metadata through an external probing engine.
pub trait Prober: Send + Sync + 'static {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<MediaInfo, ProbeError>>;
}

/// Produces `output` from `input` following `plan`.
///
/// Completion means the engine exited successfully and the output file is closed.
pub trait Encoder: Send + Sync + 'static {
    fn encode<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        plan: EncodePlan,
    ) -> BoxFuture<'a, Result<(), EncodeError>>;
}
