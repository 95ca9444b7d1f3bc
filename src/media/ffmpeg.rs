use crate::error::{EncodeError, ProbeError};
use crate::media::planner::{AUDIO_BITRATE, EncodePlan};
use crate::media::{Encoder, MediaInfo, Prober};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Bytes ffprobe may read while looking for stream headers.
const PROBE_SIZE: &str = "5000000";
/// Microseconds of media ffprobe may analyze.
const ANALYZE_DURATION: &str = "5000000";
/// Diagnostic lines kept from a failing engine.
const DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    size: Option<String>,
}

/// Keep the last lines of the engine's stderr, that is where ffmpeg reports the cause.
fn diagnostic_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines = text.lines().filter(|l| !l.trim().is_empty()).collect::<Vec<_>>();
    let skip = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[skip..].join("\n")
}

fn parse_probe_output(stdout: &[u8]) -> Result<(Option<f64>, Option<u64>), ProbeError> {
    let output: ProbeOutput =
        serde_json::from_slice(stdout).map_err(|error| ProbeError::Malformed(error.to_string()))?;

    let duration = output
        .format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok());
    let size = output
        .format
        .size
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok());

    Ok((duration, size))
}

#[derive(Debug, Clone)]
pub struct FfmpegProber {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfmpegProber {
    pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    async fn run(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args(["-v", "error"])
            .args(["-probesize", PROBE_SIZE])
            .args(["-analyzeduration", ANALYZE_DURATION])
            .args(["-print_format", "json"])
            .arg("-show_format")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(?path, "Probing source file");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                status: output.status.to_string(),
                diagnostic: diagnostic_tail(&output.stderr),
            });
        }

        let (duration, size) = parse_probe_output(&output.stdout)?;
        let duration_secs =
            duration.ok_or_else(|| ProbeError::Malformed("container reports no duration".into()))?;
        let size_bytes = match size {
            Some(size) => size,
            None => tokio::fs::metadata(path)
                .await
                .map_err(|error| ProbeError::Malformed(error.to_string()))?
                .len(),
        };

        Ok(MediaInfo {
            duration_secs,
            size_bytes,
        })
    }
}

impl Prober for FfmpegProber {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<MediaInfo, ProbeError>> {
        self.run(path).boxed()
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn command(&self, input: &Path, output: &Path, plan: EncodePlan) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostats", "-nostdin", "-y"])
            .arg("-i")
            .arg(input)
            .args(["-c:v", "libx264"])
            .args(["-preset", "medium"])
            .args(["-b:v", &plan.video_bitrate.to_string()])
            .args(["-maxrate", &plan.max_rate().to_string()])
            .args(["-bufsize", &plan.buf_size().to_string()])
            .args(["-c:a", "aac"])
            .args(["-b:a", AUDIO_BITRATE])
            .args(["-movflags", "+faststart"])
            .args(["-f", "mp4"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, input: &Path, output: &Path, plan: EncodePlan) -> Result<(), EncodeError> {
        info!(
            ?input,
            ?output,
            video_bitrate = plan.video_bitrate,
            "Starting encode"
        );

        let result = self
            .command(input, output, plan)
            .output()
            .await
            .map_err(EncodeError::Spawn)?;

        if !result.status.success() {
            return Err(EncodeError::Failed {
                status: result.status.to_string(),
                diagnostic: diagnostic_tail(&result.stderr),
            });
        }

        Ok(())
    }
}

impl Encoder for FfmpegEncoder {
    fn encode<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
        plan: EncodePlan,
    ) -> BoxFuture<'a, Result<(), EncodeError>> {
        self.run(input, output, plan).boxed()
    }
}
