use crate::cache::ResponseCache;
use crate::config::Config;
use crate::job::{JobStatus, JobStore};
use crate::media::{Encoder, FfmpegEncoder, FfmpegProber, Prober};
use crate::notify::{LogNotifier, Notifier, RelayNotifier};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::info;

const UPLOADS_DIR: &str = "uploads";
const VIDEOS_DIR: &str = "videos";

fn init_workspace(workspace: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(workspace.join(UPLOADS_DIR))?;
    std::fs::create_dir_all(workspace.join(VIDEOS_DIR))?;
    Ok(())
}

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Engines {
    pub prober: Arc<dyn Prober>,
    pub encoder: Arc<dyn Encoder>,
    pub notifier: Arc<dyn Notifier>,
}

impl Engines {
    /// ffmpeg/ffprobe child processes plus the configured mail relay.
    pub fn from_config(config: &Config) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notify_url {
            Some(url) => {
                info!(%url, "Completion notices go to mail relay");
                Arc::new(RelayNotifier::new(url.clone()))
            }
            None => Arc::new(LogNotifier),
        };

        Self {
            prober: Arc::new(FfmpegProber::new(
                &config.ffprobe_path,
                Duration::from_secs(config.probe_timeout_secs),
            )),
            encoder: Arc::new(FfmpegEncoder::new(&config.ffmpeg_path)),
            notifier,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub engines: Engines,
    pub status_cache: ResponseCache<String, JobStatus>,
    pub encode_permits: Arc<Semaphore>,

    pub api_key: Arc<str>,
    pub ttl: Duration,
    pub filename_suffix: Arc<str>,
    pub frontend_url: Option<Arc<str>>,
    pub started_at: Instant,

    pub uploads_dir: PathBuf,
    pub videos_dir: PathBuf,
}

impl AppState {
    pub fn new(config: &Config, engines: Engines) -> anyhow::Result<Self> {
        let workspace = Path::new(&config.workspace);
        init_workspace(workspace)?;

        let api_key = config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow::anyhow!("API key is required"))?;

        let videos_dir = workspace.join(VIDEOS_DIR);
        info!(
            workspace = %workspace.display(),
            permits = config.permits,
            ttl_secs = config.ttl_secs,
            "Initialize app state"
        );

        Ok(Self {
            store: JobStore::new(&videos_dir),
            engines,
            status_cache: ResponseCache::new(Duration::from_secs(config.status_cache_secs)),
            encode_permits: Arc::new(Semaphore::new(config.permits.max(1))),

            api_key: Arc::from(api_key),
            ttl: config.ttl(),
            filename_suffix: Arc::from(config.filename_suffix.as_str()),
            frontend_url: config.frontend_url.as_deref().map(Arc::from),
            started_at: Instant::now(),

            uploads_dir: workspace.join(UPLOADS_DIR),
            videos_dir,
        })
    }

    pub fn uploads_dir(&self) -> &Path {
        self.uploads_dir.as_path()
    }

    pub fn videos_dir(&self) -> &Path {
        self.videos_dir.as_path()
    }
}
