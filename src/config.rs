use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure that can be loaded from CLI, config file, or environment
///
/// Example configuration file content
/// # Video Resize Configuration
///
/// # Server configuration
/// processing_port = 5000
/// download_port = 5001
/// workspace = "./data"
/// api_key = "change-me"
/// permits = 4
///
/// # Retention
/// ttl_secs = 86400
/// cleanup_interval_secs = 1800
///
/// # Encode engine
/// ffmpeg_path = "/usr/bin/ffmpeg"
/// ffprobe_path = "/usr/bin/ffprobe"
/// probe_timeout_secs = 30
///
/// # Notification (optional)
/// frontend_url = "https://example.com"
/// notify_url = "https://mail-relay.example.com/send"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port for the upload and status API
    #[arg(short = 'p', long, default_value_t = 5000)]
    #[serde(default = "default_processing_port")]
    pub processing_port: u16,

    /// Port for the download API
    #[arg(short = 'd', long, default_value_t = 5001)]
    #[serde(default = "default_download_port")]
    pub download_port: u16,

    /// Working directory for file storage
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Bearer credential required by the processing API
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Seconds a finished video stays downloadable
    #[arg(long, default_value_t = 86400)]
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between two expiry sweeps
    #[arg(long, default_value_t = 1800)]
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Number of concurrent encode jobs
    #[arg(long, default_value_t = default_permits())]
    #[serde(default = "default_permits")]
    pub permits: usize,

    /// Largest accepted upload in megabytes
    #[arg(long, default_value_t = 4000)]
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    /// Seconds a status document stays in the response cache
    #[arg(long, default_value_t = 10)]
    #[serde(default = "default_status_cache_secs")]
    pub status_cache_secs: u64,

    /// Upper bound for one probe run in seconds
    #[arg(long, default_value_t = 30)]
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// ffmpeg executable
    #[arg(long, default_value = "ffmpeg")]
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// ffprobe executable
    #[arg(long, default_value = "ffprobe")]
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// Marker appended to output filenames
    #[arg(long, default_value = "compressed")]
    #[serde(default = "default_filename_suffix")]
    pub filename_suffix: String,

    /// Public site URL used to build download links in notifications
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,

    /// Mail relay endpoint receiving completion notices
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,

    /// Configuration file path (CLI arguments take precedence)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            processing_port: default_processing_port(),
            download_port: default_download_port(),
            workspace: default_workspace(),
            api_key: None,
            ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            permits: default_permits(),
            max_upload_mb: default_max_upload_mb(),
            status_cache_secs: default_status_cache_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            filename_suffix: default_filename_suffix(),
            frontend_url: None,
            notify_url: None,
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.processing_port == default_processing_port() {
            self.processing_port = file_config.processing_port;
        }
        if self.download_port == default_download_port() {
            self.download_port = file_config.download_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.ttl_secs == default_ttl_secs() {
            self.ttl_secs = file_config.ttl_secs;
        }
        if self.cleanup_interval_secs == default_cleanup_interval_secs() {
            self.cleanup_interval_secs = file_config.cleanup_interval_secs;
        }
        if self.permits == default_permits() {
            self.permits = file_config.permits;
        }
        if self.max_upload_mb == default_max_upload_mb() {
            self.max_upload_mb = file_config.max_upload_mb;
        }
        if self.status_cache_secs == default_status_cache_secs() {
            self.status_cache_secs = file_config.status_cache_secs;
        }
        if self.probe_timeout_secs == default_probe_timeout_secs() {
            self.probe_timeout_secs = file_config.probe_timeout_secs;
        }
        if self.ffmpeg_path == default_ffmpeg_path() {
            self.ffmpeg_path = file_config.ffmpeg_path;
        }
        if self.ffprobe_path == default_ffprobe_path() {
            self.ffprobe_path = file_config.ffprobe_path;
        }
        if self.filename_suffix == default_filename_suffix() {
            self.filename_suffix = file_config.filename_suffix;
        }

        // For Option fields, CLI takes precedence if Some
        if self.api_key.is_none() {
            self.api_key = file_config.api_key;
        }
        if self.frontend_url.is_none() {
            self.frontend_url = file_config.frontend_url;
        }
        if self.notify_url.is_none() {
            self.notify_url = file_config.notify_url;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.as_ref().map(|k| k.is_empty()).unwrap_or(true) {
            return Err(anyhow::anyhow!(
                "API key is required (--api-key, API_KEY or api_key in the config file)"
            ));
        }
        if self.ttl_secs == 0 {
            return Err(anyhow::anyhow!("ttl_secs must be greater than zero"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "cleanup_interval_secs must be greater than zero"
            ));
        }
        if self.permits == 0 {
            return Err(anyhow::anyhow!("permits must be greater than zero"));
        }
        if self.processing_port == self.download_port {
            return Err(anyhow::anyhow!(
                "processing_port and download_port must differ"
            ));
        }
        if self.filename_suffix.is_empty() || self.filename_suffix.contains(['/', '"', '\\']) {
            return Err(anyhow::anyhow!("Invalid filename_suffix"));
        }

        for (name, url) in [
            ("frontend_url", &self.frontend_url),
            ("notify_url", &self.notify_url),
        ] {
            if let Some(url) = url
                && !url.starts_with("http://")
                && !url.starts_with("https://")
            {
                return Err(anyhow::anyhow!(
                    "{name} must start with http:// or https://"
                ));
            }
        }

        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

// Default value functions
fn default_processing_port() -> u16 {
    5000
}

fn default_download_port() -> u16 {
    5001
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    30 * 60
}

fn default_permits() -> usize {
    num_cpus::get().max(1)
}

fn default_max_upload_mb() -> u64 {
    4000
}

fn default_status_cache_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_filename_suffix() -> String {
    "compressed".to_string()
}
