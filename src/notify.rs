use crate::job::JobStatus;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

const RELAY_TIMEOUT: Duration = Duration::from_secs(10);
const SUBJECT: &str = "Your compressed video is ready!";

/// Completion notice handed to the mail transport.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub job_id: String,
    pub filename: String,
    pub original_size: u64,
    pub new_size: u64,
    pub reduction_percentage: f64,
    pub compression_time: f64,
    pub download_url: String,
    pub available_hours: u64,
}

impl CompletionNotice {
    pub fn new(to: &str, doc: &JobStatus, frontend_url: Option<&str>, ttl: Duration) -> Self {
        let base = frontend_url.unwrap_or_default().trim_end_matches('/');
        let download_url = format!("{base}/download/{}", doc.id);
        let reduction = doc.reduction_percentage.unwrap_or_default();
        let available_hours = ttl.as_secs() / 3600;

        Self {
            to: to.to_string(),
            subject: SUBJECT.to_string(),
            text: format!(
                "Your video has been successfully compressed. We've reduced the size by \
                 {reduction:.2}%. Access your video here: {download_url} \
                 (available for the next {available_hours} hours)"
            ),
            job_id: doc.id.clone(),
            filename: doc.filename.clone(),
            original_size: doc.original_size,
            new_size: doc.new_size.unwrap_or_default(),
            reduction_percentage: reduction,
            compression_time: doc.compression_time.unwrap_or_default(),
            download_url,
            available_hours,
        }
    }
}

/// Delivers completion notices. Failures are reported, never retried.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notice: CompletionNotice) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Posts notices as JSON to a mail relay.
pub struct RelayNotifier {
    client: reqwest::Client,
    url: String,
}

impl RelayNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn send(&self, notice: CompletionNotice) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&notice)
            .timeout(RELAY_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(
                job_id = %notice.job_id,
                url = %self.url,
                status = %response.status(),
                "Mail relay returned non-success status"
            );
            anyhow::bail!("mail relay returned {}", response.status());
        }

        info!(job_id = %notice.job_id, url = %self.url, "Completion notice sent");
        Ok(())
    }
}

impl Notifier for RelayNotifier {
    fn notify(&self, notice: CompletionNotice) -> BoxFuture<'_, anyhow::Result<()>> {
        self.send(notice).boxed()
    }
}

/// Used when no relay is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: CompletionNotice) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            info!(
                job_id = %notice.job_id,
                download_url = %notice.download_url,
                "No mail relay configured, completion notice not sent"
            );
            Ok(())
        }
        .boxed()
    }
}

/// Sends the notice and swallows the outcome; the job stays completed either way.
pub async fn notify_best_effort(notifier: &dyn Notifier, notice: CompletionNotice) {
    let job_id = notice.job_id.clone();
    if let Err(error) = notifier.notify(notice).await {
        error!(%job_id, ?error, "Failed to send completion notice");
    }
}
