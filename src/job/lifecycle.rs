use crate::job::JobStore;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one sweep over the job tree and the upload area.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs_removed: usize,
    pub uploads_removed: usize,
    pub failures: usize,
}

/// Removes expired jobs and stale uploads.
///
/// Jobs whose status document is missing or unreadable are judged by the age of
/// their directory and kept for twice the TTL, so an encode still running is never
/// swept from under its orchestrator.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    store: JobStore,
    uploads_dir: PathBuf,
    ttl: Duration,
}

impl Lifecycle {
    pub fn new(store: JobStore, uploads_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            store,
            uploads_dir: uploads_dir.into(),
            ttl,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now()).await
    }

    pub async fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_jobs(now, &mut report).await;
        self.sweep_uploads(now, &mut report).await;

        if report != SweepReport::default() {
            info!(
                jobs_removed = report.jobs_removed,
                uploads_removed = report.uploads_removed,
                failures = report.failures,
                "Sweep finished"
            );
        } else {
            debug!("Sweep finished, nothing to remove");
        }
        report
    }

    /// Sweeps immediately, then once per `period`.
    pub fn start(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    async fn sweep_jobs(&self, now: SystemTime, report: &mut SweepReport) {
        let ids = match self.store.list_ids().await {
            Ok(ids) => ids,
            Err(error) => {
                warn!(root = ?self.store.root(), ?error, "Failed to list job directories");
                report.failures += 1;
                return;
            }
        };

        let now_ms = epoch_ms(now);
        for id in ids {
            let expired = match self.store.read_status(&id).await {
                Ok(Some(doc)) => doc.is_expired(now_ms, self.ttl),
                Ok(None) | Err(_) => {
                    let dir = self.store.job_dir(&id);
                    match tokio::fs::metadata(&dir).await {
                        Ok(metadata) => older_than(&metadata, now, self.ttl * 2),
                        Err(error) => {
                            warn!(job_id = %id, ?error, "Failed to stat job directory");
                            report.failures += 1;
                            continue;
                        }
                    }
                }
            };

            if !expired {
                continue;
            }

            match self.store.delete(&id).await {
                Ok(true) => {
                    debug!(job_id = %id, "Expired job removed");
                    report.jobs_removed += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(job_id = %id, ?error, "Failed to remove expired job");
                    report.failures += 1;
                }
            }
        }
    }

    async fn sweep_uploads(&self, now: SystemTime, report: &mut SweepReport) {
        let mut entries = match tokio::fs::read_dir(&self.uploads_dir).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(dir = ?self.uploads_dir, ?error, "Failed to list uploads");
                report.failures += 1;
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!(dir = ?self.uploads_dir, ?error, "Failed to read upload entry");
                    report.failures += 1;
                    break;
                }
            };

            let path = entry.path();
            let stale = match entry.metadata().await {
                Ok(metadata) => metadata.is_file() && older_than(&metadata, now, self.ttl),
                Err(error) => {
                    warn!(?path, ?error, "Failed to stat upload");
                    report.failures += 1;
                    continue;
                }
            };

            if stale {
                remove_upload(&path, report).await;
            }
        }
    }
}

async fn remove_upload(path: &Path, report: &mut SweepReport) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(?path, "Stale upload removed");
            report.uploads_removed += 1;
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            warn!(?path, ?error, "Failed to remove stale upload");
            report.failures += 1;
        }
    }
}

/// Birth time where the filesystem records it, modification time otherwise.
fn older_than(metadata: &Metadata, now: SystemTime, age: Duration) -> bool {
    let Ok(born) = metadata.created().or_else(|_| metadata.modified()) else {
        return false;
    };
    now.duration_since(born).is_ok_and(|elapsed| elapsed > age)
}

fn epoch_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
