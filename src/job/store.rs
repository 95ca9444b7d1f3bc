use crate::error::StoreError;
use crate::job::{JobStatus, STATUS_FILE};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// One directory per job under the videos root.
///
/// A job directory is written by a single orchestrator task and read-only afterwards,
/// so the store needs no locking. Deleting a missing job is not an error.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn file_path(&self, id: &str, filename: &str) -> PathBuf {
        self.job_dir(id).join(filename)
    }

    fn status_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(STATUS_FILE)
    }

    /// Creates the job directory. Fails if the id is already taken.
    pub async fn create(&self, id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.job_dir(id);
        tokio::fs::create_dir(&dir).await?;
        debug!(job_id = id, ?dir, "Job directory created");
        Ok(dir)
    }

    /// Replaces the status document atomically: temp file, flush, rename.
    pub async fn write_status(&self, id: &str, doc: &JobStatus) -> Result<(), StoreError> {
        let content = serde_json::to_vec(doc)?;
        let final_path = self.status_path(id);
        let temp_path = self
            .job_dir(id)
            .join(format!(".{STATUS_FILE}.{:016x}.tmp", rand::random::<u64>()));

        let write = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &final_path).await
        };

        if let Err(error) = write.await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        debug!(job_id = id, path = ?final_path, "Status document written");
        Ok(())
    }

    /// `Ok(None)` when the job has no status document yet (or never existed).
    pub async fn read_status(&self, id: &str) -> Result<Option<JobStatus>, StoreError> {
        let content = match tokio::fs::read(self.status_path(id)).await {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Ids of every job directory, in no particular order.
    pub async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => {
                    ids.push(entry.file_name().to_string_lossy().into_owned());
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(path = ?entry.path(), ?error, "Failed to read entry type");
                }
            }
        }
        Ok(ids)
    }

    /// Removes the whole job directory. Returns whether anything was deleted.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_dir_all(self.job_dir(id)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
