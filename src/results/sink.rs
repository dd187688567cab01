//! File-backed Result Sink.
//!
//! Every record is written once. The file is staged under a hidden temp
//! name, synced, then hard-linked into place; linking fails if the target
//! exists, so two workers finishing the same job cannot clobber each other.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ResultError;

use super::record::{ResultRecord, FAILED_PREFIX};

/// Finished/failed counts of a result directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub finished: usize,
    pub failed: usize,
}

impl ResultSummary {
    pub fn total(&self) -> usize {
        self.finished + self.failed
    }
}

/// Directory of result records, one file per job.
#[derive(Debug, Clone)]
pub struct ResultSink {
    dir: PathBuf,
}

impl ResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the result directory if needed.
    pub async fn ensure_dir(&self) -> Result<(), ResultError> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub fn finished_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    pub fn failed_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}.json", FAILED_PREFIX, job_id))
    }

    /// Whether any record exists for the job, finished or failed.
    pub async fn exists(&self, job_id: &str) -> Result<bool, ResultError> {
        if fs::try_exists(self.finished_path(job_id)).await? {
            return Ok(true);
        }
        Ok(fs::try_exists(self.failed_path(job_id)).await?)
    }

    /// Reads the record for a job, if one exists.
    pub async fn read(&self, job_id: &str) -> Result<Option<ResultRecord>, ResultError> {
        for path in [self.finished_path(job_id), self.failed_path(job_id)] {
            match fs::read(&path).await {
                Ok(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Durably writes a record.
    ///
    /// # Errors
    ///
    /// `ResultError::AlreadyRecorded` if the job already has a record under
    /// either name.
    pub async fn write(&self, record: &ResultRecord) -> Result<PathBuf, ResultError> {
        if self.exists(&record.job_id).await? {
            return Err(ResultError::AlreadyRecorded(record.job_id.clone()));
        }

        self.ensure_dir().await?;

        let target = self.dir.join(record.file_name());
        let staging = self
            .dir
            .join(format!(".{}.{}.tmp", record.job_id, Uuid::new_v4().simple()));

        let bytes = serde_json::to_vec_pretty(record)?;
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        let linked = fs::hard_link(&staging, &target).await;
        if let Err(e) = fs::remove_file(&staging).await {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
        }

        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ResultError::AlreadyRecorded(record.job_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        self.sync_dir().await;
        debug!(job_id = %record.job_id, path = %target.display(), "Result recorded");
        Ok(target)
    }

    async fn sync_dir(&self) {
        match fs::File::open(&self.dir).await {
            Ok(dir) => {
                if let Err(e) = dir.sync_all().await {
                    debug!(error = %e, "Directory sync not supported");
                }
            }
            Err(e) => debug!(error = %e, "Could not open result directory for sync"),
        }
    }

    /// Whether the directory holds no entries at all. A missing directory is
    /// empty.
    pub async fn is_empty(&self) -> Result<bool, ResultError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        Ok(entries.next_entry().await?.is_none())
    }

    /// Counts finished and failed records.
    pub async fn summary(&self) -> Result<ResultSummary, ResultError> {
        let mut summary = ResultSummary::default();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(summary),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if name.starts_with(FAILED_PREFIX) {
                summary.failed += 1;
            } else {
                summary.finished += 1;
            }
        }

        Ok(summary)
    }
}
