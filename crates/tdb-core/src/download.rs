//! Download coordination: submit to the external download manager and
//! translate its status reports into [`DownloadJob`] snapshots.
//!
//! The coordinator never loops or retries by itself; the caller owns the
//! polling cadence (see [`crate::pipeline`]).

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{domain::JobHandle, errors::Error, links::rewrite_url, Result};

/// Lifecycle of a job as the bot sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Complete,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One status report from the download manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub name: Option<String>,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub state: JobState,
    pub error_message: Option<String>,
    pub local_file_path: Option<PathBuf>,
}

/// Port for the external download manager (aria2 in production).
#[async_trait]
pub trait DownloadPort: Send + Sync {
    async fn submit(&self, uri: &str) -> Result<JobHandle>;
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;
    async fn remove(&self, handle: &JobHandle) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct DownloadJob {
    pub source_url: String,
    pub rewritten_url: String,
    pub handle: JobHandle,
    pub name: Option<String>,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub transfer_rate: u64,
    pub state: JobState,
    pub error: Option<String>,
    pub local_file_path: Option<PathBuf>,
}

impl DownloadJob {
    pub(crate) fn new(source_url: String, rewritten_url: String, handle: JobHandle) -> Self {
        Self {
            source_url,
            rewritten_url,
            handle,
            name: None,
            total_bytes: 0,
            downloaded_bytes: 0,
            transfer_rate: 0,
            state: JobState::Queued,
            error: None,
            local_file_path: None,
        }
    }

    /// Fold a status report into the snapshot.
    pub fn apply(&mut self, status: JobStatus) {
        if status.name.is_some() {
            self.name = status.name;
        }
        if status.local_file_path.is_some() {
            self.local_file_path = status.local_file_path;
        }
        self.total_bytes = status.total_length;
        self.downloaded_bytes = if status.total_length > 0 {
            status.completed_length.min(status.total_length)
        } else {
            status.completed_length
        };
        self.transfer_rate = status.download_speed;
        self.state = status.state;
        self.error = status.error_message.filter(|m| !m.trim().is_empty());
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.state = JobState::Failed;
        self.transfer_rate = 0;
        self.error = Some(message.into());
    }

    /// Completed share in `[0, 1]`; 0 while the total size is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0)
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }

    /// Remaining time at the current rate; `None` when it cannot be estimated.
    pub fn eta(&self) -> Option<Duration> {
        if self.transfer_rate == 0 || self.total_bytes == 0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.downloaded_bytes);
        Some(Duration::from_secs(remaining / self.transfer_rate))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }
}

pub const SERVICE_UNREACHABLE: &str = "Download service is unreachable. Please try again later.";
pub const JOB_VANISHED: &str = "The download was removed from the download service.";

/// Thin submit/poll/cancel layer over a [`DownloadPort`].
#[derive(Clone)]
pub struct DownloadCoordinator {
    service: Arc<dyn DownloadPort>,
}

impl DownloadCoordinator {
    pub fn new(service: Arc<dyn DownloadPort>) -> Self {
        Self { service }
    }

    /// Rewrite the share link through the resolver and submit it. Returns as
    /// soon as the service has accepted the job.
    pub async fn start(&self, source_url: &str) -> Result<DownloadJob> {
        let rewritten = rewrite_url(source_url);
        let handle = self.service.submit(&rewritten).await?;
        tracing::info!(gid = %handle, url = source_url, "download submitted");
        Ok(DownloadJob::new(source_url.to_string(), rewritten, handle))
    }

    /// Refresh `job` from the service. Errors never escape: an unreachable
    /// service or an unknown handle leaves the job in the terminal `Failed` state.
    pub async fn poll(&self, job: &mut DownloadJob) {
        if job.state.is_terminal() {
            return;
        }
        match self.service.status(&job.handle).await {
            Ok(status) => job.apply(status),
            Err(Error::JobNotFound(gid)) => {
                tracing::warn!(%gid, "download vanished from service");
                job.fail(JOB_VANISHED);
            }
            Err(e) => {
                tracing::error!(gid = %job.handle, "status poll failed: {e}");
                job.fail(SERVICE_UNREACHABLE);
            }
        }
    }

    /// Ask the service to drop the job and mark it cancelled.
    pub async fn cancel(&self, job: &mut DownloadJob) {
        if let Err(e) = self.service.remove(&job.handle).await {
            tracing::warn!(gid = %job.handle, "failed to remove cancelled download: {e}");
        }
        job.state = JobState::Cancelled;
        job.transfer_rate = 0;
    }

    /// Best-effort removal of a finished/failed job so the daemon does not keep it around.
    pub async fn forget(&self, job: &DownloadJob) {
        if let Err(e) = self.service.remove(&job.handle).await {
            tracing::debug!(gid = %job.handle, "failed to purge download result: {e}");
        }
    }
}
