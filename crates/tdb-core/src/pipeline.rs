//! Per-request orchestration: slot → submit → poll → deliver → cleanup.
//!
//! Each request runs as one task that exclusively owns its job snapshot and
//! status message. The only shared state is the slot semaphore and the
//! registry of cancellable jobs.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Local;
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    delivery::{remove_quietly, ArtifactDelivery, DeliverySettings},
    domain::{ChatId, JobHandle, MessageRef, UserId},
    download::{DownloadCoordinator, DownloadJob, DownloadPort, JobState, SERVICE_UNREACHABLE},
    errors::Error,
    messaging::port::MessagingPort,
    segment::SegmenterPort,
    status::{
        render_cancelled, render_complete, render_download, render_failed, render_queued,
        StatusNotifier,
    },
};

const GENERIC_FAILURE: &str = "Something went wrong while processing your link. Please try again.";

#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub status_interval: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent_downloads,
            poll_interval: cfg.poll_interval,
            status_interval: cfg.status_interval,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinkRequest {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub link: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Delivered { parts: u64 },
    Failed(String),
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    NotOwner,
}

struct ActiveJob {
    owner: UserId,
    cancel: CancellationToken,
}

/// Jobs that can currently be cancelled, keyed by download handle.
#[derive(Default)]
struct ActiveJobs {
    inner: Mutex<HashMap<String, ActiveJob>>,
}

impl ActiveJobs {
    fn register(&self, handle: &JobHandle, owner: UserId) -> ActiveEntry<'_> {
        let cancel = CancellationToken::new();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(
                handle.0.clone(),
                ActiveJob {
                    owner,
                    cancel: cancel.clone(),
                },
            );
        }
        ActiveEntry {
            jobs: self,
            key: handle.0.clone(),
            cancel,
        }
    }

    fn cancel(&self, handle: &str, requester: UserId) -> CancelOutcome {
        let Ok(map) = self.inner.lock() else {
            return CancelOutcome::NotFound;
        };
        match map.get(handle) {
            None => CancelOutcome::NotFound,
            Some(job) if job.owner != requester => CancelOutcome::NotOwner,
            Some(job) => {
                job.cancel.cancel();
                CancelOutcome::Cancelled
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Registry membership for the lifetime of one request.
struct ActiveEntry<'a> {
    jobs: &'a ActiveJobs,
    key: String,
    cancel: CancellationToken,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.jobs.inner.lock() {
            map.remove(&self.key);
        }
    }
}

enum DownloadEnd {
    Complete,
    Failed(String),
    Cancelled,
}

pub struct Pipeline {
    messenger: Arc<dyn MessagingPort>,
    coordinator: DownloadCoordinator,
    delivery: ArtifactDelivery,
    slots: Arc<Semaphore>,
    active: ActiveJobs,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        cfg: &Config,
        messenger: Arc<dyn MessagingPort>,
        downloader: Arc<dyn DownloadPort>,
        segmenter: Arc<dyn SegmenterPort>,
    ) -> Self {
        Self::with_settings(
            PipelineSettings::from(cfg),
            DeliverySettings::from(cfg),
            messenger,
            downloader,
            segmenter,
        )
    }

    pub fn with_settings(
        settings: PipelineSettings,
        delivery: DeliverySettings,
        messenger: Arc<dyn MessagingPort>,
        downloader: Arc<dyn DownloadPort>,
        segmenter: Arc<dyn SegmenterPort>,
    ) -> Self {
        Self {
            coordinator: DownloadCoordinator::new(downloader),
            delivery: ArtifactDelivery::new(messenger.clone(), segmenter, delivery),
            slots: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            active: ActiveJobs::default(),
            messenger,
            settings,
        }
    }

    /// Number of jobs currently submitted to the download manager.
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Request cancellation of a running job. Only the user who submitted it may cancel.
    pub fn cancel(&self, handle: &str, requester: UserId) -> CancelOutcome {
        let outcome = self.active.cancel(handle, requester);
        tracing::info!(gid = handle, user = requester.0, ?outcome, "cancel requested");
        outcome
    }

    /// Run one request on a background task.
    ///
    /// The request body runs as a nested task; if it panics, the status
    /// message still ends on the generic failure text.
    pub fn spawn_link(self: Arc<Self>, req: LinkRequest) -> JoinHandle<PipelineOutcome> {
        tokio::spawn(async move {
            let chat_id = req.chat_id;
            let Some(status) = self.open_status(chat_id).await else {
                return PipelineOutcome::Failed(GENERIC_FAILURE.to_string());
            };

            let inner = self.clone();
            match tokio::spawn(async move { inner.process(req, status).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(chat = chat_id.0, "request task died: {e}");
                    let mut notifier = StatusNotifier::new(
                        self.messenger.clone(),
                        status,
                        self.settings.status_interval,
                    );
                    self.fail(&mut notifier, GENERIC_FAILURE).await
                }
            }
        })
    }

    /// Run one request end to end. Never panics on external failures; every
    /// outcome is reflected in the request's status message.
    pub async fn handle_link(&self, req: LinkRequest) -> PipelineOutcome {
        match self.open_status(req.chat_id).await {
            Some(status) => self.process(req, status).await,
            None => PipelineOutcome::Failed(GENERIC_FAILURE.to_string()),
        }
    }

    async fn open_status(&self, chat_id: ChatId) -> Option<MessageRef> {
        match self
            .messenger
            .send_html(chat_id, "🔎 <b>Processing your link...</b>")
            .await
        {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::error!(chat = chat_id.0, "failed to send status message: {e}");
                None
            }
        }
    }

    async fn process(&self, req: LinkRequest, status: MessageRef) -> PipelineOutcome {
        let mut notifier =
            StatusNotifier::new(self.messenger.clone(), status, self.settings.status_interval);

        if self.slots.available_permits() == 0 {
            notifier
                .update(&render_queued("Waiting for a free download slot..."))
                .await;
        }
        let Ok(_permit) = self.slots.clone().acquire_owned().await else {
            return self.fail(&mut notifier, GENERIC_FAILURE).await;
        };

        let mut job = match self.coordinator.start(&req.link).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(url = %req.link, "submit failed: {e}");
                return self.fail(&mut notifier, SERVICE_UNREACHABLE).await;
            }
        };

        let entry = self.active.register(&job.handle, req.user_id);
        let started_at = Local::now();
        let started = Instant::now();

        match self.wait_for_download(&mut job, &mut notifier, &entry.cancel).await {
            DownloadEnd::Complete => {}
            DownloadEnd::Failed(reason) => {
                self.coordinator.forget(&job).await;
                return self.fail(&mut notifier, &reason).await;
            }
            DownloadEnd::Cancelled => return self.cancelled(&mut job, &mut notifier).await,
        }

        let result = self
            .delivery
            .deliver(&job, req.chat_id, &mut notifier, &entry.cancel)
            .await;

        match result.error {
            None => {
                self.coordinator.forget(&job).await;
                notifier
                    .finish(&render_complete(
                        job.display_name(),
                        result.size,
                        result.parts_sent,
                        started_at,
                        started.elapsed(),
                    ))
                    .await;
                tracing::info!(gid = %job.handle, parts = result.parts_sent, "delivered");
                PipelineOutcome::Delivered {
                    parts: result.parts_sent,
                }
            }
            Some(Error::Cancelled) => self.cancelled(&mut job, &mut notifier).await,
            Some(e) => {
                tracing::error!(gid = %job.handle, "delivery failed: {e}");
                self.coordinator.forget(&job).await;
                self.fail(&mut notifier, &delivery_failure_message(&e)).await
            }
        }
    }

    async fn wait_for_download(
        &self,
        job: &mut DownloadJob,
        notifier: &mut StatusNotifier,
        cancel: &CancellationToken,
    ) -> DownloadEnd {
        loop {
            if cancel.is_cancelled() {
                return DownloadEnd::Cancelled;
            }

            self.coordinator.poll(job).await;
            match job.state {
                JobState::Complete => return DownloadEnd::Complete,
                JobState::Failed => {
                    return DownloadEnd::Failed(
                        job.error
                            .clone()
                            .unwrap_or_else(|| "The download failed.".to_string()),
                    )
                }
                JobState::Cancelled => return DownloadEnd::Cancelled,
                JobState::Queued | JobState::Active => {
                    notifier.update_throttled(&render_download(job)).await;
                }
            }

            tokio::select! {
                _ = sleep(self.settings.poll_interval) => {}
                _ = cancel.cancelled() => return DownloadEnd::Cancelled,
            }
        }
    }

    async fn fail(&self, notifier: &mut StatusNotifier, reason: &str) -> PipelineOutcome {
        notifier.finish(&render_failed(reason)).await;
        PipelineOutcome::Failed(reason.to_string())
    }

    async fn cancelled(
        &self,
        job: &mut DownloadJob,
        notifier: &mut StatusNotifier,
    ) -> PipelineOutcome {
        self.coordinator.cancel(job).await;
        if let Some(path) = &job.local_file_path {
            remove_quietly(path).await;
            remove_quietly(&control_file(path)).await;
        }
        notifier.finish(&render_cancelled(job.display_name())).await;
        PipelineOutcome::Cancelled
    }
}

/// aria2 keeps resume state next to the payload as `<file>.aria2`.
fn control_file(path: &std::path::Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".aria2");
    PathBuf::from(s)
}

fn delivery_failure_message(e: &Error) -> String {
    match e {
        Error::FileNotFound(_) => "File not found after download.".to_string(),
        Error::Segmentation(_) => "Failed to split the file into parts.".to_string(),
        _ => "Failed to upload the file. Please try again later.".to_string(),
    }
}
