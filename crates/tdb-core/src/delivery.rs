//! Hand a finished download back to the user, splitting it when it exceeds
//! the upload ceiling of the configured transport.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::{ChatId, MessageRef},
    download::DownloadJob,
    errors::Error,
    formatting::{escape_html, format_size},
    messaging::{
        port::MessagingPort,
        types::{FileUpload, UploadProgress},
    },
    segment::{part_count, part_path, plan_ranges, SegmentRange, SegmenterPort},
    status::{render_splitting, render_upload, StatusNotifier},
    Result,
};

#[derive(Clone, Debug)]
pub struct DeliverySettings {
    pub split_threshold: u64,
    pub status_interval: Duration,
    pub temp_dir: PathBuf,
    /// Every delivered message is also copied here (best effort).
    pub storage_chat: Option<ChatId>,
}

impl From<&Config> for DeliverySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            split_threshold: cfg.split_threshold,
            status_interval: cfg.status_interval,
            temp_dir: cfg.temp_dir.clone(),
            storage_chat: Some(ChatId(cfg.dump_chat_id)),
        }
    }
}

#[derive(Debug)]
pub struct DeliveryResult {
    pub success: bool,
    pub error: Option<Error>,
    pub parts_sent: u64,
    pub size: u64,
}

impl DeliveryResult {
    fn ok(parts_sent: u64, size: u64) -> Self {
        Self {
            success: true,
            error: None,
            parts_sent,
            size,
        }
    }

    fn failed(error: Error, parts_sent: u64, size: u64) -> Self {
        Self {
            success: false,
            error: Some(error),
            parts_sent,
            size,
        }
    }
}

pub struct ArtifactDelivery {
    messenger: Arc<dyn MessagingPort>,
    segmenter: Arc<dyn SegmenterPort>,
    settings: DeliverySettings,
}

/// What one upload is about; borrowed for the duration of the upload loop.
struct PendingUpload<'a> {
    path: &'a Path,
    file_name: String,
    size: u64,
    part: Option<(u64, u64)>,
}

impl ArtifactDelivery {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        segmenter: Arc<dyn SegmenterPort>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            messenger,
            segmenter,
            settings,
        }
    }

    /// Upload the artifact of a completed job to `target`.
    ///
    /// Local files are removed only after the corresponding upload succeeded;
    /// on failure whatever is still on disk stays there.
    pub async fn deliver(
        &self,
        job: &DownloadJob,
        target: ChatId,
        notifier: &mut StatusNotifier,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let Some(source) = job.local_file_path.clone() else {
            return DeliveryResult::failed(
                Error::FileNotFound(PathBuf::from(job.display_name())),
                0,
                0,
            );
        };

        let size = match readable_size(&source).await {
            Ok(size) => size,
            Err(e) => return DeliveryResult::failed(e, 0, 0),
        };

        let name = file_name_of(&source, job.display_name());
        let parts = part_count(size, self.settings.split_threshold);
        tracing::info!(
            gid = %job.handle,
            file = %source.display(),
            size,
            parts,
            "delivering artifact"
        );

        if parts == 1 {
            let pending = PendingUpload {
                path: &source,
                file_name: name,
                size,
                part: None,
            };
            return match self.upload(&pending, target, notifier, cancel).await {
                Ok(_) => {
                    remove_quietly(&source).await;
                    DeliveryResult::ok(1, size)
                }
                Err(e) => DeliveryResult::failed(e, 0, size),
            };
        }

        let duration = match self.segmenter.probe_duration(&source).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(file = %source.display(), "duration probe failed, splitting by bytes: {e}");
                None
            }
        };

        let threshold = self.settings.split_threshold;
        let mut queue: VecDeque<SegmentRange> = plan_ranges(size, threshold, duration).into();
        let mut sent = 0u64;

        while let Some(range) = queue.pop_front() {
            let index = sent + 1;
            let count = index + queue.len() as u64;
            if cancel.is_cancelled() {
                return DeliveryResult::failed(Error::Cancelled, sent, size);
            }

            notifier.update(&render_splitting(&name, index, count)).await;
            let part_file = part_path(&self.settings.temp_dir, &source, index);
            if let Err(e) = self.cut(&source, range, &part_file, cancel).await {
                remove_quietly(&part_file).await;
                return DeliveryResult::failed(e, sent, size);
            }

            let part_size = match readable_size(&part_file).await {
                Ok(s) => s,
                Err(e) => return DeliveryResult::failed(e, sent, size),
            };
            // Stream-copy cuts land on keyframes, so a window can overshoot its share.
            if part_size > threshold {
                remove_quietly(&part_file).await;
                match range.subdivide(part_size, threshold) {
                    Some(smaller) => {
                        tracing::info!(
                            gid = %job.handle,
                            index,
                            part_size,
                            pieces = smaller.len(),
                            "part over the upload limit, cutting it finer"
                        );
                        for r in smaller.into_iter().rev() {
                            queue.push_front(r);
                        }
                        continue;
                    }
                    None => {
                        let e = Error::Segmentation(format!(
                            "part {index} is {part_size} bytes, above the {threshold} byte limit"
                        ));
                        return DeliveryResult::failed(e, sent, size);
                    }
                }
            }

            let pending = PendingUpload {
                path: &part_file,
                file_name: file_name_of(&part_file, &name),
                size: part_size,
                part: Some((index, count)),
            };
            if let Err(e) = self.upload(&pending, target, notifier, cancel).await {
                remove_quietly(&part_file).await;
                return DeliveryResult::failed(e, sent, size);
            }

            remove_quietly(&part_file).await;
            sent += 1;
        }

        remove_quietly(&source).await;
        DeliveryResult::ok(sent, size)
    }

    async fn cut(
        &self,
        source: &Path,
        range: SegmentRange,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            res = self.segmenter.segment(source, range, output) => res,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Upload one file while ticking progress into the status message.
    async fn upload(
        &self,
        pending: &PendingUpload<'_>,
        target: ChatId,
        notifier: &mut StatusNotifier,
        cancel: &CancellationToken,
    ) -> Result<MessageRef> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let progress = UploadProgress::new();
        let upload = FileUpload {
            path: pending.path.to_path_buf(),
            file_name: pending.file_name.clone(),
            caption: caption(&pending.file_name, pending.size, pending.part),
            size: pending.size,
            progress: progress.clone(),
        };

        // The transfer runs as its own task so status edits never stall it.
        let messenger = self.messenger.clone();
        let mut task = tokio::spawn(async move { messenger.send_file(target, upload).await });

        let mut ticker = tokio::time::interval(self.settings.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let sent = loop {
            tokio::select! {
                joined = &mut task => {
                    break joined.map_err(|e| Error::External(format!("upload task failed: {e}")))?;
                }
                _ = cancel.cancelled() => {
                    task.abort();
                    return Err(Error::Cancelled);
                }
                _ = ticker.tick() => {
                    let text = render_upload(
                        &pending.file_name,
                        progress.sent(),
                        pending.size,
                        pending.part,
                    );
                    notifier.update_throttled(&text).await;
                }
            }
        };
        let msg = sent?;

        if let Some(storage) = self.settings.storage_chat {
            if let Err(e) = self.messenger.copy_message(msg, storage).await {
                tracing::warn!(chat = storage.0, "failed to copy upload to storage chat: {e}");
            }
        }

        Ok(msg)
    }
}

fn caption(name: &str, size: u64, part: Option<(u64, u64)>) -> String {
    let mut out = format!("🗂️ <b>{}</b>\n📦 {}", escape_html(name), format_size(size));
    if let Some((i, n)) = part {
        out.push_str(&format!("\n🧩 Part {i}/{n}"));
    }
    out
}

fn file_name_of(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Size of a regular, non-empty file; anything else is "file not found".
async fn readable_size(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(md) if md.is_file() && md.len() > 0 => Ok(md.len()),
        _ => Err(Error::FileNotFound(path.to_path_buf())),
    }
}

pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(file = %path.display(), "removed local file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %path.display(), "failed to remove local file: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use crate::download::JobState;
    use crate::testing::{self, FakeMessenger, FakeSegmenter};

    fn settings(threshold: u64, temp: &Path) -> DeliverySettings {
        DeliverySettings {
            split_threshold: threshold,
            status_interval: Duration::from_secs(3),
            temp_dir: temp.to_path_buf(),
            storage_chat: Some(ChatId(-500)),
        }
    }

    fn status_msg() -> MessageRef {
        MessageRef {
            chat_id: ChatId(1),
            message_id: MessageId(99),
        }
    }

    fn completed_job(path: &Path) -> DownloadJob {
        let mut job = testing::job("gid1");
        job.state = JobState::Complete;
        job.local_file_path = Some(path.to_path_buf());
        job
    }

    #[tokio::test]
    async fn single_part_uploads_once_and_removes_file() {
        let dir = testing::tmp_dir("deliver-single");
        let file = dir.join("video.mp4");
        std::fs::write(&file, vec![7u8; 64]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let seg = Arc::new(FakeSegmenter::new(None));
        let d = ArtifactDelivery::new(fake.clone(), seg.clone(), settings(64, &dir));
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.parts_sent, 1);
        assert_eq!(fake.uploads(), vec!["video.mp4".to_string()]);
        assert_eq!(fake.copies().len(), 1);
        assert!(seg.calls().is_empty());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn failed_upload_keeps_the_file() {
        let dir = testing::tmp_dir("deliver-fail");
        let file = dir.join("a.bin");
        std::fs::write(&file, b"data").unwrap();

        let fake = Arc::new(FakeMessenger::new());
        fake.fail_uploads_from(0);
        let d = ArtifactDelivery::new(
            fake.clone(),
            Arc::new(FakeSegmenter::new(None)),
            settings(1024, &dir),
        );
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        assert!(!res.success);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn missing_or_empty_file_is_never_uploaded() {
        let dir = testing::tmp_dir("deliver-missing");
        let empty = dir.join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let d = ArtifactDelivery::new(
            fake.clone(),
            Arc::new(FakeSegmenter::new(None)),
            settings(1024, &dir),
        );
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));
        let cancel = CancellationToken::new();

        for path in [empty.clone(), dir.join("nope.mp4")] {
            let res = d
                .deliver(&completed_job(&path), ChatId(1), &mut n, &cancel)
                .await;
            assert!(matches!(res.error, Some(Error::FileNotFound(_))));
        }
        let mut no_path = testing::job("g");
        no_path.state = JobState::Complete;
        let res = d.deliver(&no_path, ChatId(1), &mut n, &cancel).await;
        assert!(matches!(res.error, Some(Error::FileNotFound(_))));

        assert!(fake.uploads().is_empty());
    }

    #[tokio::test]
    async fn oversized_file_is_split_uploaded_in_order_and_cleaned_up() {
        let dir = testing::tmp_dir("deliver-split");
        let file = dir.join("big.mkv");
        std::fs::write(&file, vec![1u8; 25]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let seg = Arc::new(FakeSegmenter::new(Some(90.0)));
        let d = ArtifactDelivery::new(fake.clone(), seg.clone(), settings(10, &dir));
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.parts_sent, 3);
        assert_eq!(
            fake.uploads(),
            vec![
                "big.part001.mkv".to_string(),
                "big.part002.mkv".to_string(),
                "big.part003.mkv".to_string()
            ]
        );
        assert_eq!(seg.calls().len(), 3);
        assert!(matches!(seg.calls()[1].1, SegmentRange::Time { start, .. } if start == 30.0));
        assert!(!file.exists());
        for i in 1..=3 {
            assert!(!part_path(&dir, &file, i).exists());
        }
    }

    #[tokio::test]
    async fn overshooting_part_is_recut_before_upload() {
        let dir = testing::tmp_dir("deliver-recut");
        let file = dir.join("big.mkv");
        std::fs::write(&file, vec![1u8; 25]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let seg = Arc::new(FakeSegmenter::new(Some(90.0)));
        // First 30s window comes out at 25 bytes against a 10 byte limit.
        seg.output_sizes(vec![25]);
        let d = ArtifactDelivery::new(fake.clone(), seg.clone(), settings(10, &dir));
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        assert!(res.success, "{:?}", res.error);
        // The oversized window became four 7.5s windows, followed by the two planned ones.
        assert_eq!(res.parts_sent, 6);
        assert_eq!(fake.uploads().len(), 6);
        assert!(fake.upload_sizes().iter().all(|s| *s <= 10));
        let calls = seg.calls();
        assert_eq!(calls.len(), 7);
        assert_eq!(
            calls[2].1,
            SegmentRange::Time {
                start: 7.5,
                duration: 7.5,
                to_end: false
            }
        );
        assert!(matches!(calls[6].1, SegmentRange::Time { to_end: true, .. }));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn part_that_never_fits_fails_without_uploading() {
        let dir = testing::tmp_dir("deliver-recut-fail");
        let file = dir.join("big.mkv");
        std::fs::write(&file, vec![1u8; 25]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let seg = Arc::new(FakeSegmenter::new(Some(90.0)));
        seg.output_sizes(vec![25; 16]);
        let d = ArtifactDelivery::new(fake.clone(), seg.clone(), settings(10, &dir));
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        // 30s -> 7.5s -> 1.875s; the next step would go below one second.
        assert!(matches!(res.error, Some(Error::Segmentation(_))));
        assert_eq!(seg.calls().len(), 3);
        assert!(fake.uploads().is_empty());
        assert!(file.exists());
        assert!(!part_path(&dir, &file, 1).exists());
    }

    #[tokio::test]
    async fn failure_mid_split_aborts_and_keeps_source() {
        let dir = testing::tmp_dir("deliver-split-fail");
        let file = dir.join("big.bin");
        std::fs::write(&file, vec![1u8; 25]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        fake.fail_uploads_from(1);
        let seg = Arc::new(FakeSegmenter::new(None));
        let d = ArtifactDelivery::new(fake.clone(), seg.clone(), settings(10, &dir));
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        assert!(!res.success);
        assert_eq!(res.parts_sent, 1);
        // Third part never cut.
        assert_eq!(seg.calls().len(), 2);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn segmentation_failure_aborts() {
        let dir = testing::tmp_dir("deliver-seg-fail");
        let file = dir.join("big.mp4");
        std::fs::write(&file, vec![1u8; 25]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let seg = Arc::new(FakeSegmenter::new(Some(60.0)));
        seg.fail_at(0);
        let d = ArtifactDelivery::new(fake.clone(), seg.clone(), settings(10, &dir));
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));

        let res = d
            .deliver(&completed_job(&file), ChatId(1), &mut n, &CancellationToken::new())
            .await;

        assert!(matches!(res.error, Some(Error::Segmentation(_))));
        assert!(fake.uploads().is_empty());
        assert!(file.exists());
    }

    #[tokio::test]
    async fn cancelled_before_delivery_uploads_nothing() {
        let dir = testing::tmp_dir("deliver-cancel");
        let file = dir.join("v.mp4");
        std::fs::write(&file, vec![1u8; 8]).unwrap();

        let fake = Arc::new(FakeMessenger::new());
        let d = ArtifactDelivery::new(
            fake.clone(),
            Arc::new(FakeSegmenter::new(None)),
            settings(1024, &dir),
        );
        let mut n = StatusNotifier::new(fake.clone(), status_msg(), Duration::from_secs(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = d.deliver(&completed_job(&file), ChatId(1), &mut n, &cancel).await;
        assert!(matches!(res.error, Some(Error::Cancelled)));
        assert!(fake.uploads().is_empty());
    }

    #[test]
    fn caption_lists_part() {
        assert!(caption("a<b>.mp4", 2048, Some((1, 2))).contains("a&lt;b&gt;.mp4"));
        assert!(caption("a", 2048, Some((1, 2))).contains("Part 1/2"));
        assert!(!caption("a", 2048, None).contains("Part"));
    }
}
