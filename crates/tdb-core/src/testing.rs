//! In-memory fakes for the ports, shared by the unit tests of this crate.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::{Config, UploadTransport, BOT_SPLIT_SIZE},
    domain::{ChatId, JobHandle, MemberStatus, MessageId, MessageRef, UserId},
    download::{DownloadJob, DownloadPort, JobState, JobStatus},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{FileUpload, InlineKeyboard},
    },
    segment::{SegmentRange, SegmenterPort},
    Result,
};

pub fn config() -> Config {
    Config {
        telegram_bot_token: "x".to_string(),
        telegram_api_url: None,
        upload_transport: UploadTransport::LocalBotApi,
        dump_chat_id: -500,
        fsub_chat_id: -100,
        fsub_invite_url: None,
        aria2_host: "http://localhost".to_string(),
        aria2_port: 6800,
        aria2_secret: None,
        split_threshold: BOT_SPLIT_SIZE,
        max_concurrent_downloads: 3,
        poll_interval: Duration::from_secs(3),
        status_interval: Duration::from_secs(5),
        temp_dir: "/tmp".into(),
        ffmpeg_path: "ffmpeg".into(),
        ffprobe_path: "ffprobe".into(),
    }
}

pub fn job(gid: &str) -> DownloadJob {
    DownloadJob::new(
        "https://terabox.com/s/x".to_string(),
        "r".to_string(),
        JobHandle(gid.to_string()),
    )
}

pub fn status(state: JobState, total: u64, completed: u64, speed: u64) -> JobStatus {
    JobStatus {
        name: Some("file.mp4".to_string()),
        total_length: total,
        completed_length: completed,
        download_speed: speed,
        state,
        error_message: None,
        local_file_path: None,
    }
}

pub fn tmp_dir(prefix: &str) -> PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let dir = PathBuf::from(format!("/tmp/tdb-{prefix}-{pid}-{ts}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ============== Messenger ==============

#[derive(Default)]
pub struct FakeMessenger {
    next_id: Mutex<i32>,
    sends: Mutex<Vec<String>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    edit_attempts: Mutex<usize>,
    edit_failures: Mutex<VecDeque<Error>>,
    uploads: Mutex<Vec<String>>,
    upload_sizes: Mutex<Vec<u64>>,
    upload_attempts: Mutex<usize>,
    fail_uploads_from: Mutex<Option<usize>>,
    copies: Mutex<Vec<(MessageRef, ChatId)>>,
    member_status: Mutex<Option<MemberStatus>>,
    member_queries: Mutex<Vec<(ChatId, UserId)>>,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            member_status: Mutex::new(Some(MemberStatus::Member)),
            ..Default::default()
        }
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        MessageRef {
            chat_id,
            message_id: MessageId(id),
        }
    }

    pub fn sends(&self) -> Vec<String> {
        self.sends.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn edit_attempts(&self) -> usize {
        *self.edit_attempts.lock().unwrap()
    }

    pub fn fail_next_edits(&self, errors: Vec<Error>) {
        self.edit_failures.lock().unwrap().extend(errors);
    }

    /// File names of successful uploads, in order.
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    /// Sizes of successful uploads, in order.
    pub fn upload_sizes(&self) -> Vec<u64> {
        self.upload_sizes.lock().unwrap().clone()
    }

    /// Upload attempt `n` (0-based) and every later one fails.
    pub fn fail_uploads_from(&self, n: usize) {
        *self.fail_uploads_from.lock().unwrap() = Some(n);
    }

    pub fn copies(&self) -> Vec<(MessageRef, ChatId)> {
        self.copies.lock().unwrap().clone()
    }

    /// `None` makes the lookup fail.
    pub fn set_member_status(&self, status: Option<MemberStatus>) {
        *self.member_status.lock().unwrap() = status;
    }

    pub fn member_queries(&self) -> Vec<(ChatId, UserId)> {
        self.member_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.sends.lock().unwrap().push(html.to_string());
        Ok(self.alloc(chat_id))
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        *self.edit_attempts.lock().unwrap() += 1;
        if let Some(e) = self.edit_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.edits.lock().unwrap().push((msg, html.to_string()));
        Ok(())
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        _keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.sends.lock().unwrap().push(html.to_string());
        Ok(self.alloc(chat_id))
    }

    async fn send_file(&self, chat_id: ChatId, upload: FileUpload) -> Result<MessageRef> {
        let attempt = {
            let mut guard = self.upload_attempts.lock().unwrap();
            let n = *guard;
            *guard += 1;
            n
        };
        if self
            .fail_uploads_from
            .lock()
            .unwrap()
            .is_some_and(|from| attempt >= from)
        {
            return Err(Error::External("upload rejected".to_string()));
        }
        upload.progress.add(upload.size);
        self.upload_sizes.lock().unwrap().push(upload.size);
        self.uploads.lock().unwrap().push(upload.file_name);
        Ok(self.alloc(chat_id))
    }

    async fn copy_message(&self, from: MessageRef, to: ChatId) -> Result<MessageRef> {
        self.copies.lock().unwrap().push((from, to));
        Ok(self.alloc(to))
    }

    async fn member_status(&self, chat_id: ChatId, user_id: UserId) -> Result<MemberStatus> {
        self.member_queries.lock().unwrap().push((chat_id, user_id));
        self.member_status
            .lock()
            .unwrap()
            .ok_or_else(|| Error::External("chat not found".to_string()))
    }
}

// ============== Download manager ==============

#[derive(Default)]
pub struct FakeDownloader {
    next_gid: Mutex<u32>,
    submitted: Mutex<Vec<String>>,
    fail_submit: Mutex<bool>,
    panic_on_submit: Mutex<bool>,
    script: Mutex<VecDeque<Result<JobStatus>>>,
    fallback: Mutex<Option<JobStatus>>,
    status_calls: Mutex<usize>,
    removed: Mutex<Vec<JobHandle>>,
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn fail_submit(&self) {
        *self.fail_submit.lock().unwrap() = true;
    }

    pub fn panic_on_submit(&self) {
        *self.panic_on_submit.lock().unwrap() = true;
    }

    /// Queue one status response. Once the queue drains, the last `Ok` status repeats.
    pub fn push_status(&self, status: Result<JobStatus>) {
        self.script.lock().unwrap().push_back(status);
    }

    pub fn status_calls(&self) -> usize {
        *self.status_calls.lock().unwrap()
    }

    pub fn removed(&self) -> Vec<JobHandle> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadPort for FakeDownloader {
    async fn submit(&self, uri: &str) -> Result<JobHandle> {
        if *self.panic_on_submit.lock().unwrap() {
            panic!("download manager client crashed");
        }
        if *self.fail_submit.lock().unwrap() {
            return Err(Error::Rpc("connection refused".to_string()));
        }
        self.submitted.lock().unwrap().push(uri.to_string());
        let mut n = self.next_gid.lock().unwrap();
        *n += 1;
        Ok(JobHandle(format!("{:016x}", *n)))
    }

    async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
        *self.status_calls.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(s)) => {
                *self.fallback.lock().unwrap() = Some(s.clone());
                Ok(s)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self
                .fallback
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| status(JobState::Queued, 0, 0, 0))),
        }
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        self.removed.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

// ============== Segmenter ==============

#[derive(Default)]
pub struct FakeSegmenter {
    duration: Option<f64>,
    calls: Mutex<Vec<(PathBuf, SegmentRange)>>,
    fail_at: Mutex<Option<usize>>,
    output_sizes: Mutex<VecDeque<usize>>,
}

impl FakeSegmenter {
    pub fn new(duration: Option<f64>) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    /// Cut number `n` (0-based) exits non-zero.
    pub fn fail_at(&self, n: usize) {
        *self.fail_at.lock().unwrap() = Some(n);
    }

    /// Byte sizes for the next cuts; once drained every cut writes four bytes.
    pub fn output_sizes(&self, sizes: Vec<usize>) {
        self.output_sizes.lock().unwrap().extend(sizes);
    }

    pub fn calls(&self) -> Vec<(PathBuf, SegmentRange)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SegmenterPort for FakeSegmenter {
    async fn probe_duration(&self, _input: &Path) -> Result<Option<f64>> {
        Ok(self.duration)
    }

    async fn segment(&self, _input: &Path, range: SegmentRange, output: &Path) -> Result<()> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((output.to_path_buf(), range));
            calls.len() - 1
        };
        if *self.fail_at.lock().unwrap() == Some(n) {
            return Err(Error::Segmentation("ffmpeg exited with status 1".to_string()));
        }
        let size = self.output_sizes.lock().unwrap().pop_front().unwrap_or(4);
        tokio::fs::write(output, vec![b'p'; size]).await?;
        Ok(())
    }
}
