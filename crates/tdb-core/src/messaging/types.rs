use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Inline keyboard made of link buttons (e.g. "join channel").
#[derive(Clone, Debug)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<UrlButton>>,
}

#[derive(Clone, Debug)]
pub struct UrlButton {
    pub label: String,
    pub url: String,
}

impl InlineKeyboard {
    pub fn single(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            rows: vec![vec![UrlButton {
                label: label.into(),
                url: url.into(),
            }]],
        }
    }
}

/// Bytes handed to the transport so far; shared between uploader and status loop.
#[derive(Clone, Debug, Default)]
pub struct UploadProgress(Arc<AtomicU64>);

impl UploadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A local file to upload as a chat message.
#[derive(Clone, Debug)]
pub struct FileUpload {
    pub path: PathBuf,
    pub file_name: String,
    pub caption: String,
    pub size: u64,
    pub progress: UploadProgress,
}

impl FileUpload {
    /// Video containers the platform can stream inline.
    pub fn is_streamable_video(&self) -> bool {
        let lower = self.file_name.to_lowercase();
        [".mp4", ".mkv", ".mov", ".webm"]
            .iter()
            .any(|ext| lower.ends_with(ext))
    }
}
