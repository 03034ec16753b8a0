//! The single, edited-in-place status message of a request.
//!
//! Rendering is pure; [`StatusNotifier`] owns the message and the edit
//! discipline (idempotent, throttled, one bounded retry on flood control).

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use tokio::time::{sleep, Instant};

use crate::{
    domain::MessageRef,
    download::DownloadJob,
    errors::Error,
    formatting::{escape_html, format_eta, format_size, progress_bar},
    messaging::port::MessagingPort,
};

const BAR_WIDTH: usize = 12;

pub fn render_queued(position_hint: &str) -> String {
    format!("⏳ <b>Queued</b>\n{}", escape_html(position_hint))
}

pub fn render_download(job: &DownloadJob) -> String {
    format!(
        "📥 <b>Downloading...</b>\n\
         🗂️ File: {name}\n\
         {bar} {percent:.2}%\n\
         ⬇️ {done} / {total}\n\
         🚀 Speed: {speed}/s\n\
         ⏳ ETA: {eta}\n\
         ⚙️ Status: {state}\n\n\
         🛑 Cancel: /cancel_{gid}",
        name = escape_html(job.display_name()),
        bar = progress_bar(job.fraction(), BAR_WIDTH),
        percent = job.percent(),
        done = format_size(job.downloaded_bytes),
        total = format_size(job.total_bytes),
        speed = format_size(job.transfer_rate),
        eta = format_eta(job.eta()),
        state = job.state.label(),
        gid = job.handle,
    )
}

/// Upload progress; `part` is `(index, count)` for multi-part deliveries.
pub fn render_upload(name: &str, sent: u64, total: u64, part: Option<(u64, u64)>) -> String {
    let fraction = if total == 0 {
        0.0
    } else {
        sent.min(total) as f64 / total as f64
    };
    let part_line = match part {
        Some((i, n)) => format!("🧩 Part {i}/{n}\n"),
        None => String::new(),
    };
    format!(
        "📤 <b>Uploading...</b>\n\
         🗂️ File: {name}\n\
         {part_line}\
         {bar} {percent:.2}%\n\
         ⬆️ {sent} / {total}",
        name = escape_html(name),
        bar = progress_bar(fraction, BAR_WIDTH),
        percent = fraction * 100.0,
        sent = format_size(sent.min(total)),
        total = format_size(total),
    )
}

pub fn render_splitting(name: &str, index: u64, count: u64) -> String {
    format!(
        "✂️ <b>Splitting...</b>\n🗂️ File: {}\n🧩 Part {index}/{count}",
        escape_html(name)
    )
}

pub fn render_complete(
    name: &str,
    size: u64,
    parts: u64,
    started: DateTime<Local>,
    elapsed: Duration,
) -> String {
    let parts_line = if parts > 1 {
        format!("\n🧩 Sent in {parts} parts")
    } else {
        String::new()
    };
    format!(
        "✅ <b>Completed</b>\n🗂️ File: {}\n📦 Size: {}{parts_line}\n⏰ {} → {} ({})",
        escape_html(name),
        format_size(size),
        started.format("%H:%M:%S"),
        Local::now().format("%H:%M:%S"),
        format_elapsed(elapsed),
    )
}

pub fn render_failed(reason: &str) -> String {
    format!("❌ <b>Failed</b>\n{}", escape_html(reason))
}

pub fn render_cancelled(name: &str) -> String {
    format!("🛑 <b>Cancelled</b>\n🗂️ File: {}", escape_html(name))
}

fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Owner of one status message.
pub struct StatusNotifier {
    messenger: Arc<dyn MessagingPort>,
    message: MessageRef,
    min_interval: Duration,
    last_rendered_text: Option<String>,
    last_update: Option<Instant>,
}

impl StatusNotifier {
    pub fn new(messenger: Arc<dyn MessagingPort>, message: MessageRef, min_interval: Duration) -> Self {
        Self {
            messenger,
            message,
            min_interval,
            last_rendered_text: None,
            last_update: None,
        }
    }

    pub fn last_rendered_text(&self) -> Option<&str> {
        self.last_rendered_text.as_deref()
    }

    /// Edit the message unless `text` is already shown. Returns whether an edit landed.
    ///
    /// Flood control is honored with one sleep-and-retry; the next scheduled
    /// update is the only further attempt. Other failures are logged and swallowed.
    pub async fn update(&mut self, text: &str) -> bool {
        if self.last_rendered_text.as_deref() == Some(text) {
            return false;
        }

        let outcome = match self.messenger.edit_html(self.message, text).await {
            Err(Error::RetryAfter(wait)) => {
                tracing::warn!("flood wait: sleeping for {}s", wait.as_secs());
                sleep(wait).await;
                self.messenger.edit_html(self.message, text).await
            }
            other => other,
        };

        match outcome {
            Ok(()) => {
                self.last_rendered_text = Some(text.to_string());
                self.last_update = Some(Instant::now());
                true
            }
            Err(e) => {
                tracing::error!("failed to update status message: {e}");
                false
            }
        }
    }

    pub async fn update_throttled(&mut self, text: &str) -> bool {
        self.update_throttled_at(text, Instant::now()).await
    }

    /// Like [`Self::update`], but at most one edit per `min_interval`.
    pub async fn update_throttled_at(&mut self, text: &str, now: Instant) -> bool {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.update(text).await
    }

    /// Terminal state: bypasses the throttle.
    pub async fn finish(&mut self, text: &str) -> bool {
        self.update(text).await
    }
}
