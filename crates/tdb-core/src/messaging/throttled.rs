use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MemberStatus, MessageRef, UserId},
    messaging::{
        port::MessagingPort,
        types::{FileUpload, InlineKeyboard},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Spacing between any two outbound calls (bot-wide flood control).
    pub global_min_interval: Duration,
    /// Spacing between calls that post into the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Next free send slot on one lane.
#[derive(Debug)]
struct Lane {
    interval: Duration,
    next_free: Instant,
}

impl Lane {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_free: now,
        }
    }

    /// Claim the next slot; returns how long the caller must wait for it.
    fn claim(&mut self, now: Instant) -> Duration {
        let slot = self.next_free.max(now);
        self.next_free = slot + self.interval;
        slot.saturating_duration_since(now)
    }

    /// An idle lane behaves exactly like a fresh one, so it can be dropped.
    fn is_idle(&self, now: Instant) -> bool {
        self.next_free <= now
    }
}

/// One lane per chat that posted recently; idle lanes are swept when a new chat shows up.
#[derive(Debug)]
struct ChatLanes {
    interval: Duration,
    lanes: HashMap<i64, Lane>,
}

impl ChatLanes {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            lanes: HashMap::new(),
        }
    }

    fn claim(&mut self, chat_id: i64, now: Instant) -> Duration {
        if !self.lanes.contains_key(&chat_id) {
            self.lanes.retain(|_, lane| !lane.is_idle(now));
        }
        let interval = self.interval;
        self.lanes
            .entry(chat_id)
            .or_insert_with(|| Lane::new(interval, now))
            .claim(now)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lanes.len()
    }
}

/// MessagingPort decorator that spaces outbound calls.
///
/// Reduces, but does not eliminate, Telegram 429s while many status messages
/// are being edited at once. Uploads and membership lookups only take the
/// global slot; they are not chat messages from the platform's point of view.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    global: Mutex<Lane>,
    chats: Mutex<ChatLanes>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            global: Mutex::new(Lane::new(cfg.global_min_interval, Instant::now())),
            chats: Mutex::new(ChatLanes::new(cfg.per_chat_min_interval)),
        }
    }

    async fn throttle_chat(&self, chat_id: ChatId) {
        let now = Instant::now();
        let global_wait = self.global.lock().await.claim(now);
        let chat_wait = self.chats.lock().await.claim(chat_id.0, now);
        pause(global_wait.max(chat_wait)).await;
    }

    async fn throttle_global(&self) {
        let wait = self.global.lock().await.claim(Instant::now());
        pause(wait).await;
    }
}

async fn pause(wait: Duration) {
    if !wait.is_zero() {
        sleep(wait).await;
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.throttle_chat(msg.chat_id).await;
        self.inner.edit_html(msg, html).await
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_inline_keyboard(chat_id, html, keyboard).await
    }

    async fn send_file(&self, chat_id: ChatId, upload: FileUpload) -> Result<MessageRef> {
        self.throttle_global().await;
        self.inner.send_file(chat_id, upload).await
    }

    async fn copy_message(&self, from: MessageRef, to: ChatId) -> Result<MessageRef> {
        self.throttle_chat(to).await;
        self.inner.copy_message(from, to).await
    }

    async fn member_status(&self, chat_id: ChatId, user_id: UserId) -> Result<MemberStatus> {
        self.throttle_global().await;
        self.inner.member_status(chat_id, user_id).await
    }
}
