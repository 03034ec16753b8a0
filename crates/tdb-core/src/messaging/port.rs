use async_trait::async_trait;

use crate::{
    domain::{ChatId, MemberStatus, MessageRef, UserId},
    messaging::types::{FileUpload, InlineKeyboard},
    Result,
};

/// Outbound messenger port.
///
/// Flood-control signals surface as [`crate::Error::RetryAfter`] from `edit_html`;
/// callers that edit in a loop own the backoff policy.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    /// Upload a local file; `upload.progress` is advanced as bytes leave the process.
    async fn send_file(&self, chat_id: ChatId, upload: FileUpload) -> Result<MessageRef>;

    async fn copy_message(&self, from: MessageRef, to: ChatId) -> Result<MessageRef>;

    async fn member_status(&self, chat_id: ChatId, user_id: UserId) -> Result<MemberStatus>;
}
