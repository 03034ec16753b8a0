//! Telegram update handlers.
//!
//! Commands are answered inline; link messages are handed to the pipeline on a
//! spawned task so the dispatcher keeps serving the chat while a job runs.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use tdb_core::{
    domain::ChatId,
    formatting::escape_html,
    messaging::types::InlineKeyboard,
};

use crate::router::AppState;

mod commands;
mod text;

const JOIN_REQUIRED: &str = "You must join my channel to use me.";

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    if text.starts_with('/') {
        return commands::handle_command(msg, state).await;
    }
    text::handle_text(msg, state).await
}

/// Reply with `html`, attaching the join button when an invite link is configured.
async fn reply_with_join_button(state: &AppState, chat_id: ChatId, html: &str) {
    let res = match &state.cfg.fsub_invite_url {
        Some(url) => {
            state
                .messenger
                .send_inline_keyboard(chat_id, html, InlineKeyboard::single("Join ❤️🚀", url))
                .await
        }
        None => state.messenger.send_html(chat_id, html).await,
    };
    if let Err(e) = res {
        tracing::warn!(chat = chat_id.0, "reply failed: {e}");
    }
}

async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    if let Err(e) = state.messenger.send_html(chat_id, html).await {
        tracing::warn!(chat = chat_id.0, "reply failed: {e}");
    }
}

fn mention(msg: &Message) -> String {
    msg.from()
        .map(|u| escape_html(&u.first_name))
        .unwrap_or_else(|| "there".to_string())
}
