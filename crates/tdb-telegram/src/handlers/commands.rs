use std::sync::Arc;

use teloxide::prelude::*;

use tdb_core::{
    domain::{ChatId, UserId},
    formatting::escape_html,
    pipeline::CancelOutcome,
};

use crate::router::AppState;

use super::{mention, reply, reply_with_join_button};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Start,
    Cancel(Option<String>),
    Unknown(String),
}

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn classify(text: &str) -> Command {
    let (cmd, rest) = parse_command(text);
    match cmd.as_str() {
        "start" => Command::Start,
        "cancel" => Command::Cancel(rest.split_whitespace().next().map(str::to_string)),
        // `/cancel_<gid>` is tappable from the status message.
        c if c.starts_with("cancel_") => {
            let id = c.trim_start_matches("cancel_");
            Command::Cancel((!id.is_empty()).then(|| id.to_string()))
        }
        _ => Command::Unknown(cmd),
    }
}

fn welcome_text(name: &str) -> String {
    format!(
        "Welcome, {name}.\n\n\
         🌟 I am a Terabox downloader bot.\n\
         Send me any Terabox link and I will download it and send it to you ✨."
    )
}

fn cancel_reply(outcome: CancelOutcome, id: &str) -> String {
    let id = escape_html(id);
    match outcome {
        CancelOutcome::Cancelled => format!("🛑 Cancelling download <code>{id}</code>..."),
        CancelOutcome::NotFound => format!("No active download with id <code>{id}</code>."),
        CancelOutcome::NotOwner => "You can only cancel your own downloads.".to_string(),
    }
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = ChatId(msg.chat.id.0);
    let Some(text) = msg.text() else {
        return Ok(());
    };

    match classify(text) {
        Command::Start => {
            reply_with_join_button(&state, chat_id, &welcome_text(&mention(&msg))).await;
        }
        Command::Cancel(None) => {
            reply(&state, chat_id, "Usage: <code>/cancel &lt;id&gt;</code>").await;
        }
        Command::Cancel(Some(id)) => {
            let Some(user) = msg.from() else {
                return Ok(());
            };
            let outcome = state.pipeline.cancel(&id, UserId(user.id.0 as i64));
            reply(&state, chat_id, &cancel_reply(outcome, &id)).await;
        }
        Command::Unknown(cmd) => {
            tracing::debug!(%cmd, "unknown command");
            reply(
                &state,
                chat_id,
                "Send me a Terabox link to download it, or /cancel &lt;id&gt; to stop a download.",
            )
            .await;
        }
    }

    Ok(())
}
