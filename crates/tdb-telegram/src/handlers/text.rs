use std::sync::Arc;

use teloxide::prelude::*;

use tdb_core::{
    domain::{ChatId, UserId},
    links::extract_link,
    pipeline::{LinkRequest, PipelineOutcome},
};

use crate::router::AppState;

use super::{reply, reply_with_join_button, JOIN_REQUIRED};

const NO_LINK: &str = "Please provide a valid Terabox link.";

pub async fn handle_text(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);

    if !state.gate.is_member(user_id).await {
        reply_with_join_button(&state, chat_id, JOIN_REQUIRED).await;
        return Ok(());
    }

    let Some(link) = extract_link(text) else {
        reply(&state, chat_id, NO_LINK).await;
        return Ok(());
    };

    let request = LinkRequest {
        chat_id,
        user_id,
        link,
    };
    tracing::info!(chat = chat_id.0, user = user_id.0, link = %request.link, "link received");

    let task = state.pipeline.clone().spawn_link(request);
    tokio::spawn(async move {
        match task.await {
            Ok(PipelineOutcome::Delivered { parts }) => {
                tracing::info!(chat = chat_id.0, parts, "request delivered");
            }
            Ok(PipelineOutcome::Failed(reason)) => {
                tracing::warn!(chat = chat_id.0, %reason, "request failed");
            }
            Ok(PipelineOutcome::Cancelled) => {
                tracing::info!(chat = chat_id.0, "request cancelled");
            }
            Err(e) => tracing::error!(chat = chat_id.0, "request task failed: {e}"),
        }
    });

    Ok(())
}
