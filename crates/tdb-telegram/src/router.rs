use std::{sync::Arc, time::Duration};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tdb_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use tdb_core::{
    config::Config, domain::ChatId, download::DownloadPort, membership::MembershipGate,
    messaging::port::MessagingPort, pipeline::Pipeline, segment::SegmenterPort,
};

use crate::handlers;
use crate::TelegramMessenger;

/// Uploads of multi-gigabyte parts must not hit the default 17s request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub messenger: Arc<dyn MessagingPort>,
    pub gate: MembershipGate,
}

fn build_bot(cfg: &Config) -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let mut bot = Bot::with_client(cfg.telegram_bot_token.clone(), client);
    if let Some(api) = &cfg.telegram_api_url {
        let url = url::Url::parse(api)
            .map_err(|e| anyhow::anyhow!("TELEGRAM_API_URL is not a valid URL: {e}"))?;
        bot = bot.set_api_url(url);
    }
    Ok(bot)
}

pub async fn run_polling(
    cfg: Arc<Config>,
    downloader: Arc<dyn DownloadPort>,
    segmenter: Arc<dyn SegmenterPort>,
) -> anyhow::Result<()> {
    let bot = build_bot(&cfg)?;

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "bot started"),
        Err(e) => tracing::warn!("get_me failed: {e}"),
    }
    tracing::info!(
        split_threshold = cfg.split_threshold,
        transport = ?cfg.upload_transport,
        max_concurrent = cfg.max_concurrent_downloads,
        "delivery settings"
    );

    // Throttle in front of Telegram; the adapter still retries a single RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        &cfg,
        messenger.clone(),
        downloader,
        segmenter,
    ));

    let state = Arc::new(AppState {
        gate: MembershipGate::new(messenger.clone(), ChatId(cfg.fsub_chat_id)),
        cfg,
        pipeline,
        messenger,
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    tracing::info!("dispatcher stopped");
    Ok(())
}
