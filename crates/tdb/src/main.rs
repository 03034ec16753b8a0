use std::sync::Arc;

use tdb_aria2::{Aria2Client, GLOBAL_OPTIONS};
use tdb_core::config::Config;
use tdb_ffmpeg::FfmpegSegmenter;

#[tokio::main]
async fn main() -> Result<(), tdb_core::Error> {
    tdb_core::logging::init("tdb")?;

    let cfg = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return Err(e);
        }
    };

    let aria2 = Arc::new(Aria2Client::new(
        cfg.aria2_rpc_url(),
        cfg.aria2_secret.clone(),
    )?);
    match aria2.version().await {
        Ok(v) => tracing::info!(version = %v, endpoint = %cfg.aria2_rpc_url(), "aria2 reachable"),
        Err(e) => tracing::warn!(endpoint = %cfg.aria2_rpc_url(), "aria2 not reachable yet: {e}"),
    }
    if let Err(e) = aria2.configure_global(GLOBAL_OPTIONS).await {
        tracing::warn!("failed to apply aria2 global options: {e}");
    }

    let segmenter = Arc::new(FfmpegSegmenter::new(
        cfg.ffmpeg_path.clone(),
        cfg.ffprobe_path.clone(),
    ));

    tdb_telegram::router::run_polling(cfg, aria2, segmenter)
        .await
        .map_err(|e| tdb_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
