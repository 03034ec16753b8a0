use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Largest part a bot pushes through a self-hosted Bot API server (~2 GB).
pub const BOT_SPLIT_SIZE: u64 = 2_093_796_556;

/// Largest file the public cloud Bot API accepts from a bot (50 MB).
pub const CLOUD_BOT_API_SPLIT_SIZE: u64 = 52_428_800;

/// Where uploads actually go; decides the split threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadTransport {
    /// `api.telegram.org`.
    CloudBotApi,
    /// A self-hosted Bot API server (`TELEGRAM_API_URL`).
    LocalBotApi,
}

impl UploadTransport {
    pub fn split_threshold(self) -> u64 {
        match self {
            Self::CloudBotApi => CLOUD_BOT_API_SPLIT_SIZE,
            Self::LocalBotApi => BOT_SPLIT_SIZE,
        }
    }
}

const MIN_STATUS_INTERVAL: Duration = Duration::from_secs(3);
const MAX_STATUS_INTERVAL: Duration = Duration::from_secs(15);

/// Typed configuration, read once at process start.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_api_url: Option<String>,
    pub upload_transport: UploadTransport,
    pub dump_chat_id: i64,
    pub fsub_chat_id: i64,
    pub fsub_invite_url: Option<String>,

    // aria2
    pub aria2_host: String,
    pub aria2_port: u16,
    pub aria2_secret: Option<String>,

    // Pipeline
    pub split_threshold: u64,
    pub max_concurrent_downloads: usize,
    pub poll_interval: Duration,
    pub status_interval: Duration,
    pub temp_dir: PathBuf,

    // Segmentation tool
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new("config.env"));
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("BOT_TOKEN").and_then(non_empty).ok_or_else(|| {
            Error::Config("BOT_TOKEN environment variable is required".to_string())
        })?;
        let dump_chat_id = required_i64("DUMP_CHAT_ID")?;
        let fsub_chat_id = required_i64("FSUB_ID")?;

        let telegram_api_url = env_str("TELEGRAM_API_URL").and_then(non_empty);
        let user_session = env_str("USER_SESSION_STRING").and_then(non_empty);
        let fsub_invite_url = env_str("FSUB_INVITE_URL").and_then(non_empty);

        let upload_transport = upload_transport_for(telegram_api_url.as_deref());
        let split_threshold = upload_transport.split_threshold();
        if user_session.is_some() {
            tracing::warn!(
                "USER_SESSION_STRING is set but uploads go through the bot; \
                 keeping the bot split size"
            );
        }
        if upload_transport == UploadTransport::CloudBotApi {
            tracing::warn!(
                "TELEGRAM_API_URL not set; the cloud Bot API caps uploads at 50 MB, \
                 larger files will be sent in many parts"
            );
        }

        let aria2_host = env_str("ARIA2_HOST")
            .and_then(non_empty)
            .unwrap_or_else(|| "http://localhost".to_string());
        let aria2_port = match env_str("ARIA2_PORT").and_then(non_empty) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("ARIA2_PORT is not a valid port: {raw}")))?,
            None => 6800,
        };
        let aria2_secret = env_str("ARIA2_SECRET").and_then(non_empty);

        let max_concurrent_downloads = env_usize("MAX_CONCURRENT_DOWNLOADS")
            .unwrap_or(3)
            .max(1);
        let poll_interval =
            Duration::from_secs(env_u64("POLL_INTERVAL_SECS").unwrap_or(3).max(1));
        let status_interval = clamp_status_interval(Duration::from_secs(
            env_u64("STATUS_UPDATE_INTERVAL_SECS").unwrap_or(5),
        ));

        let temp_dir =
            PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/terabox-bot".to_string()));
        fs::create_dir_all(&temp_dir)?;

        let ffmpeg_path = env_path("FFMPEG_PATH")
            .or_else(|| which_in_path("ffmpeg"))
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let ffprobe_path = env_path("FFPROBE_PATH")
            .or_else(|| which_in_path("ffprobe"))
            .unwrap_or_else(|| PathBuf::from("ffprobe"));

        Ok(Self {
            telegram_bot_token,
            telegram_api_url,
            upload_transport,
            dump_chat_id,
            fsub_chat_id,
            fsub_invite_url,
            aria2_host,
            aria2_port,
            aria2_secret,
            split_threshold,
            max_concurrent_downloads,
            poll_interval,
            status_interval,
            temp_dir,
            ffmpeg_path,
            ffprobe_path,
        })
    }

    /// `host:port/jsonrpc`, tolerating a trailing slash on the host.
    pub fn aria2_rpc_url(&self) -> String {
        format!(
            "{}:{}/jsonrpc",
            self.aria2_host.trim_end_matches('/'),
            self.aria2_port
        )
    }
}

pub fn upload_transport_for(telegram_api_url: Option<&str>) -> UploadTransport {
    match telegram_api_url {
        Some(url) if !url.trim().is_empty() => UploadTransport::LocalBotApi,
        _ => UploadTransport::CloudBotApi,
    }
}

fn clamp_status_interval(d: Duration) -> Duration {
    d.clamp(MIN_STATUS_INTERVAL, MAX_STATUS_INTERVAL)
}

fn required_i64(key: &str) -> Result<i64> {
    let raw = env_str(key)
        .and_then(non_empty)
        .ok_or_else(|| Error::Config(format!("{key} variable is missing")))?;
    parse_i64(key, &raw)
}

fn parse_i64(key: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| Error::Config(format!("{key} must be a numeric chat id, got {raw:?}")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
