//! ffmpeg adapter (segmentation tool).
//!
//! Time ranges are cut with `ffmpeg -c copy` (no re-encode); byte ranges are
//! copied in-process for files ffprobe does not recognise as media.

use std::{
    ffi::OsString,
    io::SeekFrom,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    process::Command,
};

use tdb_core::{
    errors::Error,
    segment::{SegmentRange, SegmenterPort},
    Result,
};

const STDERR_TAIL_MAX_CHARS: usize = 2000;

#[derive(Clone, Debug)]
pub struct FfmpegSegmenter {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegSegmenter {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

fn probe_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(input.as_os_str().to_os_string());
    args
}

/// `duration: None` cuts through to the end of the stream.
fn cut_args(input: &Path, start: f64, duration: Option<f64>, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |s: &str| args.push(OsString::from(s));
    push("-hide_banner");
    push("-loglevel");
    push("error");
    push("-y");
    push("-ss");
    push(&format!("{start:.3}"));
    push("-i");
    args.push(input.as_os_str().to_os_string());
    if let Some(duration) = duration {
        args.push(OsString::from("-t"));
        args.push(OsString::from(format!("{duration:.3}")));
    }
    for s in [
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
    ] {
        args.push(OsString::from(s));
    }
    args.push(output.as_os_str().to_os_string());
    args
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let chars: Vec<char> = text.trim().chars().collect();
    let start = chars.len().saturating_sub(STDERR_TAIL_MAX_CHARS);
    chars[start..].iter().collect()
}

async fn copy_byte_range(input: &Path, offset: u64, len: u64, output: &Path) -> Result<()> {
    let mut src = tokio::fs::File::open(input)
        .await
        .map_err(|_| Error::FileNotFound(input.to_path_buf()))?;
    src.seek(SeekFrom::Start(offset)).await?;
    let mut dst = tokio::fs::File::create(output).await?;
    let copied = tokio::io::copy(&mut src.take(len), &mut dst).await?;
    if copied != len {
        return Err(Error::Segmentation(format!(
            "short read from {}: wanted {len} bytes at {offset}, got {copied}",
            input.display()
        )));
    }
    Ok(())
}

#[async_trait]
impl SegmenterPort for FfmpegSegmenter {
    async fn probe_duration(&self, input: &Path) -> Result<Option<f64>> {
        let out = Command::new(&self.ffprobe)
            .args(probe_args(input))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::External(format!("failed to run ffprobe: {e}")))?;

        if !out.status.success() {
            tracing::debug!(
                file = %input.display(),
                "ffprobe could not read media: {}",
                stderr_tail(&out.stderr)
            );
            return Ok(None);
        }
        Ok(parse_duration(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn segment(&self, input: &Path, range: SegmentRange, output: &Path) -> Result<()> {
        match range {
            SegmentRange::Bytes { offset, len } => copy_byte_range(input, offset, len, output).await,
            SegmentRange::Time {
                start,
                duration,
                to_end,
            } => {
                tracing::info!(
                    file = %input.display(),
                    start,
                    duration,
                    out = %output.display(),
                    "cutting part"
                );
                let out = Command::new(&self.ffmpeg)
                    .args(cut_args(input, start, (!to_end).then_some(duration), output))
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| Error::Segmentation(format!("failed to run ffmpeg: {e}")))?;

                if !out.status.success() {
                    return Err(Error::Segmentation(format!(
                        "ffmpeg exited with {}: {}",
                        out.status,
                        stderr_tail(&out.stderr)
                    )));
                }
                Ok(())
            }
        }
    }
}
