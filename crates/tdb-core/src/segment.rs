use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::Result;

/// Shortest time window worth re-cutting; below this keyframe spacing dominates.
const MIN_WINDOW_SECS: f64 = 1.0;

/// Slice of a source file covered by one part.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SegmentRange {
    /// Seconds into the media stream. With `to_end` the cut runs to the end
    /// of the stream and `duration` is only the planned length.
    Time {
        start: f64,
        duration: f64,
        to_end: bool,
    },
    /// Raw byte window, for files the media tool cannot cut.
    Bytes { offset: u64, len: u64 },
}

impl SegmentRange {
    /// Smaller time windows covering the same span, for a cut that came out
    /// at `actual_size` bytes against `threshold`. `None` when the range
    /// cannot shrink any further.
    pub fn subdivide(&self, actual_size: u64, threshold: u64) -> Option<Vec<SegmentRange>> {
        let SegmentRange::Time {
            start,
            duration,
            to_end,
        } = *self
        else {
            return None;
        };
        let pieces = part_count(actual_size, threshold) + 1;
        let each = duration / pieces as f64;
        if !each.is_finite() || each < MIN_WINDOW_SECS {
            return None;
        }
        Some(
            (0..pieces)
                .map(|i| SegmentRange::Time {
                    start: start + each * i as f64,
                    duration: each,
                    to_end: to_end && i + 1 == pieces,
                })
                .collect(),
        )
    }
}

/// Port for the external media segmentation tool (ffmpeg in production).
#[async_trait]
pub trait SegmenterPort: Send + Sync {
    /// Media duration in seconds, or `None` when the file is not cuttable by time.
    async fn probe_duration(&self, input: &Path) -> Result<Option<f64>>;

    /// Write one slice of `input` to `output`.
    async fn segment(&self, input: &Path, range: SegmentRange, output: &Path) -> Result<()>;
}

/// `ceil(size / threshold)`, never below one.
pub fn part_count(size: u64, threshold: u64) -> u64 {
    if threshold == 0 {
        return 1;
    }
    size.div_ceil(threshold).max(1)
}

/// Split into `part_count` equal time windows when a duration is known,
/// otherwise into `threshold`-sized byte windows.
pub fn plan_ranges(size: u64, threshold: u64, duration: Option<f64>) -> Vec<SegmentRange> {
    let parts = part_count(size, threshold);

    match duration.filter(|d| d.is_finite() && *d > 0.0) {
        Some(total) => {
            let each = total / parts as f64;
            (0..parts)
                .map(|i| SegmentRange::Time {
                    start: each * i as f64,
                    duration: each,
                    to_end: i + 1 == parts,
                })
                .collect()
        }
        None => (0..parts)
            .map(|i| {
                let offset = i * threshold;
                SegmentRange::Bytes {
                    offset,
                    len: threshold.min(size - offset),
                }
            })
            .collect(),
    }
}

/// `movie.mp4` part 2 -> `<dir>/movie.part002.mp4`.
pub fn part_path(dir: &Path, source: &Path, index: u64) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let name = match source.extension() {
        Some(ext) => format!("{stem}.part{index:03}.{}", ext.to_string_lossy()),
        None => format!("{stem}.part{index:03}"),
    };
    dir.join(name)
}
