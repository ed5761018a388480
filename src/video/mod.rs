//! Video source abstraction.
//!
//! Decoding is the job of whatever implements [`VideoSource`]; the pipeline
//! only asks for frames by index. [`ImageSequenceSource`] serves a directory
//! of pre-decoded frames, which is what the command-line tool consumes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use image::DynamicImage;
use serde::Serialize;

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoInfo {
    pub frame_count: u64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    pub fn duration(&self) -> Duration {
        frame_time(self.frame_count, self.frame_rate)
    }
}

/// Random-access frame provider shared by all extraction workers.
pub trait VideoSource: Send + Sync {
    fn frame_count(&self) -> u64;
    fn frame_rate(&self) -> f64;
    fn resolution(&self) -> (u32, u32);
    fn get_frame(&self, index: u64) -> Result<DynamicImage, DecodeError>;

    fn info(&self) -> VideoInfo {
        let (width, height) = self.resolution();
        VideoInfo {
            frame_count: self.frame_count(),
            frame_rate: self.frame_rate(),
            width,
            height,
        }
    }
}

/// Maps sampled frame indices to timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameClock {
    pub frame_rate: f64,
    /// Distance between sampled frames.
    pub step: u64,
    /// Exclusive upper bound of the sampled range.
    pub stop: u64,
}

impl FrameClock {
    pub fn new(frame_rate: f64, step: u64, stop: u64) -> Self {
        Self {
            frame_rate,
            step: step.max(1),
            stop,
        }
    }

    pub fn timestamp(&self, frame_index: u64) -> Duration {
        frame_time(frame_index, self.frame_rate)
    }

    /// End of the interval represented by the sampled frame `frame_index`:
    /// the next sampled frame, clamped to the range end.
    pub fn end_after(&self, frame_index: u64) -> Duration {
        let next = frame_index.saturating_add(self.step);
        let bounded = if self.stop > frame_index {
            next.min(self.stop)
        } else {
            next
        };
        frame_time(bounded, self.frame_rate)
    }
}

fn frame_time(frame_index: u64, frame_rate: f64) -> Duration {
    if frame_rate > 0.0 && frame_rate.is_finite() {
        Duration::from_nanos((frame_index as f64 * 1e9 / frame_rate).round() as u64)
    } else {
        Duration::ZERO
    }
}

const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// A directory of numbered frame images, one file per frame, sorted by name.
#[derive(Debug, Clone)]
pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
    frame_rate: f64,
    width: u32,
    height: u32,
}

impl ImageSequenceSource {
    pub fn open(directory: &Path, frame_rate: f64) -> Result<Self> {
        if !directory.is_dir() {
            bail!("Frame directory not found: {}", directory.display());
        }
        let mut frames = Vec::new();
        for ext in FRAME_EXTENSIONS {
            let pattern = directory.join(format!("*.{ext}"));
            let pattern = pattern.to_string_lossy();
            let matches = glob::glob(&pattern)
                .with_context(|| format!("Invalid glob pattern: {pattern}"))?;
            for entry in matches {
                let path = entry?;
                if path.is_file() {
                    frames.push(path);
                }
            }
        }
        frames.sort();
        frames.dedup();

        let Some(first) = frames.first() else {
            bail!("No frame images found in {}", directory.display());
        };
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("Failed to read frame header: {}", first.display()))?;

        Ok(Self {
            frames,
            frame_rate,
            width,
            height,
        })
    }
}

impl VideoSource for ImageSequenceSource {
    fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn get_frame(&self, index: u64) -> Result<DynamicImage, DecodeError> {
        let path = usize::try_from(index)
            .ok()
            .and_then(|i| self.frames.get(i))
            .ok_or_else(|| DecodeError::new(index, "frame index out of range"))?;
        image::open(path).map_err(|err| DecodeError::new(index, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn clock_end_is_bounded_by_range() {
        let clock = FrameClock::new(30.0, 2, 100);
        assert_eq!(clock.timestamp(30), Duration::from_secs(1));
        assert_eq!(clock.end_after(58), Duration::from_secs(2));
        assert_eq!(clock.end_after(99), Duration::from_secs_f64(100.0 / 30.0));
    }

    #[test]
    fn image_sequence_is_sorted_and_sized() {
        let temp = tempfile::tempdir().unwrap();
        for (name, shade) in [("0002.png", 20u8), ("0000.png", 0), ("0001.png", 10)] {
            let image: ImageBuffer<Rgb<u8>, Vec<u8>> =
                ImageBuffer::from_pixel(8, 6, Rgb([shade, shade, shade]));
            image.save(temp.path().join(name)).unwrap();
        }
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let source = ImageSequenceSource::open(temp.path(), 25.0).unwrap();
        assert_eq!(source.frame_count(), 3);
        assert_eq!(source.resolution(), (8, 6));
        let frame = source.get_frame(1).unwrap().to_rgb8();
        assert_eq!(frame.get_pixel(0, 0), &Rgb([10, 10, 10]));
        assert!(source.get_frame(3).is_err());
    }
}
