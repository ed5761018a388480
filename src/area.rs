//! Subtitle area type and the locator that infers it from sampled frames.

use std::fmt;
use std::str::FromStr;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{AreaFallback, DetectionConfig};
use crate::error::{ExtractError, FailureKind, FailureRecord};
use crate::ocr::{DetectOptions, OcrEngine, TextBox};
use crate::progress::{CancellationToken, ProgressHandle, Stage};
use crate::video::VideoSource;

/// Fraction of the frame height where the default lower band starts.
const LOWER_BAND_START: f64 = 0.75;

/// Pixel rectangle cropped from every frame. `x1 < x2` and `y1 < y2` hold
/// for every value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "RawArea", into = "RawArea")]
pub struct SubtitleArea {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

#[derive(Clone, Copy, Deserialize, Serialize)]
struct RawArea {
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
}

impl TryFrom<RawArea> for SubtitleArea {
    type Error = String;

    fn try_from(raw: RawArea) -> Result<Self, Self::Error> {
        SubtitleArea::new(raw.x1, raw.y1, raw.x2, raw.y2)
    }
}

impl From<SubtitleArea> for RawArea {
    fn from(area: SubtitleArea) -> Self {
        RawArea {
            x1: area.x1,
            y1: area.y1,
            x2: area.x2,
            y2: area.y2,
        }
    }
}

impl SubtitleArea {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Self, String> {
        if x1 >= x2 || y1 >= y2 {
            return Err(format!(
                "invalid subtitle area ({x1}, {y1}, {x2}, {y2}): expected x1 < x2 and y1 < y2"
            ));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Lower quarter of a `width` x `height` frame.
    pub fn lower_band(width: u32, height: u32) -> Option<Self> {
        let y1 = (f64::from(height) * LOWER_BAND_START) as u32;
        Self::new(0, y1, width, height).ok()
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn contains(&self, other: &SubtitleArea) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x2 <= width && self.y2 <= height
    }

    pub fn union(&self, other: &SubtitleArea) -> SubtitleArea {
        SubtitleArea {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Moves the area by the origin of the region it was measured in.
    pub fn offset(&self, dx: u32, dy: u32) -> SubtitleArea {
        SubtitleArea {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    /// Widens the area horizontally to at least `[w·(1−p), w·p]` and pads it
    /// vertically by `y_padding` pixels, staying inside the frame.
    pub fn padded(&self, width: u32, height: u32, x_rel_padding: f64, y_padding: u32) -> SubtitleArea {
        let span_start = (f64::from(width) * (1.0 - x_rel_padding)).round() as u32;
        let span_end = (f64::from(width) * x_rel_padding).round() as u32;
        let x1 = self.x1.min(span_start);
        let x2 = self.x2.max(span_end).min(width).max(x1 + 1);
        let y1 = self.y1.saturating_sub(y_padding);
        let y2 = self.y2.saturating_add(y_padding).min(height).max(y1 + 1);
        SubtitleArea { x1, y1, x2, y2 }
    }

    /// Crops `image` to this area, intersected with the image bounds.
    pub fn crop(&self, image: &DynamicImage) -> DynamicImage {
        let x2 = self.x2.min(image.width());
        let y2 = self.y2.min(image.height());
        let x1 = self.x1.min(x2);
        let y1 = self.y1.min(y2);
        image.crop_imm(x1, y1, x2 - x1, y2 - y1)
    }
}

impl fmt::Display for SubtitleArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

impl FromStr for SubtitleArea {
    type Err = String;

    /// Accepts `x1 y1 x2 y2`, with spaces and/or commas between values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| format!("'{part}' is not a pixel coordinate"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        match values.as_slice() {
            [x1, y1, x2, y2] => SubtitleArea::new(*x1, *y1, *x2, *y2),
            _ => Err(format!(
                "expected four coordinates 'x1 y1 x2 y2', got {}",
                values.len()
            )),
        }
    }
}

/// Evenly spaced frame indices inside `[start·frames, stop·frames)`.
pub fn sample_indices(frame_count: u64, split_start: f64, split_stop: f64, samples: usize) -> Vec<u64> {
    if frame_count == 0 || samples == 0 {
        return Vec::new();
    }
    let lo = ((frame_count as f64 * split_start) as u64).min(frame_count - 1);
    let hi = ((frame_count as f64 * split_stop) as u64).clamp(lo + 1, frame_count);
    let span = hi - lo;
    let samples = samples as u64;
    if samples >= span {
        return (lo..hi).collect();
    }
    let mut indices: Vec<u64> = (0..samples).map(|i| lo + i * span / samples).collect();
    indices.dedup();
    indices
}

/// What the locator saw across all samples.
#[derive(Debug, Clone, Default)]
pub struct AreaDetection {
    /// Union of surviving boxes, padded; `None` when nothing survived.
    pub area: Option<SubtitleArea>,
    pub samples: usize,
    pub boxes: usize,
    pub failures: Vec<FailureRecord>,
}

pub struct AreaLocator<'a> {
    engine: &'a dyn OcrEngine,
    config: &'a DetectionConfig,
    options: DetectOptions,
}

impl<'a> AreaLocator<'a> {
    pub fn new(engine: &'a dyn OcrEngine, config: &'a DetectionConfig, options: DetectOptions) -> Self {
        Self {
            engine,
            config,
            options,
        }
    }

    /// Samples the configured band and aggregates every box whose score
    /// reaches the drop score. Per-sample failures are recorded, not fatal.
    #[instrument(skip_all, fields(samples = self.config.sample_count))]
    pub fn detect(
        &self,
        source: &dyn VideoSource,
        cancel: &CancellationToken,
        progress: &ProgressHandle,
    ) -> Result<AreaDetection, ExtractError> {
        let (width, height) = source.resolution();
        let indices = sample_indices(
            source.frame_count(),
            self.config.split_start,
            self.config.split_stop,
            self.config.sample_count,
        );
        let search = if self.config.use_search_area {
            SubtitleArea::lower_band(width, height)
        } else {
            None
        };
        progress.start(Stage::AreaDetection, indices.len());

        let mut detection = AreaDetection::default();
        let mut union: Option<SubtitleArea> = None;
        for index in indices {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            detection.samples += 1;
            let frame = match source.get_frame(index) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(frame = index, error = %err, "Skipping unreadable sample frame");
                    detection.failures.push(FailureRecord::other(
                        FailureKind::AreaSample,
                        Some(index),
                        err.to_string(),
                    ));
                    progress.batch_completed(Stage::AreaDetection);
                    continue;
                }
            };
            let region = match search {
                Some(area) => area.crop(&frame),
                None => frame,
            };
            match self.engine.detect(&region, &self.options) {
                Ok(boxes) => {
                    for text_box in boxes {
                        let Some(area) = self.accept(&text_box, region.width(), region.height())
                        else {
                            continue;
                        };
                        let area = match search {
                            Some(origin) => area.offset(origin.x1, origin.y1),
                            None => area,
                        };
                        detection.boxes += 1;
                        union = Some(union.map_or(area, |u| u.union(&area)));
                    }
                }
                Err(err) => {
                    warn!(frame = index, error = %err, "Text detection failed on sample frame");
                    detection.failures.push(FailureRecord::other(
                        FailureKind::AreaSample,
                        Some(index),
                        err.to_string(),
                    ));
                }
            }
            progress.batch_completed(Stage::AreaDetection);
        }

        detection.area = union.map(|area| {
            area.padded(
                width,
                height,
                self.config.x_rel_padding,
                self.config.y_abs_padding,
            )
        });
        debug!(
            samples = detection.samples,
            boxes = detection.boxes,
            area = ?detection.area,
            "Area detection finished"
        );
        Ok(detection)
    }

    fn accept(&self, text_box: &TextBox, width: u32, height: u32) -> Option<SubtitleArea> {
        if text_box.score < self.config.bbox_drop_score {
            return None;
        }
        SubtitleArea::new(
            text_box.x1.min(width),
            text_box.y1.min(height),
            text_box.x2.min(width),
            text_box.y2.min(height),
        )
        .ok()
    }
}

/// Applies the configured fallback to an inconclusive detection.
pub fn resolve_detection(
    detection: &AreaDetection,
    fallback: AreaFallback,
    width: u32,
    height: u32,
) -> Result<SubtitleArea, ExtractError> {
    if let Some(area) = detection.area {
        info!(%area, boxes = detection.boxes, "Subtitle area detected");
        return Ok(area);
    }
    let not_found = ExtractError::NoSubtitleAreaFound {
        samples: detection.samples,
    };
    match fallback {
        AreaFallback::Fail => Err(not_found),
        AreaFallback::DefaultArea => {
            let area = SubtitleArea::lower_band(width, height).ok_or(not_found)?;
            warn!(%area, samples = detection.samples, "No subtitle text detected; using default area");
            Ok(area)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_band_of_full_hd() {
        assert_eq!(
            SubtitleArea::lower_band(1920, 1080),
            Some(SubtitleArea::new(0, 810, 1920, 1080).unwrap())
        );
        assert_eq!(SubtitleArea::lower_band(0, 1080), None);
    }

    #[test]
    fn padding_widens_to_relative_span() {
        let area = SubtitleArea::new(698, 158, 1218, 224).unwrap();
        let padded = area.padded(1920, 1080, 0.9, 25);
        assert_eq!(padded, SubtitleArea::new(192, 133, 1728, 249).unwrap());
        assert_eq!(
            padded.offset(0, 810),
            SubtitleArea::new(192, 943, 1728, 1059).unwrap()
        );
    }

    #[test]
    fn padded_cluster_is_contained_and_in_bounds() {
        let cluster = SubtitleArea::new(100, 800, 1800, 1000).unwrap();
        let padded = cluster.padded(1920, 1080, 0.85, 15);
        assert!(padded.contains(&cluster));
        assert!(padded.fits_within(1920, 1080));

        let edge = SubtitleArea::new(0, 1060, 1920, 1080).unwrap();
        let padded = edge.padded(1920, 1080, 0.85, 40);
        assert!(padded.fits_within(1920, 1080));
        assert_eq!(padded.y1, 1020);
    }

    #[test]
    fn parse_and_reject_areas() {
        assert_eq!(
            "10, 700, 1900, 1070".parse::<SubtitleArea>(),
            SubtitleArea::new(10, 700, 1900, 1070)
        );
        assert!("10 700 1900".parse::<SubtitleArea>().is_err());
        assert!("500 700 100 1070".parse::<SubtitleArea>().is_err());
        assert!(serde_yaml::from_str::<SubtitleArea>("{x1: 5, y1: 5, x2: 5, y2: 9}").is_err());
    }

    #[test]
    fn samples_are_spread_over_the_band() {
        let indices = sample_indices(1000, 0.25, 0.5, 5);
        assert_eq!(indices, vec![250, 300, 350, 400, 450]);
        assert_eq!(sample_indices(10, 0.25, 0.5, 200), vec![2, 3, 4]);
        assert!(sample_indices(0, 0.25, 0.5, 10).is_empty());
    }

    #[test]
    fn fallback_policy() {
        let empty = AreaDetection {
            samples: 12,
            ..Default::default()
        };
        assert!(matches!(
            resolve_detection(&empty, AreaFallback::Fail, 1920, 1080),
            Err(ExtractError::NoSubtitleAreaFound { samples: 12 })
        ));
        assert_eq!(
            resolve_detection(&empty, AreaFallback::DefaultArea, 1920, 1080).unwrap(),
            SubtitleArea::new(0, 810, 1920, 1080).unwrap()
        );
    }
}
