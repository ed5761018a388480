#![allow(dead_code)]

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hardsub::error::{DecodeError, EngineError};
use hardsub::ocr::{DetectOptions, OcrEngine, OcrOutput, RecognizeOptions, TextBox};
use hardsub::progress::CancellationToken;
use hardsub::video::VideoSource;
use image::{DynamicImage, GrayImage, Luma};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 36;
/// Where the synthetic caption is painted, as (x1, y1, x2, y2).
pub const CAPTION: (u32, u32, u32, u32) = (16, 29, 48, 34);

/// In-memory video: black frames with a white caption bar on the frames that
/// carry text.
pub struct SyntheticVideo {
    pub frames: u64,
    pub fps: f64,
    pub text_frames: Range<u64>,
    pub broken: HashSet<u64>,
}

impl SyntheticVideo {
    pub fn new(frames: u64, fps: f64, text_frames: Range<u64>) -> Self {
        Self {
            frames,
            fps,
            text_frames,
            broken: HashSet::new(),
        }
    }

    pub fn with_broken(mut self, frames: impl IntoIterator<Item = u64>) -> Self {
        self.broken.extend(frames);
        self
    }
}

impl VideoSource for SyntheticVideo {
    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn resolution(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }

    fn get_frame(&self, index: u64) -> Result<DynamicImage, DecodeError> {
        if index >= self.frames || self.broken.contains(&index) {
            return Err(DecodeError::new(index, "synthetic decode failure"));
        }
        let captioned = self.text_frames.contains(&index);
        let (x1, y1, x2, y2) = CAPTION;
        let image = GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
            if captioned && (x1..x2).contains(&x) && (y1..y2).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        Ok(DynamicImage::ImageLuma8(image))
    }
}

/// Bounding box of the bright pixels of `image`.
fn bright_box(image: &DynamicImage) -> Option<(u32, u32, u32, u32)> {
    let gray = image.to_luma8();
    let mut found: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] > 127 {
            found = Some(match found {
                None => (x, y, x + 1, y + 1),
                Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x + 1), y2.max(y + 1)),
            });
        }
    }
    found
}

/// Reads the caption bar back as `text`.
pub struct ScriptedEngine {
    pub text: String,
    pub calls: AtomicUsize,
    pub fail_recognize: bool,
    pub fail_detect: bool,
    pub gpu: bool,
    /// Cancelled on the first recognition call.
    pub cancel_on_recognize: Option<CancellationToken>,
    /// Delay applied to the first recognition call only.
    pub slow_first_call: Option<Duration>,
    pub devices: Mutex<Vec<hardsub::scheduler::Device>>,
}

impl ScriptedEngine {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
            fail_recognize: false,
            fail_detect: false,
            gpu: false,
            cancel_on_recognize: None,
            slow_first_call: None,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_recognize: true,
            ..Self::new("unused")
        }
    }

    pub fn recognize_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_gpu(&self) -> bool {
        self.gpu
    }

    fn recognize(
        &self,
        batch: &[DynamicImage],
        options: &RecognizeOptions,
    ) -> Result<Vec<OcrOutput>, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0
            && let Some(delay) = self.slow_first_call
        {
            std::thread::sleep(delay);
        }
        if let Ok(mut devices) = self.devices.lock() {
            devices.push(options.device);
        }
        if let Some(token) = &self.cancel_on_recognize {
            token.cancel();
        }
        if self.fail_recognize {
            return Err(EngineError::Failed("model crashed".into()));
        }
        Ok(batch
            .iter()
            .map(|image| match bright_box(image) {
                Some(_) => OcrOutput::new(self.text.clone(), 0.95),
                None => OcrOutput::new("", 0.0),
            })
            .collect())
    }

    fn detect(
        &self,
        image: &DynamicImage,
        _options: &DetectOptions,
    ) -> Result<Vec<TextBox>, EngineError> {
        if self.fail_detect {
            return Err(EngineError::Failed("detector unavailable".into()));
        }
        Ok(bright_box(image)
            .map(|(x1, y1, x2, y2)| TextBox {
                x1,
                y1,
                x2,
                y2,
                score: 0.9,
            })
            .into_iter()
            .collect())
    }
}
