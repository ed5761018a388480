//! Text Recognition Pool: OCR over stored frames, on a GPU and a CPU lane.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::FrameStore;
use crate::config::RunConfig;
use crate::error::{DecodeError, EngineError, FailureRecord};
use crate::extraction::ExtractedBatch;
use crate::ocr::{OcrEngine, RecognizeOptions};
use crate::progress::{CancellationToken, ProgressHandle, Stage};
use crate::scheduler::{Device, ResourcePlan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub frame_index: u64,
    /// Empty when no text was found or the frame could not be processed.
    pub text: String,
    pub confidence: f32,
}

impl RecognitionResult {
    pub fn new(frame_index: u64, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            frame_index,
            text: text.into(),
            confidence,
        }
    }

    pub fn empty(frame_index: u64) -> Self {
        Self::new(frame_index, String::new(), 0.0)
    }
}

/// Everything a recognition worker needs besides the engine.
#[derive(Debug, Clone)]
pub struct TextSettings {
    pub drop_score: f32,
    pub line_separator: &'static str,
    pub options: RecognizeOptions,
}

impl TextSettings {
    pub fn new(config: &RunConfig, plan: &ResourcePlan) -> Self {
        Self {
            drop_score: config.text_extraction.drop_score,
            line_separator: config.text_extraction.line_separator(),
            options: RecognizeOptions {
                language: config.ocr_engine.language.clone(),
                model: config.ocr_engine.model,
                device: Device::Cpu,
                threads: plan.cpu_thread_count,
                use_text_orientation: config.ocr_engine.use_text_orientation,
                timeout: config.text_extraction.timeout(),
            },
        }
    }

    fn options_for(&self, device: Device) -> RecognizeOptions {
        RecognizeOptions {
            device,
            ..self.options.clone()
        }
    }
}

/// One engine invocation worth of frames; `false` marks frames whose
/// extraction failed and which are reported empty without OCR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBatch {
    pub frames: Vec<(u64, bool)>,
}

impl TextBatch {
    pub fn first_frame(&self) -> Option<u64> {
        self.frames.first().map(|(index, _)| *index)
    }
}

/// Re-chunks a finished extraction batch by the text batch size.
pub fn text_batches(extracted: &ExtractedBatch, batch_size: usize) -> Vec<TextBatch> {
    extracted
        .frames()
        .chunks(batch_size.max(1))
        .map(|frames| TextBatch {
            frames: frames.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RecognizedBatch {
    pub results: Vec<RecognitionResult>,
    pub failures: Vec<FailureRecord>,
    pub device: Device,
    /// Time spent inside the engine.
    pub busy: Duration,
}

/// Joins the engine's lines with `separator`, dropping blank lines.
pub fn normalize_text(raw: &str, separator: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Runs one batch. Never fails: unreadable frames and engine errors turn
/// into empty results plus failure records.
pub fn recognize_batch(
    engine: &dyn OcrEngine,
    store: &FrameStore,
    batch: &TextBatch,
    settings: &TextSettings,
    device: Device,
) -> RecognizedBatch {
    let mut failures = Vec::new();
    let mut images: Vec<DynamicImage> = Vec::with_capacity(batch.frames.len());
    let mut loaded: Vec<u64> = Vec::with_capacity(batch.frames.len());
    for &(index, available) in &batch.frames {
        if !available {
            continue;
        }
        match store.get(index) {
            Ok(image) => {
                images.push(image);
                loaded.push(index);
            }
            Err(err) => {
                let err = DecodeError::new(index, format!("cached frame unreadable: {err}"));
                warn!(frame = index, error = %err, "Frame skipped");
                failures.push(FailureRecord::decode(&err));
            }
        }
    }

    let mut recognized = HashMap::with_capacity(loaded.len());
    let started = Instant::now();
    if !images.is_empty() {
        let outcome = engine
            .recognize(&images, &settings.options_for(device))
            .and_then(|outputs| {
                if outputs.len() == loaded.len() {
                    Ok(outputs)
                } else {
                    Err(EngineError::Protocol(format!(
                        "engine returned {} result(s) for {} image(s)",
                        outputs.len(),
                        loaded.len()
                    )))
                }
            });
        match outcome {
            Ok(outputs) => {
                for (index, output) in loaded.iter().zip(outputs) {
                    if output.confidence < settings.drop_score {
                        continue;
                    }
                    let text = normalize_text(&output.text, settings.line_separator);
                    if !text.is_empty() {
                        recognized.insert(*index, (text, output.confidence));
                    }
                }
            }
            Err(err) => {
                warn!(
                    first_frame = batch.first_frame(),
                    frames = loaded.len(),
                    %device,
                    error = %err,
                    "OCR batch failed; frames treated as empty"
                );
                failures.push(FailureRecord::engine(batch.first_frame(), loaded.len(), &err));
            }
        }
    }
    let busy = started.elapsed();

    let results = batch
        .frames
        .iter()
        .map(|(index, _)| match recognized.remove(index) {
            Some((text, confidence)) => RecognitionResult::new(*index, text, confidence),
            None => RecognitionResult::empty(*index),
        })
        .collect();

    RecognizedBatch {
        results,
        failures,
        device,
        busy,
    }
}

/// Sending side of the two recognition lanes.
pub struct Lanes {
    gpu: Option<Sender<TextBatch>>,
    cpu: Sender<TextBatch>,
}

impl Lanes {
    pub fn new(gpu: Option<Sender<TextBatch>>, cpu: Sender<TextBatch>) -> Self {
        Self { gpu, cpu }
    }

    /// GPU first, CPU for overflow. When both are full, waits on the GPU
    /// lane (or the CPU lane without GPU). Returns `None` once the workers
    /// are gone.
    pub fn dispatch(&self, batch: TextBatch) -> Option<Device> {
        let batch = match &self.gpu {
            Some(gpu) => match gpu.try_send(batch) {
                Ok(()) => return Some(Device::Gpu),
                Err(TrySendError::Full(batch) | TrySendError::Disconnected(batch)) => batch,
            },
            None => batch,
        };
        match self.cpu.try_send(batch) {
            Ok(()) => Some(Device::Cpu),
            Err(TrySendError::Full(batch) | TrySendError::Disconnected(batch)) => match &self.gpu {
                Some(gpu) => match gpu.send(batch) {
                    Ok(()) => Some(Device::Gpu),
                    Err(err) => self.cpu.send(err.into_inner()).ok().map(|()| Device::Cpu),
                },
                None => self.cpu.send(batch).ok().map(|()| Device::Cpu),
            },
        }
    }
}

pub struct RecognitionWorker<'a> {
    pub id: usize,
    pub device: Device,
    pub engine: &'a dyn OcrEngine,
    pub store: FrameStore,
    pub settings: TextSettings,
    pub cancel: CancellationToken,
    pub progress: ProgressHandle,
}

impl RecognitionWorker<'_> {
    pub fn run(self, lane: Receiver<TextBatch>, output: Sender<RecognizedBatch>) {
        let mut processed = 0usize;
        while let Ok(batch) = lane.recv() {
            if self.cancel.is_cancelled() {
                debug!(worker = self.id, device = %self.device, "Recognition worker cancelled");
                break;
            }
            let recognized =
                recognize_batch(self.engine, &self.store, &batch, &self.settings, self.device);
            self.progress.batch_completed(Stage::TextRecognition);
            processed += 1;
            if output.send(recognized).is_err() {
                break;
            }
        }
        debug!(
            worker = self.id,
            device = %self.device,
            batches = processed,
            "Recognition worker finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::config::RunConfig;
    use crate::ocr::{DetectOptions, OcrOutput, TextBox};
    use crate::scheduler::ResourcePlan;
    use crossbeam_channel::bounded;
    use image::{ImageBuffer, Luma};

    #[test]
    fn line_separator_applies_between_lines() {
        assert_eq!(normalize_text(" first \n\n second ", "\n"), "first\nsecond");
        assert_eq!(normalize_text("first\nsecond", " "), "first second");
        assert_eq!(normalize_text("  \n ", " "), "");
    }

    #[test]
    fn text_batches_cover_every_frame() {
        let extracted = ExtractedBatch {
            ordinal: 0,
            stored: vec![0, 2, 6],
            failed: vec![4],
            failures: Vec::new(),
        };
        let batches = text_batches(&extracted, 3);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].frames, vec![(0, true), (2, true), (4, false)]);
        assert_eq!(batches[1].first_frame(), Some(6));
    }

    #[test]
    fn gpu_lane_is_preferred_and_cpu_takes_overflow() {
        let (gpu_tx, gpu_rx) = bounded(1);
        let (cpu_tx, cpu_rx) = bounded(1);
        let lanes = Lanes::new(Some(gpu_tx), cpu_tx);
        let batch = |i| TextBatch {
            frames: vec![(i, true)],
        };
        assert_eq!(lanes.dispatch(batch(0)), Some(Device::Gpu));
        assert_eq!(lanes.dispatch(batch(1)), Some(Device::Cpu));
        assert_eq!(gpu_rx.recv().unwrap().first_frame(), Some(0));
        assert_eq!(cpu_rx.recv().unwrap().first_frame(), Some(1));
    }

    #[test]
    fn cpu_only_lanes() {
        let (cpu_tx, cpu_rx) = bounded(2);
        let lanes = Lanes::new(None, cpu_tx);
        assert_eq!(
            lanes.dispatch(TextBatch {
                frames: vec![(5, true)]
            }),
            Some(Device::Cpu)
        );
        drop(cpu_rx);
        assert_eq!(
            lanes.dispatch(TextBatch {
                frames: vec![(6, true)]
            }),
            None
        );
    }

    /// Answers every call with a single line, whatever the batch size.
    struct ShortEngine;

    impl OcrEngine for ShortEngine {
        fn name(&self) -> &str {
            "short"
        }

        fn recognize(
            &self,
            _images: &[DynamicImage],
            _options: &RecognizeOptions,
        ) -> Result<Vec<OcrOutput>, EngineError> {
            Ok(vec![OcrOutput::new("only one", 0.99)])
        }

        fn detect(
            &self,
            _image: &DynamicImage,
            _options: &DetectOptions,
        ) -> Result<Vec<TextBox>, EngineError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn short_engine_answer_fails_the_whole_batch() {
        let temp = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(temp.path()).acquire("short-answer").unwrap();
        let store = cache.frame_store();
        let frame = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(4, 4, Luma([255])));
        for index in [0, 1, 2] {
            store.put(index, &frame).unwrap();
        }
        let settings = TextSettings::new(&RunConfig::default(), &ResourcePlan::minimal());
        let batch = TextBatch {
            frames: vec![(0, true), (1, true), (2, true)],
        };

        let recognized = recognize_batch(&ShortEngine, &store, &batch, &settings, Device::Cpu);

        assert_eq!(recognized.results.len(), 3);
        assert!(recognized.results.iter().all(|r| r.text.is_empty()));
        assert_eq!(recognized.failures.len(), 1);
        let failure = &recognized.failures[0];
        assert_eq!(failure.kind, crate::error::FailureKind::Engine);
        assert_eq!(failure.frame_index, Some(0));
        assert_eq!(failure.frames, 3);
        assert!(failure.message.contains("1 result(s) for 3 image(s)"), "{}", failure.message);
    }
}
