use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, unbounded};
use tracing::{debug, info, instrument, warn};

use crate::area::{AreaLocator, SubtitleArea, resolve_detection};
use crate::cache::{CacheManager, RunCache, run_id};
use crate::config::RunConfig;
use crate::error::{ExtractError, FailureKind, FailureRecord, ResourcePlanError, Result};
use crate::extraction::{ExtractedBatch, ExtractionWorker, FrameBatch, frame_indices, partition};
use crate::merge::{SubtitleCue, SubtitleMerger};
use crate::observability::{MetricsCollector, RunSummary};
use crate::ocr::{DetectOptions, OcrEngine};
use crate::progress::{CancellationToken, ProgressHandle, ProgressSink, Stage, progress_channel};
use crate::recognition::{
    Lanes, RecognitionWorker, RecognizedBatch, TextBatch, TextSettings, text_batches,
};
use crate::reorder::ReorderBuffer;
use crate::scheduler::{
    Device, ResourcePlan, ResourcePlanner, Utilization, probe_cores, tune_cpu_processes,
};
use crate::validation::{validate_against_video, validate_config};
use crate::video::{FrameClock, VideoInfo, VideoSource};

/// Result of a completed run.
#[derive(Debug)]
pub struct ExtractionReport {
    pub cues: Vec<SubtitleCue>,
    pub summary: RunSummary,
    /// Set when the intermediate artifacts were retained.
    pub cache_dir: Option<PathBuf>,
}

/// Drives one extraction run: validate, plan, locate the area, extract,
/// recognize and merge.
pub struct SubtitleExtractor<'a> {
    config: &'a RunConfig,
    engine: &'a dyn OcrEngine,
    label: String,
    cores: Option<std::result::Result<i64, ResourcePlanError>>,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl<'a> SubtitleExtractor<'a> {
    pub fn new(config: &'a RunConfig, engine: &'a dyn OcrEngine) -> Self {
        Self {
            config,
            engine,
            label: "video".to_string(),
            cores: None,
            cancel: CancellationToken::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Name of the source; feeds the run identifier.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replaces the hardware probe.
    pub fn with_core_count(mut self, cores: std::result::Result<i64, ResourcePlanError>) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    #[instrument(skip_all, fields(label = %self.label))]
    pub fn extract(
        &self,
        source: &dyn VideoSource,
        sink: &mut dyn ProgressSink,
    ) -> Result<ExtractionReport> {
        let started = Instant::now();
        let mut summary = RunSummary::new(run_id(std::path::Path::new(&self.label)));
        let (progress, aggregator) = progress_channel();

        let outcome = thread::scope(|scope| {
            let aggregator_thread = scope.spawn(move || aggregator.run(sink));
            let outcome = self.run(source, &progress, &mut summary);
            match &outcome {
                Ok((cues, _)) => progress.finish(true, format!("{} subtitle cue(s)", cues.len())),
                Err(err) => progress.finish(false, err.to_string()),
            }
            drop(progress);
            if aggregator_thread.join().is_err() {
                warn!("Progress sink panicked");
            }
            outcome
        });

        self.metrics.record_total_duration(started.elapsed());
        summary.metrics = self.metrics.snapshot();
        let (cues, cache_dir) = outcome?;
        summary.log();
        info!(
            cues = cues.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extraction finished"
        );
        Ok(ExtractionReport {
            cues,
            summary,
            cache_dir,
        })
    }

    fn run(
        &self,
        source: &dyn VideoSource,
        progress: &ProgressHandle,
        summary: &mut RunSummary,
    ) -> Result<(Vec<SubtitleCue>, Option<PathBuf>)> {
        let config = self.config;
        let info = source.info();
        let mut report = validate_config(config);
        report.merge(validate_against_video(config, &info));
        summary.warnings.extend(report.into_result()?);

        let cores = self.cores.clone().unwrap_or_else(probe_cores);
        let planner = ResourcePlanner::detect(
            config.performance.device_policy,
            self.engine.supports_gpu(),
        );
        let outcome = planner.plan(cores.clone(), &config.performance);
        if let Some(err) = &outcome.fallback {
            summary.plan_fallback = Some(err.to_string());
            summary
                .failures
                .push(FailureRecord::other(FailureKind::ResourcePlan, None, err.to_string()));
        }
        let plan = outcome.plan;
        summary.plan = Some(plan);
        info!(
            cpu_processes = plan.cpu_process_count,
            cpu_threads = plan.cpu_thread_count,
            gpu_processes = plan.gpu_workers(),
            use_gpu = plan.use_gpu,
            "Resource plan"
        );

        let area = self.locate_area(source, &info, &plan, progress, summary)?;
        summary.area = Some(area);

        let cache_manager = CacheManager::new(config.cache.resolved_root());
        let cache = cache_manager.acquire(&summary.run_id)?;
        cache.set_keep(config.cache.keep);

        let start = config.start_frame.unwrap_or(0);
        let stop = config
            .stop_frame
            .unwrap_or(info.frame_count)
            .min(info.frame_count);
        let step = config.frame_extraction.frequency.max(1);
        let clock = FrameClock::new(info.frame_rate, step, stop);
        let indices = frame_indices(start, stop, step);

        let (cues, usage) =
            self.extract_text(&indices, source, area, &plan, clock, &cache, progress, summary)?;
        summary.cpu_utilization = usage.ratio();
        if config.performance.auto_optimize {
            let cores = cores.ok().and_then(|c| usize::try_from(c).ok()).unwrap_or(1);
            summary.tuned_cpu_processes = tune_cpu_processes(&plan, &usage, cores);
        }

        let cache_dir = cache.keep().then(|| cache.path().to_path_buf());
        if let Some(dir) = &cache_dir {
            info!(path = %dir.display(), "Intermediate files kept");
        }
        cache.release()?;
        Ok((cues, cache_dir))
    }

    fn locate_area(
        &self,
        source: &dyn VideoSource,
        info: &VideoInfo,
        plan: &ResourcePlan,
        progress: &ProgressHandle,
        summary: &mut RunSummary,
    ) -> Result<SubtitleArea> {
        if let Some(area) = self.config.sub_area {
            debug!(%area, "Using configured subtitle area");
            return Ok(area);
        }
        let _timer = self.metrics.start_stage(Stage::AreaDetection);
        let detection_config = &self.config.detection;
        let options = DetectOptions {
            box_threshold: detection_config.bbox_drop_score,
            model: self.config.ocr_engine.model,
            device: if plan.use_gpu { Device::Gpu } else { Device::Cpu },
            timeout: self.config.text_extraction.timeout(),
        };
        let locator = AreaLocator::new(self.engine, detection_config, options);
        let detection = locator.detect(source, &self.cancel, progress)?;
        summary.failures.extend(detection.failures.iter().cloned());
        summary.area_detected = detection.area.is_some();
        resolve_detection(
            &detection,
            detection_config.fallback,
            info.width,
            info.height,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_text(
        &self,
        indices: &[u64],
        source: &dyn VideoSource,
        area: SubtitleArea,
        plan: &ResourcePlan,
        clock: FrameClock,
        cache: &RunCache,
        progress: &ProgressHandle,
        summary: &mut RunSummary,
    ) -> Result<(Vec<SubtitleCue>, Utilization)> {
        let config = self.config;
        let text_batch_size = config.text_extraction.batch_size.max(1);
        let batches = partition(indices, config.frame_extraction.batch_size);
        let text_total: usize = batches
            .iter()
            .map(|b| b.frames.len().div_ceil(text_batch_size))
            .sum();
        progress.start(Stage::FrameExtraction, batches.len());
        progress.start(Stage::TextRecognition, text_total);
        info!(
            frames = indices.len(),
            extraction_batches = batches.len(),
            text_batches = text_total,
            %area,
            "Extracting subtitles"
        );

        let store = cache.frame_store();
        let settings = TextSettings::new(config, plan);
        let mut merger = SubtitleMerger::new(&config.subtitle_generator, clock);
        let mut log = cache.result_log()?;
        let mut cues = Vec::new();
        let started = Instant::now();
        let mut cpu_busy = Duration::ZERO;

        let extraction_workers = plan.cpu_workers().min(batches.len()).max(1);
        let cpu_workers = plan.cpu_workers();
        let gpu_workers = plan.gpu_workers();
        let window = text_batch_size * (cpu_workers + gpu_workers).max(1) * 2;
        let mut reorder = ReorderBuffer::new(indices.iter().copied(), window);
        debug!(window, "Reorder window");

        let pooled = thread::scope(|scope| -> Result<Vec<FailureRecord>> {
            let (work_tx, work_rx) = bounded::<FrameBatch>(batches.len().max(1));
            for batch in batches {
                if work_tx.send(batch).is_err() {
                    break;
                }
            }
            drop(work_tx);

            let (extracted_tx, extracted_rx) = bounded::<ExtractedBatch>(extraction_workers);
            let mut workers: Vec<(&'static str, ScopedJoinHandle<'_, ()>)> = Vec::new();
            let extraction_timer = self.metrics.start_stage(Stage::FrameExtraction);
            for id in 0..extraction_workers {
                let worker = ExtractionWorker {
                    id,
                    source,
                    area,
                    store: store.clone(),
                    cancel: self.cancel.clone(),
                    progress: progress.clone(),
                };
                let queue = work_rx.clone();
                let output = extracted_tx.clone();
                workers.push(("frame extraction", scope.spawn(move || worker.run(queue, output))));
            }
            drop(extracted_tx);
            drop(work_rx);

            let (result_tx, result_rx) = bounded::<RecognizedBatch>((cpu_workers + gpu_workers) * 2);
            let mut spawn_lane = |device: Device, count: usize, capacity: usize| -> Sender<TextBatch> {
                let (lane_tx, lane_rx) = bounded::<TextBatch>(capacity);
                for id in 0..count {
                    let worker = RecognitionWorker {
                        id,
                        device,
                        engine: self.engine,
                        store: store.clone(),
                        settings: settings.clone(),
                        cancel: self.cancel.clone(),
                        progress: progress.clone(),
                    };
                    let lane = lane_rx.clone();
                    let output = result_tx.clone();
                    workers.push(("text recognition", scope.spawn(move || worker.run(lane, output))));
                }
                lane_tx
            };
            let gpu_lane = (gpu_workers > 0).then(|| spawn_lane(Device::Gpu, gpu_workers, gpu_workers));
            let cpu_lane = spawn_lane(Device::Cpu, cpu_workers, cpu_workers);
            drop(result_tx);

            // Frames released by the reorder buffer so far.
            let (credit_tx, credit_rx) = unbounded::<usize>();
            let lanes = Lanes::new(gpu_lane, cpu_lane);
            let metrics = self.metrics.clone();
            let dispatcher = scope.spawn(move || {
                let _timer = extraction_timer;
                let mut failures = Vec::new();
                let mut waiting = BTreeMap::new();
                let mut next_ordinal = 0;
                let mut dispatched = 0usize;
                let mut released = 0usize;
                for extracted in extracted_rx {
                    waiting.insert(extracted.ordinal, extracted);
                    while let Some(extracted) = waiting.remove(&next_ordinal) {
                        next_ordinal += 1;
                        metrics.record_frames(
                            (extracted.stored.len() + extracted.failed.len()) as u64,
                            extracted.failed.len() as u64,
                        );
                        for batch in text_batches(&extracted, text_batch_size) {
                            let count = batch.frames.len();
                            while dispatched + count > released + window {
                                match credit_rx.recv() {
                                    Ok(frames) => released = frames,
                                    Err(_) => return failures,
                                }
                            }
                            if lanes.dispatch(batch).is_none() {
                                return failures;
                            }
                            dispatched += count;
                        }
                        failures.extend(extracted.failures);
                    }
                }
                failures
            });

            let recognition_timer = self.metrics.start_stage(Stage::TextRecognition);
            let mut failures = Vec::new();
            for batch in result_rx.iter() {
                if self.cancel.is_cancelled() {
                    break;
                }
                let engine_failed = batch.failures.iter().any(|f| f.kind == FailureKind::Engine);
                self.metrics.record_ocr_batch(engine_failed);
                if batch.device == Device::Cpu {
                    cpu_busy += batch.busy;
                }
                failures.extend(batch.failures);
                for result in batch.results {
                    let frame_index = result.frame_index;
                    match reorder.insert(frame_index, result) {
                        Ok(ready) => {
                            for (_, result) in ready {
                                log.append(&result)?;
                                merger.push(&result);
                            }
                        }
                        Err(err) => warn!(error = %err, "Discarding recognition result"),
                    }
                }
                let _ = credit_tx.send(reorder.released());
                cues.extend(merger.take_ready());
            }
            drop(credit_tx);
            drop(result_rx);
            drop(recognition_timer);

            let dispatch_failures = dispatcher
                .join()
                .map_err(|_| ExtractError::WorkerPanicked("dispatch"))?;
            for (stage, handle) in workers {
                handle.join().map_err(|_| ExtractError::WorkerPanicked(stage))?;
            }
            failures.extend(dispatch_failures);
            Ok(failures)
        });
        let failures = pooled?;
        log.flush()?;

        if self.cancel.is_cancelled() {
            warn!("Extraction cancelled; discarding partial subtitles");
            return Err(ExtractError::Cancelled);
        }
        if !reorder.is_complete() {
            warn!(
                next = ?reorder.next_expected(),
                buffered = reorder.buffered(),
                "Recognition stream ended early"
            );
        }
        summary.failures.extend(failures);
        self.metrics.record_reorder(reorder.high_water(), reorder.capacity());

        let merge_timer = self.metrics.start_stage(Stage::Merge);
        let output = merger.finish();
        drop(merge_timer);
        cues.extend(output.cues);
        self.metrics.record_merge(cues.len(), &output.stats);
        for warning in &output.warnings {
            summary.failures.push(FailureRecord::other(FailureKind::Overlap, None, warning.clone()));
        }
        summary.warnings.extend(output.warnings);

        let usage = Utilization {
            busy: cpu_busy,
            wall: started.elapsed(),
            workers: cpu_workers,
        };
        Ok((cues, usage))
    }
}
