use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::area::SubtitleArea;
use crate::error::{FailureKind, FailureRecord};
use crate::merge::MergeStats;
use crate::progress::Stage;
use crate::scheduler::ResourcePlan;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub frames_sampled: u64,
    pub frames_failed: u64,
    pub ocr_batches: u64,
    pub ocr_batch_failures: u64,
    pub cues_emitted: u64,
    pub cues_dropped: u64,
    pub flicker_bridged: u64,
    pub reorder_high_water: u64,
    pub reorder_capacity: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage: Stage) -> StageTimer {
        StageTimer {
            stage,
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|m| m.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_frames(&self, sampled: u64, failed: u64) {
        self.update(|m| {
            m.frames_sampled += sampled;
            m.frames_failed += failed;
        });
    }

    pub fn record_ocr_batch(&self, failed: bool) {
        self.update(|m| {
            m.ocr_batches += 1;
            if failed {
                m.ocr_batch_failures += 1;
            }
        });
    }

    pub fn record_merge(&self, cues: usize, stats: &MergeStats) {
        self.update(|m| {
            m.cues_emitted += cues as u64;
            m.cues_dropped += stats.dropped_short as u64;
            m.flicker_bridged += stats.bridged_gaps as u64;
        });
    }

    pub fn record_reorder(&self, high_water: usize, capacity: usize) {
        self.update(|m| {
            m.reorder_high_water = m.reorder_high_water.max(high_water as u64);
            m.reorder_capacity = capacity as u64;
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }
}

/// Records the elapsed time of a stage when dropped.
pub struct StageTimer {
    stage: Stage,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.to_string()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        frames = snapshot.frames_sampled,
        failed_frames = snapshot.frames_failed,
        ocr_batches = snapshot.ocr_batches,
        ocr_failures = snapshot.ocr_batch_failures,
        cues = snapshot.cues_emitted,
        "Extraction metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, help, value) in [
            ("frames_sampled_total", "Frames sampled for recognition", self.frames_sampled),
            ("frames_failed_total", "Frames that could not be decoded or stored", self.frames_failed),
            ("ocr_batches_total", "OCR engine batches processed", self.ocr_batches),
            ("ocr_batch_failures_total", "OCR engine batches that failed", self.ocr_batch_failures),
            ("cues_emitted_total", "Subtitle cues emitted", self.cues_emitted),
            ("cues_dropped_total", "Candidate cues dropped as too short", self.cues_dropped),
            ("flicker_bridged_total", "Flicker gaps bridged by the merger", self.flicker_bridged),
        ] {
            output.push_str(&format!("# HELP hardsub_{name} {help}\n"));
            output.push_str(&format!("# TYPE hardsub_{name} counter\n"));
            output.push_str(&format!("hardsub_{name} {value}\n"));
        }
        output.push_str("# HELP hardsub_reorder_buffer_high_water Most results held for reordering\n");
        output.push_str("# TYPE hardsub_reorder_buffer_high_water gauge\n");
        output.push_str(&format!(
            "hardsub_reorder_buffer_high_water {}\n",
            self.reorder_high_water
        ));
        output.push_str("# HELP hardsub_reorder_buffer_capacity Results the reorder window admits\n");
        output.push_str("# TYPE hardsub_reorder_buffer_capacity gauge\n");
        output.push_str(&format!(
            "hardsub_reorder_buffer_capacity {}\n",
            self.reorder_capacity
        ));
        output.push_str("# HELP hardsub_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE hardsub_stage_calls_total counter\n");
        output.push_str(
            "# HELP hardsub_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE hardsub_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP hardsub_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE hardsub_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "hardsub_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "hardsub_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "hardsub_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP hardsub_run_duration_seconds Total run duration\n");
        output.push_str("# TYPE hardsub_run_duration_seconds gauge\n");
        output.push_str(&format!(
            "hardsub_run_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

/// End-of-run report: what was decided, and every non-fatal failure.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub area: Option<SubtitleArea>,
    pub area_detected: bool,
    pub plan: Option<ResourcePlan>,
    pub plan_fallback: Option<String>,
    pub cpu_utilization: Option<f64>,
    /// CPU process count recommended for the next run.
    pub tuned_cpu_processes: Option<usize>,
    pub warnings: Vec<String>,
    pub failures: Vec<FailureRecord>,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            area: None,
            area_detected: false,
            plan: None,
            plan_fallback: None,
            cpu_utilization: None,
            tuned_cpu_processes: None,
            warnings: Vec::new(),
            failures: Vec::new(),
            metrics: MetricsSnapshot::default(),
        }
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }

    pub fn log(&self) {
        if self.failures.is_empty() {
            info!(run_id = %self.run_id, "Run finished without failures");
        } else {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for failure in &self.failures {
                let kind = serde_json::to_value(failure.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                *counts.entry(kind).or_default() += 1;
            }
            warn!(
                run_id = %self.run_id,
                failures = self.failures.len(),
                by_kind = ?counts,
                "Run finished with non-fatal failures"
            );
        }
        for warning in &self.warnings {
            warn!("{warning}");
        }
        log_snapshot(&self.metrics);
    }
}
