use serde::Serialize;

use crate::config::RunConfig;
use crate::error::ExtractError;
use crate::video::VideoInfo;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn into_result(self) -> Result<Vec<String>, ExtractError> {
        if self.is_ok() {
            Ok(self.warnings)
        } else {
            Err(ExtractError::Configuration(self.errors))
        }
    }
}

/// Checks every tunable that can be judged without opening the video.
pub fn validate_config(config: &RunConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    let detection = &config.detection;
    check_range(&mut report, "detection.split_start", detection.split_start, 0.0, 0.5);
    check_range(&mut report, "detection.split_stop", detection.split_stop, 0.5, 1.0);
    if detection.split_start >= detection.split_stop {
        report.errors.push(format!(
            "detection.split_start ({}) must be less than detection.split_stop ({})",
            detection.split_start, detection.split_stop
        ));
    }
    check_range(
        &mut report,
        "detection.x_rel_padding",
        detection.x_rel_padding,
        0.5,
        1.0,
    );
    check_range(
        &mut report,
        "detection.bbox_drop_score",
        f64::from(detection.bbox_drop_score),
        0.0,
        1.0,
    );
    if detection.sample_count == 0 {
        report
            .errors
            .push("detection.sample_count must be at least 1".into());
    }

    if config.frame_extraction.frequency == 0 {
        report
            .errors
            .push("frame_extraction.frequency must be at least 1".into());
    }
    if config.frame_extraction.batch_size == 0 {
        report
            .errors
            .push("frame_extraction.batch_size must be at least 1".into());
    }

    let text = &config.text_extraction;
    if text.batch_size == 0 {
        report
            .errors
            .push("text_extraction.batch_size must be at least 1".into());
    }
    check_range(
        &mut report,
        "text_extraction.drop_score",
        f64::from(text.drop_score),
        0.0,
        1.0,
    );
    if text.timeout_ms == Some(0) {
        report
            .errors
            .push("text_extraction.timeout_ms must be greater than zero when set".into());
    }

    let generator = &config.subtitle_generator;
    check_range(
        &mut report,
        "subtitle_generator.similarity_threshold",
        generator.similarity_threshold,
        0.0,
        1.0,
    );
    check_non_negative(
        &mut report,
        "subtitle_generator.min_consecutive_sub_dur_ms",
        generator.min_consecutive_sub_dur_ms,
    );
    check_non_negative(
        &mut report,
        "subtitle_generator.min_sub_duration_ms",
        generator.min_sub_duration_ms,
    );
    if generator.max_consecutive_short_durs == 0 {
        report.warnings.push(
            "subtitle_generator.max_consecutive_short_durs is 0; flicker bridging is disabled"
                .into(),
        );
    }

    if config.ocr_engine.language.trim().is_empty() {
        report
            .errors
            .push("ocr_engine.language cannot be empty".into());
    }

    let perf = &config.performance;
    for (name, count) in [
        ("performance.cpu_processes", perf.cpu_processes),
        ("performance.cpu_threads", perf.cpu_threads),
        ("performance.gpu_processes", perf.gpu_processes),
    ] {
        if count.fixed() == Some(0) {
            report
                .errors
                .push(format!("{name} must be 'auto' or at least 1"));
        }
    }

    if let (Some(start), Some(stop)) = (config.start_frame, config.stop_frame)
        && start >= stop
    {
        report.errors.push(format!(
            "start_frame ({start}) must be less than stop_frame ({stop})"
        ));
    }

    if config.cache.keep {
        report
            .warnings
            .push("cache.keep is set; intermediate frames will not be deleted".into());
    }

    report
}

/// Checks the tunables that depend on the opened video.
pub fn validate_against_video(config: &RunConfig, info: &VideoInfo) -> ValidationReport {
    let mut report = ValidationReport::default();

    if info.frame_count == 0 {
        report.errors.push("video has no frames".into());
    }
    if !(info.frame_rate.is_finite() && info.frame_rate > 0.0) {
        report
            .errors
            .push(format!("video frame rate {} is not usable", info.frame_rate));
    }

    if let Some(area) = &config.sub_area
        && (area.x2 > info.width || area.y2 > info.height)
    {
        report.errors.push(format!(
            "sub_area {area} exceeds the frame bounds {}x{}",
            info.width, info.height
        ));
    }

    if let Some(start) = config.start_frame
        && start >= info.frame_count
    {
        report.errors.push(format!(
            "start_frame ({start}) is beyond the last frame ({})",
            info.frame_count.saturating_sub(1)
        ));
    }
    if let Some(stop) = config.stop_frame
        && stop > info.frame_count
    {
        report.warnings.push(format!(
            "stop_frame ({stop}) exceeds the frame count ({}); clamping",
            info.frame_count
        ));
    }

    report
}

fn check_range(report: &mut ValidationReport, name: &str, value: f64, min: f64, max: f64) {
    if !(value.is_finite() && value >= min && value <= max) {
        report
            .errors
            .push(format!("{name} must be between {min} and {max}, got {value}"));
    }
}

fn check_non_negative(report: &mut ValidationReport, name: &str, value: f64) {
    if !(value.is_finite() && value >= 0.0) {
        report
            .errors
            .push(format!("{name} must be a non-negative number, got {value}"));
    }
}
