use std::fs;

use hardsub::area::SubtitleArea;
use hardsub::config::{RunConfig, WorkerCount};
use hardsub::error::ExtractError;
use hardsub::validation::{validate_against_video, validate_config};
use hardsub::video::VideoInfo;
use tempfile::tempdir;

fn full_hd() -> VideoInfo {
    VideoInfo {
        frame_count: 900,
        frame_rate: 30.0,
        width: 1920,
        height: 1080,
    }
}

#[test]
fn defaults_are_valid() {
    let config = RunConfig::default();
    let mut report = validate_config(&config);
    report.merge(validate_against_video(&config, &full_hd()));
    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    assert!(report.warnings.is_empty());
}

#[test]
fn out_of_range_values_are_reported_together() {
    let mut config = RunConfig::default();
    config.detection.split_start = 0.6;
    config.detection.x_rel_padding = 1.2;
    config.text_extraction.batch_size = 0;
    config.subtitle_generator.min_sub_duration_ms = -5.0;
    config.performance.cpu_threads = WorkerCount::Fixed(0);
    config.start_frame = Some(50);
    config.stop_frame = Some(10);

    let report = validate_config(&config);
    let expected = [
        "detection.split_start",
        "detection.x_rel_padding",
        "text_extraction.batch_size",
        "subtitle_generator.min_sub_duration_ms",
        "performance.cpu_threads",
        "start_frame",
    ];
    for field in expected {
        assert!(
            report.errors.iter().any(|e| e.contains(field)),
            "missing error for {field}: {:?}",
            report.errors
        );
    }

    match report.into_result() {
        Err(ExtractError::Configuration(errors)) => assert!(errors.len() >= expected.len()),
        other => panic!("expected configuration error, got {other:?}"),
    }
}

#[test]
fn video_bounds_are_checked() {
    let mut config = RunConfig::default();
    config.sub_area = Some(SubtitleArea::new(0, 800, 2000, 1080).unwrap());
    config.start_frame = Some(900);
    config.stop_frame = Some(1_000);

    let report = validate_against_video(&config, &full_hd());
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors[0].contains("exceeds the frame bounds 1920x1080"));
    assert!(report.errors[1].contains("beyond the last frame (899)"));
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("clamping"));
}

#[test]
fn unusable_video_is_rejected() {
    let info = VideoInfo {
        frame_count: 0,
        frame_rate: 0.0,
        width: 1920,
        height: 1080,
    };
    let report = validate_against_video(&RunConfig::default(), &info);
    assert_eq!(report.errors.len(), 2);
}

#[test]
fn soft_issues_are_warnings() {
    let mut config = RunConfig::default();
    config.subtitle_generator.max_consecutive_short_durs = 0;
    config.cache.keep = true;
    let report = validate_config(&config);
    assert!(report.is_ok());
    assert_eq!(report.warnings.len(), 2);
}

#[test]
fn config_file_round_trips_through_yaml() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("hardsub.yaml");
    fs::write(
        &path,
        "sub_area: {x1: 0, y1: 810, x2: 1920, y2: 1080}\n\
         frame_extraction:\n  frequency: 3\n\
         performance:\n  cpu_processes: auto\n  gpu_processes: 2\n  device_policy: cpu-only\n",
    )
    .unwrap();

    let config = RunConfig::load(&path).unwrap();
    assert_eq!(config.sub_area, Some(SubtitleArea::new(0, 810, 1920, 1080).unwrap()));
    assert_eq!(config.frame_extraction.frequency, 3);
    assert_eq!(config.performance.gpu_processes, WorkerCount::Fixed(2));
    assert!(validate_config(&config).is_ok());

    fs::write(&path, "sub_area: {x1: 100, y1: 0, x2: 50, y2: 10}\n").unwrap();
    assert!(RunConfig::load(&path).is_err());
}
