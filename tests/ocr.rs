#![cfg(unix)]

use std::time::{Duration, Instant};

use hardsub::config::ModelVariant;
use hardsub::error::EngineError;
use hardsub::ocr::{DetectOptions, ExternalOcrEngine, OcrEngine, OcrOutput, RecognizeOptions, TextBox};
use hardsub::scheduler::Device;
use image::{DynamicImage, GrayImage, Luma};
use tempfile::{TempDir, tempdir};

/// An engine whose program is `sh -c <script>`; the protocol arguments
/// arrive as `$1…`.
fn shell_engine(script: &str) -> (TempDir, ExternalOcrEngine) {
    let scratch = tempdir().unwrap();
    let command = ["sh", "-c", script, "ocr-engine"].map(String::from);
    let engine = ExternalOcrEngine::new(&command, scratch.path()).unwrap();
    (scratch, engine)
}

fn frame() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 4, Luma([200])))
}

fn recognize_options() -> RecognizeOptions {
    RecognizeOptions {
        language: "en".into(),
        model: ModelVariant::Server,
        device: Device::Cpu,
        threads: 3,
        use_text_orientation: false,
        timeout: None,
    }
}

fn detect_options() -> DetectOptions {
    DetectOptions {
        box_threshold: 0.5,
        model: ModelVariant::Mobile,
        device: Device::Gpu,
        timeout: None,
    }
}

#[test]
fn recognize_parses_one_result_per_image() {
    let (_scratch, engine) = shell_engine(
        r#"test "$1 $2 $3 $4 $5 $6 $7 $8 $9" = "recognize --lang en --model server --device cpu --threads 3" || exit 9
test $# -eq 11 || exit 8
test -f "${10}" && test -f "${11}" || exit 7
printf '[{"text":"first\\nline","confidence":0.93},{"text":"","confidence":0.0}]'"#,
    );

    let outputs = engine
        .recognize(&[frame(), frame()], &recognize_options())
        .unwrap();

    assert_eq!(
        outputs,
        vec![OcrOutput::new("first\nline", 0.93), OcrOutput::new("", 0.0)]
    );
}

#[test]
fn text_orientation_flag_is_forwarded() {
    let (_scratch, engine) = shell_engine(
        r#"test "${10}" = --text-orientation || exit 9
printf '[{"text":"ok","confidence":1.0}]'"#,
    );
    let options = RecognizeOptions {
        use_text_orientation: true,
        ..recognize_options()
    };

    let outputs = engine.recognize(&[frame()], &options).unwrap();
    assert_eq!(outputs[0].text, "ok");
}

#[test]
fn empty_batch_does_not_start_the_program() {
    let (_scratch, engine) = shell_engine("exit 1");
    assert!(engine.recognize(&[], &recognize_options()).unwrap().is_empty());
}

#[test]
fn nonzero_exit_is_reported_with_stderr() {
    let (_scratch, engine) = shell_engine("echo 'model file missing' >&2; exit 3");

    match engine.recognize(&[frame()], &recognize_options()) {
        Err(EngineError::Failed(message)) => {
            assert!(message.contains("'sh' exited with"), "{message}");
            assert!(message.contains("model file missing"), "{message}");
        }
        other => panic!("expected a failed call, got {other:?}"),
    }
}

#[test]
fn wrong_result_count_is_a_protocol_error() {
    let (_scratch, engine) = shell_engine(r#"printf '[{"text":"only","confidence":0.9}]'"#);

    match engine.recognize(&[frame(), frame(), frame()], &recognize_options()) {
        Err(EngineError::Protocol(message)) => {
            assert!(message.contains("expected 3 results, got 1"), "{message}")
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[test]
fn malformed_output_is_a_protocol_error() {
    let (_scratch, engine) = shell_engine("echo 'loading model...'");

    let result = engine.recognize(&[frame()], &recognize_options());
    assert!(matches!(result, Err(EngineError::Protocol(_))), "{result:?}");
}

#[test]
fn slow_engine_is_killed_after_the_timeout() {
    let (_scratch, engine) = shell_engine("exec sleep 5");
    let options = RecognizeOptions {
        timeout: Some(Duration::from_millis(200)),
        ..recognize_options()
    };

    let started = Instant::now();
    let result = engine.recognize(&[frame()], &options);

    assert!(
        matches!(result, Err(EngineError::Timeout(t)) if t == Duration::from_millis(200)),
        "{result:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn detect_parses_boxes() {
    let (_scratch, engine) = shell_engine(
        r#"test "$1 $2 $3 $4 $5 $6 $7" = "detect --box-thresh 0.5 --model mobile --device gpu" || exit 9
test -f "$8" || exit 8
printf '[{"x1":1,"y1":2,"x2":7,"y2":4,"score":0.8}]'"#,
    );

    let boxes = engine.detect(&frame(), &detect_options()).unwrap();

    assert_eq!(
        boxes,
        vec![TextBox {
            x1: 1,
            y1: 2,
            x2: 7,
            y2: 4,
            score: 0.8,
        }]
    );
}

#[test]
fn staged_images_are_removed_after_the_call() {
    let (scratch, engine) = shell_engine(r#"printf '[]'"#);
    engine.detect(&frame(), &detect_options()).unwrap();
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn engine_needs_a_command() {
    let scratch = tempdir().unwrap();
    let result = ExternalOcrEngine::new(&[], scratch.path());
    assert!(matches!(result, Err(EngineError::Failed(_))));
}
