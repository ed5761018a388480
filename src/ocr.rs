//! The OCR engine boundary.
//!
//! The recognition model itself is opaque. [`OcrEngine`] is the seam the
//! pools call through; [`ExternalOcrEngine`] drives any program that speaks
//! the small JSON protocol below.
//!
//! ```text
//! <program> <args…> recognize --lang L --model M --device D --threads N [--text-orientation] IMG…
//!     -> [{"text": "...", "confidence": 0.93}, …]   (one entry per image)
//! <program> <args…> detect --box-thresh S --model M --device D IMG
//!     -> [{"x1": 0, "y1": 0, "x2": 10, "y2": 10, "score": 0.9}, …]
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::ModelVariant;
use crate::error::EngineError;
use crate::scheduler::Device;

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizeOptions {
    pub language: String,
    pub model: ModelVariant,
    pub device: Device,
    pub threads: usize,
    pub use_text_orientation: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectOptions {
    pub box_threshold: f32,
    pub model: ModelVariant,
    pub device: Device,
    pub timeout: Option<Duration>,
}

/// Recognized text for one image. Multiple lines are separated by `\n`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OcrOutput {
    pub text: String,
    pub confidence: f32,
}

impl OcrOutput {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// A detected text region in the coordinates of the image passed in.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct TextBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
    pub score: f32,
}

pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    fn supports_gpu(&self) -> bool {
        false
    }

    /// Recognizes every image of the batch; returns exactly one output per
    /// image, in order.
    fn recognize(
        &self,
        batch: &[DynamicImage],
        options: &RecognizeOptions,
    ) -> Result<Vec<OcrOutput>, EngineError>;

    fn detect(
        &self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Vec<TextBox>, EngineError>;
}

/// Runs an external OCR program once per batch.
#[derive(Debug, Clone)]
pub struct ExternalOcrEngine {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
    gpu: bool,
}

impl ExternalOcrEngine {
    /// `command` is the program followed by its leading arguments. Images are
    /// handed over as PNG files created under `scratch_dir`.
    pub fn new(command: &[String], scratch_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EngineError::Failed("no OCR engine command configured".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            scratch_dir: scratch_dir.into(),
            gpu: false,
        })
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    fn stage_images(&self, images: &[&DynamicImage]) -> Result<Vec<NamedTempFile>, EngineError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        images
            .iter()
            .map(|image| {
                let file = tempfile::Builder::new()
                    .prefix("ocr-")
                    .suffix(".png")
                    .tempfile_in(&self.scratch_dir)?;
                image
                    .save_with_format(file.path(), ImageFormat::Png)
                    .map_err(|err| EngineError::Failed(format!("failed to stage image: {err}")))?;
                Ok(file)
            })
            .collect()
    }

    fn invoke(
        &self,
        subcommand: &[String],
        inputs: &[NamedTempFile],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, EngineError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(subcommand)
            .args(inputs.iter().map(|f| f.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(program = %self.program, ?subcommand, images = inputs.len(), "Invoking OCR engine");

        let mut child = command
            .spawn()
            .map_err(|err| EngineError::Failed(format!("failed to start '{}': {err}", self.program)))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_timeout(&mut child, timeout)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let message = String::from_utf8_lossy(&stderr).trim().to_string();
            return Err(EngineError::Failed(format!(
                "'{}' exited with {status}: {message}",
                self.program
            )));
        }
        Ok(stdout)
    }
}

impl OcrEngine for ExternalOcrEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn supports_gpu(&self) -> bool {
        self.gpu
    }

    fn recognize(
        &self,
        batch: &[DynamicImage],
        options: &RecognizeOptions,
    ) -> Result<Vec<OcrOutput>, EngineError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let staged = self.stage_images(&batch.iter().collect::<Vec<_>>())?;
        let mut args = vec![
            "recognize".to_string(),
            "--lang".to_string(),
            options.language.clone(),
            "--model".to_string(),
            options.model.as_str().to_string(),
            "--device".to_string(),
            options.device.as_str().to_string(),
            "--threads".to_string(),
            options.threads.to_string(),
        ];
        if options.use_text_orientation {
            args.push("--text-orientation".to_string());
        }
        let stdout = self.invoke(&args, &staged, options.timeout)?;
        let outputs: Vec<OcrOutput> = serde_json::from_slice(&stdout)
            .map_err(|err| EngineError::Protocol(err.to_string()))?;
        if outputs.len() != batch.len() {
            return Err(EngineError::Protocol(format!(
                "expected {} results, got {}",
                batch.len(),
                outputs.len()
            )));
        }
        Ok(outputs)
    }

    fn detect(
        &self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Vec<TextBox>, EngineError> {
        let staged = self.stage_images(&[image])?;
        let args = vec![
            "detect".to_string(),
            "--box-thresh".to_string(),
            options.box_threshold.to_string(),
            "--model".to_string(),
            options.model.as_str().to_string(),
            "--device".to_string(),
            options.device.as_str().to_string(),
        ];
        let stdout = self.invoke(&args, &staged, options.timeout)?;
        serde_json::from_slice(&stdout).map_err(|err| EngineError::Protocol(err.to_string()))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<std::process::ExitStatus, EngineError> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?);
    };
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Timeout(timeout));
        }
        thread::sleep(Duration::from_millis(10));
    }
}
