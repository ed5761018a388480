use std::fs::{self, File};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use hardsub::area::SubtitleArea;
use hardsub::config::{AreaFallback, ModelVariant, RunConfig, WorkerCount};
use hardsub::observability::{MetricsSnapshot, log_snapshot};
use hardsub::ocr::ExternalOcrEngine;
use hardsub::pipeline::SubtitleExtractor;
use hardsub::progress::{ProgressEvent, Stage};
use hardsub::scheduler::{DevicePolicy, ResourcePlanner, probe_cores};
use hardsub::validation::validate_config;
use hardsub::video::{ImageSequenceSource, VideoSource};
use hardsub::writer::{SrtWriter, SubtitleWriter};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Extract(args) => extract(args),
        Commands::Validate { config } => validate_config_cmd(&config),
        Commands::InitConfig { output, force } => init_config(&output, force),
        Commands::Plan { config, cores } => print_plan(config.as_deref(), cores),
    }
}

fn configure_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn extract(args: ExtractArgs) -> Result<()> {
    let ExtractArgs {
        frames,
        fps,
        config: config_path,
        output,
        overrides,
        print_metrics,
        metrics_json,
        metrics_prometheus,
        summary_json,
        no_progress,
    } = args;

    let mut config = match &config_path {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    overrides.apply(&mut config);

    let source = ImageSequenceSource::open(&frames, fps)?;
    let info = source.info();
    info!(
        frames = info.frame_count,
        fps = info.frame_rate,
        width = info.width,
        height = info.height,
        duration_s = info.duration().as_secs_f64(),
        source = %frames.display(),
        "Opened frame sequence"
    );

    let scratch = tempfile::Builder::new()
        .prefix("hardsub-ocr-")
        .tempdir()
        .context("Failed to create OCR scratch directory")?;
    let engine = ExternalOcrEngine::new(&config.ocr_engine.command, scratch.path())
        .map_err(|err| anyhow!("{err}; set ocr_engine.command or pass --engine"))?
        .with_gpu(config.performance.device_policy == DevicePolicy::GpuPreferred);

    let extractor = SubtitleExtractor::new(&config, &engine).with_label(frames.to_string_lossy());
    let show_progress = !no_progress && io::stdout().is_terminal();
    let mut bar = ProgressBar::default();
    let mut render = |event: &ProgressEvent| {
        if show_progress {
            bar.render(event);
        }
    };
    let report = extractor.extract(&source, &mut render)?;

    let writer = SrtWriter;
    let output = output.unwrap_or_else(|| writer.default_path(&frames));
    writer.write(&report.cues, &output)?;
    if show_progress {
        println!("\x1b[32mExtracted {} subtitle(s) to {}\x1b[0m", report.cues.len(), output.display());
    }

    if let Some(dir) = &report.cache_dir {
        info!(path = %dir.display(), "Intermediate files retained");
    }

    if let (Some(count), Some(path)) = (report.summary.tuned_cpu_processes, &config_path) {
        persist_tuning(path, count)?;
    }

    let snapshot = &report.summary.metrics;
    if print_metrics {
        log_snapshot(snapshot);
    }
    if let Some(path) = metrics_json {
        write_json(&path, snapshot, "metrics")?;
    }
    if let Some(path) = metrics_prometheus {
        write_prometheus(&path, snapshot)?;
    }
    if let Some(path) = summary_json {
        write_json(&path, &report.summary, "run summary")?;
    }
    Ok(())
}

/// Stores the tuned CPU process count in the user's config file, leaving
/// every other value as it was on disk.
fn persist_tuning(path: &Path, cpu_processes: usize) -> Result<()> {
    let mut on_disk = RunConfig::load(path)?;
    if on_disk.performance.cpu_processes == WorkerCount::Fixed(cpu_processes) {
        return Ok(());
    }
    on_disk.performance.cpu_processes = WorkerCount::Fixed(cpu_processes);
    on_disk.save(path)?;
    info!(
        config = %path.display(),
        cpu_processes,
        "Saved tuned CPU process count"
    );
    Ok(())
}

fn validate_config_cmd(path: &Path) -> Result<()> {
    let config = RunConfig::load(path)?;
    let report = validate_config(&config);

    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %path.display(), "Config validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Config validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!(
            "Config file '{}' already exists; pass --force to overwrite",
            output.display()
        );
    }
    RunConfig::default().save(output)?;
    info!(config = %output.display(), "Default config written");
    Ok(())
}

fn print_plan(config_path: Option<&Path>, cores: Option<i64>) -> Result<()> {
    let config = match config_path {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    let cores = cores.map(Ok).unwrap_or_else(probe_cores);
    let planner = ResourcePlanner::detect(config.performance.device_policy, false);
    let outcome = planner.plan(cores, &config.performance);
    if let Some(err) = &outcome.fallback {
        warn!(error = %err, "Hardware introspection failed");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    create_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what} JSON: {}", path.display()))?;
    info!(path = %path.display(), "{what} JSON written");
    Ok(())
}

fn write_prometheus(path: &Path, snapshot: &MetricsSnapshot) -> Result<()> {
    create_parent(path)?;
    fs::write(path, snapshot.to_prometheus())
        .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
    info!(metrics = %path.display(), "Prometheus metrics written");
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Single-line console bar, redrawn in place.
#[derive(Default)]
struct ProgressBar {
    stage: Option<Stage>,
}

impl ProgressBar {
    const WIDTH: usize = 30;

    fn render(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StageStarted { stage, total } => {
                if self.stage.is_some() && self.stage != Some(*stage) {
                    println!();
                }
                self.stage = Some(*stage);
                self.draw(*stage, 0, *total);
            }
            ProgressEvent::BatchCompleted {
                stage,
                completed,
                total,
            } => {
                if self.stage != Some(*stage) {
                    println!();
                    self.stage = Some(*stage);
                }
                self.draw(*stage, *completed, *total);
            }
            ProgressEvent::Finished { .. } => {
                if self.stage.take().is_some() {
                    println!();
                }
            }
        }
    }

    fn draw(&self, stage: Stage, completed: usize, total: usize) {
        let fraction = if total == 0 {
            1.0
        } else {
            (completed as f64 / total as f64).clamp(0.0, 1.0)
        };
        let filled = ((fraction * Self::WIDTH as f64).round() as usize).min(Self::WIDTH);
        let empty = Self::WIDTH - filled;
        let percent = (fraction * 100.0).round() as i32;
        print!(
            "\r{:>5}/{:<5} [{}{}] {:>3}% {:<16}",
            completed,
            total,
            "=".repeat(filled),
            " ".repeat(empty),
            percent,
            stage.as_str()
        );
        let _ = io::stdout().flush();
    }
}

#[derive(Parser)]
#[command(
    name = "hardsub",
    version,
    about = "Extract hardcoded subtitles from video frames"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Also write logs to this file.
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract subtitles from a directory of decoded frames.
    Extract(ExtractArgs),
    /// Check a config file without running anything.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Write a config file holding every default.
    InitConfig {
        #[arg(long, default_value = "hardsub.yaml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Print the resource plan for this machine.
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pretend the machine has this many logical cores.
        #[arg(long, allow_negative_numbers = true)]
        cores: Option<i64>,
    },
}

#[derive(Args)]
struct ExtractArgs {
    /// Directory of frame images, sorted by file name.
    frames: PathBuf,
    #[arg(long)]
    fps: f64,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Subtitle file to write (default: <FRAMES>.srt).
    #[arg(long, short)]
    output: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "summary-json")]
    summary_json: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

/// Flags that take precedence over the config file.
#[derive(Args, Default)]
struct Overrides {
    /// "x1 y1 x2 y2"; skips area detection.
    #[arg(long)]
    sub_area: Option<SubtitleArea>,
    #[arg(long)]
    start_frame: Option<u64>,
    #[arg(long)]
    stop_frame: Option<u64>,
    #[arg(long)]
    split_start: Option<f64>,
    #[arg(long)]
    split_stop: Option<f64>,
    #[arg(long)]
    sample_count: Option<usize>,
    #[arg(long)]
    x_padding: Option<f64>,
    #[arg(long)]
    y_padding: Option<u32>,
    #[arg(long)]
    bbox_drop_score: Option<f32>,
    #[arg(long)]
    no_search_area: bool,
    #[arg(long, value_enum)]
    area_fallback: Option<AreaFallback>,
    #[arg(long)]
    frequency: Option<u64>,
    #[arg(long)]
    frame_batch_size: Option<usize>,
    #[arg(long)]
    text_batch_size: Option<usize>,
    #[arg(long)]
    drop_score: Option<f32>,
    #[arg(long)]
    no_line_break: bool,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    similarity_threshold: Option<f64>,
    #[arg(long)]
    min_consecutive_sub_dur_ms: Option<f64>,
    #[arg(long)]
    max_consecutive_short_durs: Option<usize>,
    #[arg(long)]
    min_sub_duration_ms: Option<f64>,
    #[arg(long)]
    lang: Option<String>,
    #[arg(long, value_enum)]
    model: Option<ModelVariant>,
    #[arg(long)]
    text_orientation: bool,
    /// OCR engine program.
    #[arg(long)]
    engine: Option<String>,
    /// Leading argument for the OCR engine program (repeatable).
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,
    /// "auto" or a count.
    #[arg(long)]
    cpu_processes: Option<WorkerCount>,
    #[arg(long)]
    cpu_threads: Option<WorkerCount>,
    #[arg(long)]
    gpu_processes: Option<WorkerCount>,
    #[arg(long, value_enum)]
    device_policy: Option<DevicePolicy>,
    #[arg(long)]
    no_auto_optimize: bool,
    #[arg(long)]
    keep_cache: bool,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut RunConfig) {
        if self.sub_area.is_some() {
            config.sub_area = self.sub_area;
        }
        if self.start_frame.is_some() {
            config.start_frame = self.start_frame;
        }
        if self.stop_frame.is_some() {
            config.stop_frame = self.stop_frame;
        }

        let detection = &mut config.detection;
        set(&mut detection.split_start, self.split_start);
        set(&mut detection.split_stop, self.split_stop);
        set(&mut detection.sample_count, self.sample_count);
        set(&mut detection.x_rel_padding, self.x_padding);
        set(&mut detection.y_abs_padding, self.y_padding);
        set(&mut detection.bbox_drop_score, self.bbox_drop_score);
        set(&mut detection.fallback, self.area_fallback);
        if self.no_search_area {
            detection.use_search_area = false;
        }

        set(&mut config.frame_extraction.frequency, self.frequency);
        set(&mut config.frame_extraction.batch_size, self.frame_batch_size);

        let text = &mut config.text_extraction;
        set(&mut text.batch_size, self.text_batch_size);
        set(&mut text.drop_score, self.drop_score);
        if self.no_line_break {
            text.line_break = false;
        }
        if self.timeout_ms.is_some() {
            text.timeout_ms = self.timeout_ms;
        }

        let generator = &mut config.subtitle_generator;
        set(&mut generator.similarity_threshold, self.similarity_threshold);
        set(
            &mut generator.min_consecutive_sub_dur_ms,
            self.min_consecutive_sub_dur_ms,
        );
        set(
            &mut generator.max_consecutive_short_durs,
            self.max_consecutive_short_durs,
        );
        set(&mut generator.min_sub_duration_ms, self.min_sub_duration_ms);

        let ocr = &mut config.ocr_engine;
        set(&mut ocr.language, self.lang);
        set(&mut ocr.model, self.model);
        if self.text_orientation {
            ocr.use_text_orientation = true;
        }
        if let Some(program) = self.engine {
            ocr.command = std::iter::once(program).chain(self.engine_args).collect();
        }

        let perf = &mut config.performance;
        set(&mut perf.cpu_processes, self.cpu_processes);
        set(&mut perf.cpu_threads, self.cpu_threads);
        set(&mut perf.gpu_processes, self.gpu_processes);
        set(&mut perf.device_policy, self.device_policy);
        if self.no_auto_optimize {
            perf.auto_optimize = false;
        }

        if self.keep_cache {
            config.cache.keep = true;
        }
        if self.cache_dir.is_some() {
            config.cache.root = self.cache_dir;
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}
