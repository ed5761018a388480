use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::area::SubtitleArea;
use crate::scheduler::DevicePolicy;

/// Every tunable of an extraction run.
///
/// Defaults live in the `Default` impls of the section structs and nowhere
/// else; a YAML file only needs to name the values it changes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Explicit subtitle area. Skips area detection when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_area: Option<SubtitleArea>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_frame: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_frame: Option<u64>,
    pub detection: DetectionConfig,
    pub frame_extraction: FrameExtractionConfig,
    pub text_extraction: TextExtractionConfig,
    pub subtitle_generator: SubtitleGeneratorConfig,
    pub ocr_engine: OcrEngineConfig,
    pub performance: PerformanceConfig,
    pub cache: CacheConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RunConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let rendered = serde_yaml::to_string(self)?;
        std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AreaFallback {
    /// Use the lower band of the frame when detection finds nothing.
    #[default]
    DefaultArea,
    /// Abort the run with `NoSubtitleAreaFound`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub split_start: f64,
    pub split_stop: f64,
    pub sample_count: usize,
    pub x_rel_padding: f64,
    pub y_abs_padding: u32,
    pub bbox_drop_score: f32,
    pub use_search_area: bool,
    pub fallback: AreaFallback,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            split_start: 0.25,
            split_stop: 0.50,
            sample_count: 200,
            x_rel_padding: 0.85,
            y_abs_padding: 15,
            bbox_drop_score: 0.7,
            use_search_area: true,
            fallback: AreaFallback::DefaultArea,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FrameExtractionConfig {
    /// Sample every n-th frame.
    pub frequency: u64,
    pub batch_size: usize,
}

impl Default for FrameExtractionConfig {
    fn default() -> Self {
        Self {
            frequency: 2,
            batch_size: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TextExtractionConfig {
    pub batch_size: usize,
    pub drop_score: f32,
    pub line_break: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TextExtractionConfig {
    pub fn line_separator(&self) -> &'static str {
        if self.line_break { "\n" } else { " " }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for TextExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            drop_score: 0.6,
            line_break: true,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubtitleGeneratorConfig {
    pub similarity_threshold: f64,
    /// Longest non-text gap (ms) that is still bridged as flicker.
    pub min_consecutive_sub_dur_ms: f64,
    /// Most interruptions a bridged gap may contain.
    pub max_consecutive_short_durs: usize,
    pub min_sub_duration_ms: f64,
}

impl Default for SubtitleGeneratorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            min_consecutive_sub_dur_ms: 500.0,
            max_consecutive_short_durs: 4,
            min_sub_duration_ms: 120.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    #[default]
    Mobile,
    Server,
}

impl ModelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OcrEngineConfig {
    pub language: String,
    pub model: ModelVariant,
    pub use_text_orientation: bool,
    /// External engine program followed by its leading arguments.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl Default for OcrEngineConfig {
    fn default() -> Self {
        Self {
            language: "ch".to_string(),
            model: ModelVariant::Mobile,
            use_text_orientation: false,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub cpu_processes: WorkerCount,
    pub cpu_threads: WorkerCount,
    pub gpu_processes: WorkerCount,
    pub device_policy: DevicePolicy,
    pub auto_optimize: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cpu_processes: WorkerCount::Auto,
            cpu_threads: WorkerCount::Auto,
            gpu_processes: WorkerCount::Auto,
            device_policy: DevicePolicy::Auto,
            auto_optimize: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Parent directory for run caches. Defaults to `<tmp>/hardsub`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    pub keep: bool,
}

impl CacheConfig {
    pub fn resolved_root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("hardsub"))
    }
}

/// A worker count that is either derived from the hardware or pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "CountRepr", into = "CountRepr")]
pub enum WorkerCount {
    #[default]
    Auto,
    Fixed(usize),
}

impl WorkerCount {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Self::Auto => None,
            Self::Fixed(n) => Some(*n),
        }
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        trimmed
            .parse::<usize>()
            .map(Self::Fixed)
            .map_err(|_| format!("expected 'auto' or a count, got '{trimmed}'"))
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum CountRepr {
    Count(usize),
    Text(String),
}

impl TryFrom<CountRepr> for WorkerCount {
    type Error = String;

    fn try_from(value: CountRepr) -> Result<Self, Self::Error> {
        match value {
            CountRepr::Count(n) => Ok(Self::Fixed(n)),
            CountRepr::Text(s) => s.parse(),
        }
    }
}

impl From<WorkerCount> for CountRepr {
    fn from(value: WorkerCount) -> Self {
        match value {
            WorkerCount::Auto => CountRepr::Text("auto".to_string()),
            WorkerCount::Fixed(n) => CountRepr::Count(n),
        }
    }
}
