//! Resource planning: how many OCR workers to run and where.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PerformanceConfig;
use crate::error::ResourcePlanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DevicePolicy {
    #[default]
    Auto,
    CpuOnly,
    GpuPreferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker counts for one run. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourcePlan {
    pub cpu_process_count: usize,
    pub gpu_process_count: usize,
    pub cpu_thread_count: usize,
    pub use_gpu: bool,
}

impl ResourcePlan {
    pub fn minimal() -> Self {
        Self {
            cpu_process_count: 1,
            gpu_process_count: 1,
            cpu_thread_count: 1,
            use_gpu: false,
        }
    }

    /// Workers that run recognition on the CPU lane.
    pub fn cpu_workers(&self) -> usize {
        self.cpu_process_count.max(1)
    }

    /// Workers that run recognition on the GPU lane (0 without GPU).
    pub fn gpu_workers(&self) -> usize {
        if self.use_gpu {
            self.gpu_process_count.max(1)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: ResourcePlan,
    /// Set when introspection failed and the minimal plan was used.
    pub fallback: Option<ResourcePlanError>,
}

#[derive(Debug, Clone)]
pub struct ResourcePlanner {
    policy: DevicePolicy,
    gpu_available: bool,
}

impl ResourcePlanner {
    pub fn new(policy: DevicePolicy, gpu_available: bool) -> Self {
        Self {
            policy,
            gpu_available,
        }
    }

    /// Combines the engine's own GPU report with the environment override.
    pub fn detect(policy: DevicePolicy, engine_supports_gpu: bool) -> Self {
        Self::new(policy, engine_supports_gpu || detect_gpu())
    }

    pub fn use_gpu(&self) -> bool {
        match self.policy {
            DevicePolicy::CpuOnly => false,
            DevicePolicy::GpuPreferred => {
                if !self.gpu_available {
                    warn!("GPU preferred but unavailable; falling back to CPU workers");
                }
                self.gpu_available
            }
            DevicePolicy::Auto => self.gpu_available,
        }
    }

    pub fn plan(
        &self,
        cores: Result<i64, ResourcePlanError>,
        overrides: &PerformanceConfig,
    ) -> PlanOutcome {
        let use_gpu = self.use_gpu();
        let (mut plan, fallback) = match cores {
            Ok(cores) if cores >= 1 => (default_plan(cores, use_gpu), None),
            Ok(cores) => (
                ResourcePlan::minimal(),
                Some(ResourcePlanError(format!(
                    "hardware reported {cores} logical core(s)"
                ))),
            ),
            Err(err) => (ResourcePlan::minimal(), Some(err)),
        };
        if let Some(err) = &fallback {
            warn!(error = %err, "Using minimal resource plan");
        }
        plan.use_gpu = use_gpu;

        if let Some(n) = overrides.cpu_processes.fixed() {
            plan.cpu_process_count = n;
        }
        if let Some(n) = overrides.cpu_threads.fixed() {
            plan.cpu_thread_count = n;
        }
        if let Some(n) = overrides.gpu_processes.fixed() {
            plan.gpu_process_count = n;
        }
        plan.cpu_process_count = plan.cpu_process_count.max(1);
        plan.cpu_thread_count = plan.cpu_thread_count.max(1);
        plan.gpu_process_count = plan.gpu_process_count.max(1);

        debug!(?plan, policy = ?self.policy, "Resource plan computed");
        PlanOutcome { plan, fallback }
    }
}

fn default_plan(cores: i64, use_gpu: bool) -> ResourcePlan {
    let cores = usize::try_from(cores).unwrap_or(1);
    ResourcePlan {
        cpu_process_count: (cores / 2).max(1),
        cpu_thread_count: ((cores as f64 / 2.5) as usize).max(4),
        gpu_process_count: (cores / 3).max(2),
        use_gpu,
    }
}

/// Logical core count as reported by the OS.
pub fn probe_cores() -> Result<i64, ResourcePlanError> {
    let cores = num_cpus::get();
    if cores == 0 {
        return Err(ResourcePlanError("core count unavailable".into()));
    }
    i64::try_from(cores).map_err(|err| ResourcePlanError(err.to_string()))
}

fn detect_gpu() -> bool {
    // Engines that cannot report their own device support are enabled through
    // the environment.
    std::env::var("HARDSUB_FORCE_GPU")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Engine busy time observed across the recognition workers of one lane.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Utilization {
    pub busy: Duration,
    pub wall: Duration,
    pub workers: usize,
}

impl Utilization {
    pub fn ratio(&self) -> Option<f64> {
        let capacity = self.wall.as_secs_f64() * self.workers as f64;
        (capacity > 0.0).then(|| (self.busy.as_secs_f64() / capacity).min(1.0))
    }
}

/// Suggests a CPU process count for the next run from this run's
/// utilisation. Returns `None` when the current count should stay.
pub fn tune_cpu_processes(plan: &ResourcePlan, usage: &Utilization, cores: usize) -> Option<usize> {
    let ratio = usage.ratio()?;
    let current = plan.cpu_process_count;
    if ratio < 0.80 && current < cores.max(1) {
        info!(
            utilization = format!("{:.1}%", ratio * 100.0),
            "Workers under-utilized; recommending one more CPU process"
        );
        Some(current + 1)
    } else if ratio > 0.95 && current > 1 {
        warn!(
            utilization = format!("{:.1}%", ratio * 100.0),
            "Workers saturated; recommending one fewer CPU process"
        );
        Some(current - 1)
    } else {
        debug!(utilization = ratio, "CPU process count unchanged");
        None
    }
}
