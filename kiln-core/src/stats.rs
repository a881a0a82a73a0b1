//! CPU, RAM and accelerator memory readouts for the status bar.

use serde::Serialize;
use sysinfo::System;

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct GpuMemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl GpuMemoryUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

/// Source of accelerator memory figures. `None` means no accelerator is visible.
pub trait GpuMemory: Send {
    fn query(&self) -> Option<GpuMemoryUsage>;
}

/// Reads the first NVIDIA device through `nvidia-smi`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvidiaSmi;

impl GpuMemory for NvidiaSmi {
    fn query(&self) -> Option<GpuMemoryUsage> {
        let output = std::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses the first line of `memory.used,memory.total` CSV output (MiB).
fn parse_nvidia_smi(stdout: &str) -> Option<GpuMemoryUsage> {
    let line = stdout.trim().lines().next()?;
    let (used, total) = line.split_once(',')?;
    let used: u64 = used.trim().parse().ok()?;
    let total: u64 = total.trim().parse().ok()?;
    Some(GpuMemoryUsage {
        used_bytes: used << 20,
        total_bytes: total << 20,
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpu;

impl GpuMemory for NoGpu {
    fn query(&self) -> Option<GpuMemoryUsage> {
        None
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub gpu: Option<GpuMemoryUsage>,
}

impl StatsSnapshot {
    pub fn vram_display(&self) -> String {
        match &self.gpu {
            Some(gpu) => format!(
                "{:.1}GB / {:.1}GB ({:.0}%)",
                gpu.used_bytes as f64 / GIB,
                gpu.total_bytes as f64 / GIB,
                gpu.percent()
            ),
            None => "N/A".to_string(),
        }
    }

    pub fn to_html(&self) -> String {
        format!(
            concat!(
                r#"<div class="stats">"#,
                "<span>CPU: {:.1}%</span>",
                "<span>RAM: {:.1}%</span>",
                "<span>VRAM: {}</span>",
                "</div>"
            ),
            self.cpu_percent,
            self.ram_percent,
            self.vram_display()
        )
    }
}

pub struct StatsProbe {
    system: System,
    gpu: Box<dyn GpuMemory>,
}

impl StatsProbe {
    pub fn new(gpu: Box<dyn GpuMemory>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first sample.
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system, gpu }
    }

    /// Probe for the local machine.
    pub fn detect() -> Self {
        Self::new(Box::new(NvidiaSmi))
    }

    pub fn sample(&mut self) -> StatsSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let ram_percent = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        StatsSnapshot {
            cpu_percent: self.system.global_cpu_usage(),
            ram_percent,
            gpu: self.gpu.query(),
        }
    }
}
