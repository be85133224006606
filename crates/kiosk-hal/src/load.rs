//! Aggregate CPU load sampling.

use sysinfo::System;

/// Source of aggregate CPU utilisation samples.
///
/// Each call reports the average utilisation since the previous call, so the
/// caller's sampling interval doubles as the averaging window.
pub trait LoadProbe: Send {
    /// Utilisation in percent, `0.0..=100.0`.
    fn cpu_percent(&mut self) -> f32;
}

/// [`LoadProbe`] backed by `sysinfo`.
pub struct SysinfoLoad {
    system: System,
}

impl SysinfoLoad {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the counters so the first real sample has a baseline.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SysinfoLoad {
    fn cpu_percent(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return 0.0;
        }
        let total: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
        (total / cpus.len() as f32).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_a_percentage() {
        let mut probe = SysinfoLoad::new();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        let sample = probe.cpu_percent();
        assert!((0.0..=100.0).contains(&sample), "got {sample}");
    }
}
