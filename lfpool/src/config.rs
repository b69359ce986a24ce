//! Pool sizing and behavior knobs

use std::time::Duration;

use crate::bucket::ContendedRelease;

/// Largest per-class threshold ever used
pub const MAX_CLASS_THRESHOLD: u64 = 0x7fff_ffff;

/// How much memory the pool as a whole may keep around
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryBudget {
    /// A percentage of physical memory
    FractionOfSystem { percent: u8 },
    /// An absolute number of bytes
    Bytes(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub budget: MemoryBudget,
    /// Floor applied to whatever `budget` works out to
    pub min_usable: u64,
    /// Number of fixed size classes, class `i` holds blocks of `2^i` bytes
    pub classes: usize,
    /// Upper bound on how long the reclaim worker sleeps between passes
    pub reclaim_interval: Duration,
    pub contended_release: ContendedRelease,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            budget: MemoryBudget::FractionOfSystem { percent: 10 },
            min_usable: 1024 * 1024,
            classes: 20,
            reclaim_interval: Duration::from_millis(1000),
            contended_release: ContendedRelease::Defer,
        }
    }
}

impl PoolConfig {
    pub fn with_budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_min_usable(mut self, min_usable: u64) -> Self {
        self.min_usable = min_usable;
        self
    }

    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_reclaim_interval(mut self, reclaim_interval: Duration) -> Self {
        self.reclaim_interval = reclaim_interval;
        self
    }

    pub fn with_contended_release(mut self, contended_release: ContendedRelease) -> Self {
        self.contended_release = contended_release;
        self
    }

    /// Total bytes the pool may hold on to
    pub fn usable_memory(&self) -> u64 {
        let budget = match self.budget {
            MemoryBudget::FractionOfSystem { percent } => total_system_memory()
                .map(|total| total / 100 * u64::from(percent))
                .unwrap_or(0),
            MemoryBudget::Bytes(bytes) => bytes,
        };
        budget.max(self.min_usable)
    }

    /// Bytes each fixed class may hold on to
    pub fn class_threshold(&self) -> usize {
        let per_class = self.usable_memory() / (self.classes.max(1) as u64);
        per_class.min(MAX_CLASS_THRESHOLD) as usize
    }
}

/// Physical memory installed, if it can be found out
#[cfg(target_os = "linux")]
pub fn total_system_memory() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&contents)
}

#[cfg(not(target_os = "linux"))]
pub fn total_system_memory() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_total(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    kb.checked_mul(1024)
}
