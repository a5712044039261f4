//! Boot-time kernel configuration
//!
//! A single structure handed to `init()` by the platform bringup code. It
//! describes the machine (CPU count, timer rate, physical memory layout) and
//! the path of the initial process binary. There is no runtime
//! reconfiguration; the structure is captured once and read-only afterwards.

use heapless::{String, Vec};
use spin::Once;

/// Maximum number of memory map entries carried by the boot configuration.
pub const MAX_MEMORY_RANGES: usize = 32;

/// Maximum length of the initial process path.
pub const MAX_INIT_PATH: usize = 64;

/// Kind of a physical memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Free RAM the kernel may hand out as page frames
    Usable,
    /// Firmware/kernel-occupied memory that must never be allocated
    Reserved,
}

/// One contiguous physical memory range, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
    pub kind: MemoryKind,
}

impl MemoryRange {
    pub const fn usable(start: u64, end: u64) -> Self {
        Self { start, end, kind: MemoryKind::Usable }
    }

    pub const fn reserved(start: u64, end: u64) -> Self {
        Self { start, end, kind: MemoryKind::Reserved }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Boot-time configuration, filled in by platform bringup.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Number of CPUs to bring online (including the BSP)
    pub cpu_count: u32,
    /// Periodic timer rate in Hz
    pub timer_hz: u32,
    /// Physical memory layout, usable and reserved ranges
    pub memory_map: Vec<MemoryRange, MAX_MEMORY_RANGES>,
    /// Path of the initial process binary
    pub init_path: String<MAX_INIT_PATH>,
}

impl BootConfig {
    /// A single-CPU configuration with the default 100 Hz timer and an
    /// empty memory map; bringup code fills in the rest.
    pub fn new() -> Self {
        Self {
            cpu_count: 1,
            timer_hz: 100,
            memory_map: Vec::new(),
            init_path: String::new(),
        }
    }

    /// Sum of usable memory bytes in the map.
    pub fn usable_memory(&self) -> u64 {
        self.memory_map
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .map(|r| r.len())
            .sum()
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::new()
    }
}

static CONFIG: Once<BootConfig> = Once::new();

/// Capture the boot configuration. Later calls keep the first value.
pub fn set(config: BootConfig) {
    CONFIG.call_once(|| config);
}

/// The captured boot configuration, or defaults if bringup never set one.
pub fn get() -> &'static BootConfig {
    CONFIG.call_once(BootConfig::new)
}
