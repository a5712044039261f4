//! Common types used across the kernel
//!
//! This module defines shared identifier and time types to avoid circular
//! dependencies between subsystems.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A scheduler tick; the unit of time for sleep deadlines.
pub type Tick = u64;

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Create a new process ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        ProcessId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Inode identifier, unique per mounted filesystem instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InodeId(pub u64);

/// CPU affinity of a thread: run anywhere, or pinned to one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// Thread may be picked up by any CPU
    #[default]
    Any,
    /// Thread only runs on the given CPU
    Fixed(u32),
}

impl CpuAffinity {
    /// Whether a CPU is allowed to run a thread with this affinity
    pub fn allows(self, cpu: u32) -> bool {
        match self {
            CpuAffinity::Any => true,
            CpuAffinity::Fixed(id) => id == cpu,
        }
    }

    /// Encode for atomic storage (-1 means any)
    pub fn to_raw(self) -> i64 {
        match self {
            CpuAffinity::Any => -1,
            CpuAffinity::Fixed(id) => id as i64,
        }
    }

    /// Decode from atomic storage
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            CpuAffinity::Any
        } else {
            CpuAffinity::Fixed(raw as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_uniqueness() {
        let a = ThreadId::new();
        let b = ThreadId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_affinity() {
        assert!(CpuAffinity::Any.allows(0));
        assert!(CpuAffinity::Any.allows(7));
        assert!(CpuAffinity::Fixed(2).allows(2));
        assert!(!CpuAffinity::Fixed(2).allows(3));
    }

    #[test]
    fn test_affinity_raw_round_trip() {
        assert_eq!(CpuAffinity::from_raw(CpuAffinity::Any.to_raw()), CpuAffinity::Any);
        assert_eq!(
            CpuAffinity::from_raw(CpuAffinity::Fixed(5).to_raw()),
            CpuAffinity::Fixed(5)
        );
    }
}
