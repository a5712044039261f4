//! Time keeping
//!
//! A monotonic tick counter driven by the periodic timer interrupt, plus a
//! coarse wall clock advanced on every tick. The tick counter is the unit
//! for all sleep deadlines.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config;
use crate::kern::sched;
use crate::types::Tick;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Coarse wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

static WALL_CLOCK: Mutex<Timespec> = Mutex::new(Timespec { sec: 0, nsec: 0 });

/// Timer rate in Hz, from the boot configuration.
pub fn periodicity_hz() -> u32 {
    config::get().timer_hz.max(1)
}

/// Current tick count.
pub fn get_ticks() -> Tick {
    TICKS.load(Ordering::Relaxed)
}

/// `true` when `a` is strictly before `b`, tolerating wrap-around.
pub fn is_tick_before(a: Tick, b: Tick) -> bool {
    (b.wrapping_sub(a) as i64) > 0
}

/// `true` when `a` is at or past `b`, tolerating wrap-around.
pub fn is_tick_after(a: Tick, b: Tick) -> bool {
    !is_tick_before(a, b)
}

/// Convert a millisecond interval to ticks, delaying at least one tick.
pub fn ms_to_ticks(ms: u64) -> Tick {
    let ms_per_tick = (1000 / periodicity_hz() as u64).max(1);
    (ms / ms_per_tick).max(1)
}

/// Set the wall-clock time, typically from the RTC during boot.
pub fn set_time(ts: Timespec) {
    *WALL_CLOCK.lock() = ts;
}

/// Current wall-clock time.
pub fn get_time() -> Timespec {
    *WALL_CLOCK.lock()
}

/// Periodic timer callback, invoked by the timer driver on the boot CPU.
///
/// Advances the tick counter and the wall clock, then asks the scheduler to
/// re-evaluate once the interrupt unwinds.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);

    {
        let mut now = WALL_CLOCK.lock();
        now.nsec += 1_000_000_000 / periodicity_hz();
        while now.nsec >= 1_000_000_000 {
            now.sec += 1;
            now.nsec -= 1_000_000_000;
        }
    }

    sched::request_reschedule();
}

#[cfg(test)]
pub fn test_set_ticks(value: Tick) {
    TICKS.store(value, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_ordering() {
        assert!(is_tick_before(5, 10));
        assert!(!is_tick_before(10, 5));
        assert!(is_tick_after(10, 10));
        assert!(is_tick_after(11, 10));
        // Wrap-around: u64::MAX is just before 0
        assert!(is_tick_before(u64::MAX, 2));
    }

    #[test]
    fn test_ms_conversion_rounds_up_to_one_tick() {
        // 100 Hz default: 10 ms per tick
        assert_eq!(ms_to_ticks(50), 5);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(3), 1);
        assert_eq!(ms_to_ticks(0), 1);
    }

    #[test]
    fn test_wall_clock_advance() {
        let _guard = crate::testsync::lock();
        crate::kern::pcpu::test_boot();
        set_time(Timespec { sec: 100, nsec: 999_999_999 });
        let before = get_ticks();
        on_tick();
        assert_eq!(get_ticks(), before + 1);
        let now = get_time();
        assert_eq!(now.sec, 101);
        assert!(now.nsec < 1_000_000_000);

        // The tick also requested a reschedule; clean up for other tests.
        crate::kern::pcpu::current_thread()
            .clear_flags(crate::kern::thread::flags::RESCHEDULE);
    }
}
