//! Monotonic-clock helpers (`SPEC_FULL.md` section 1 ambient stack).
//!
//! `coarsetime` backs the `events` batch import timestamp (`spec.md`
//! section 3: "set by the pipeline at ingest boundary, monotonic within a
//! single source"). A coarse, cached clock is the right tool here: sources
//! stamp every batch they emit, so the cost of a full `SystemTime::now()`
//! syscall per batch would otherwise scale with event volume rather than
//! with wall-clock time.

use coarsetime::Clock;

/// Nanoseconds since an arbitrary epoch fixed for the process's lifetime.
/// Monotonic within a process, as `spec.md` section 3 requires; not
/// comparable across processes or wall-clock-accurate.
pub fn now_nanos() -> i64 {
    Clock::now_since_epoch().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_nanos_is_monotonic_within_a_process() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }
}
