//! Time keeping module
//!
//! The protocol only ever needs a monotonic millisecond reading. Every node
//! measures time as milliseconds elapsed since it started, corrected by the
//! offset learned from a better synchronized peer:
//!
//! ```text
//! adjusted = (now - start) - offset
//! ```
//!
//! # Examples
//!
//! ```
//! use peer_time_sync::time::{Clock, ManualClock, util};
//!
//! let clock = ManualClock::starting_at(1_000);
//! clock.advance(250);
//! assert_eq!(util::adjusted(clock.now_ms(), 1_000, 50), 200);
//! ```

mod source;

pub use self::source::{Clock, ManualClock, MonotonicClock};

/// Utility functions for time arithmetic
pub mod util {
    /// Milliseconds elapsed since `start`
    pub fn elapsed(now: i64, start: i64) -> i64 {
        now.wrapping_sub(start)
    }

    /// Elapsed time corrected by the synchronization offset
    pub fn adjusted(now: i64, start: i64, offset: i64) -> i64 {
        elapsed(now, start).wrapping_sub(offset)
    }

    /// Whether more than `limit` milliseconds separate `since` and `now`
    pub fn exceeded(now: i64, since: i64, limit: i64) -> bool {
        now.wrapping_sub(since) > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjusted_time() {
        assert_eq!(util::adjusted(1_500, 500, 0), 1_000);
        assert_eq!(util::adjusted(1_500, 500, 200), 800);
        assert_eq!(util::adjusted(1_500, 500, -200), 1_200);
    }

    #[test]
    fn test_adjusted_time_can_go_negative() {
        assert_eq!(util::adjusted(100, 0, 400), -300);
    }

    #[test]
    fn test_exceeded() {
        assert!(!util::exceeded(5_000, 0, 5_000));
        assert!(util::exceeded(5_001, 0, 5_000));
    }
}
