//! Clock and time types for pipeline synchronization.
//!
//! This module provides:
//! - [`ClockTime`]: A nanosecond timestamp type (8 bytes, Copy)
//! - [`Clock`]: Trait for monotonic time sources
//! - [`SystemClock`]: Monotonic system clock

use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// ClockTime
// ============================================================================

/// Time in nanoseconds (8 bytes, Copy).
///
/// Represents time as nanoseconds since an arbitrary epoch (usually
/// pipeline start). Buffers carry a `ClockTime` presentation timestamp.
///
/// # Special Values
///
/// - `ClockTime::ZERO`: Zero time
/// - `ClockTime::NONE`: Invalid/unset time (sentinel value)
/// - `ClockTime::MAX`: Maximum representable time
///
/// # Examples
///
/// ```rust
/// use aqueduct::clock::ClockTime;
///
/// let t1 = ClockTime::from_secs(1);
/// let t2 = ClockTime::from_millis(500);
/// let t3 = t1 + t2;
///
/// assert_eq!(t3.millis(), 1500);
/// assert_eq!(format!("{}", t3), "1.500s");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Maximum representable time (one less than the NONE sentinel).
    pub const MAX: Self = Self(u64::MAX - 1);

    /// Invalid/unset time (sentinel value).
    pub const NONE: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Get the raw nanosecond value.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get the value in microseconds (truncating).
    #[inline]
    pub const fn micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get the value in milliseconds (truncating).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get the value in seconds (truncating).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Check if this is a valid (set) time.
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }

    /// Check if this is the NONE sentinel.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Saturating addition; NONE is absorbing.
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            return Self::NONE;
        }
        let sum = self.0.saturating_add(rhs.0);
        if sum == u64::MAX {
            Self::MAX
        } else {
            Self(sum)
        }
    }

    /// Saturating subtraction; NONE is absorbing.
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        if self.is_none() || rhs.is_none() {
            return Self::NONE;
        }
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos().min(u64::MAX as u128 - 1) as u64)
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(if t.is_none() { 0 } else { t.0 })
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        write!(f, "{}.{:03}s", self.secs(), self.millis() % 1_000)
    }
}

// ============================================================================
// Clock trait
// ============================================================================

/// A monotonic time source consumed by stages for pacing.
pub trait Clock: Send + Sync {
    /// Get the current time on this clock.
    fn now(&self) -> ClockTime;
}

/// Shared clock handle.
pub type ClockRef = Arc<dyn Clock>;

/// Monotonic system clock based on [`Instant`].
///
/// Time starts at zero when the clock is created.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Create a new system clock with its epoch at "now".
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> ClockTime {
        self.start.elapsed().into()
    }
}
