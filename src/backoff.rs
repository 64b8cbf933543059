use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `initial * multiplier^attempt`, clamped to `max`.
///
/// Pure: the caller owns the sleeping, so polling loops stay testable under
/// paused tokio time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Backoff {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            multiplier: 1.5,
            max_ms: 10_000,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.powi(exponent);
        let max = self.max_ms as f64;
        let clamped = if raw.is_nan() || raw < 0.0 {
            0.0
        } else if raw > max {
            max
        } else {
            raw
        };
        Duration::from_millis(clamped as u64)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(1500));
        assert_eq!(backoff.delay(2), Duration::from_millis(2250));
        assert_eq!(backoff.delay(10), backoff.ceiling());
        assert_eq!(backoff.delay(u32::MAX), backoff.ceiling());
    }

    #[test]
    fn monotonic() {
        let backoff = Backoff {
            initial_ms: 10,
            multiplier: 2.0,
            max_ms: 5_000,
        };
        let delays: Vec<_> = (0..20).map(|a| backoff.delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
