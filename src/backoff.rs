// SPDX-License-Identifier: Apache-2.0
//! Exponential backoff with full jitter, shared by the session and global
//! sockets (`spec.md` §4.3, §4.4, §5).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Compute the next delay and advance the attempt counter. Full jitter:
    /// uniform in `[0, min(max, base * 2^attempt)]`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(20); // avoid overflow in 2^exp
        let cap = self.base.saturating_mul(1u32 << exp).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        if cap.is_zero() {
            return cap;
        }
        let jittered_millis = rand::thread_rng().gen_range(0..=cap.as_millis().max(1) as u64);
        Duration::from_millis(jittered_millis)
    }

    /// Reset the attempt counter on a successful connection (`spec.md` §4.3).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_bounded_by_base() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let d = b.next_delay();
        assert!(d <= Duration::from_secs(1));
    }

    #[test]
    fn delay_grows_then_caps_at_max() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(4));
        }
    }

    #[test]
    fn reset_returns_attempt_counter_to_zero() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }
}
