//! Poll schedule for a supervisor that lost the exclusion race.
//!
//! The registry has no watch primitive, so the loser polls for the
//! winner's backend record on a geometric schedule.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceBackoff {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RaceBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1),
            factor: 3,
            cap: Duration::from_millis(1000),
        }
    }
}

impl RaceBackoff {
    /// Delay before poll `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            if delay >= self.cap {
                break;
            }
            delay = delay.saturating_mul(self.factor);
        }
        delay.min(self.cap)
    }

    /// The infinite schedule of poll delays.
    pub fn delays(self) -> impl Iterator<Item = Duration> {
        (1u32..).map(move |attempt| self.delay_for_attempt(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_grows_by_three_and_caps() {
        let ms: Vec<u128> = RaceBackoff::default().delays().take(9).map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![1, 3, 9, 27, 81, 243, 729, 1000, 1000]);
    }

    #[test]
    fn large_attempts_stay_capped() {
        let b = RaceBackoff::default();
        assert_eq!(b.delay_for_attempt(1_000), Duration::from_millis(1000));
    }

    #[test]
    fn custom_schedule() {
        let b = RaceBackoff {
            initial: Duration::from_millis(10),
            factor: 2,
            cap: Duration::from_millis(50),
        };
        let ms: Vec<u128> = b.delays().take(5).map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![10, 20, 40, 50, 50]);
    }
}
