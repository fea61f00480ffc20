use std::{
    cmp,
    ops::Div,
    time::Duration,
};

use rand::Rng;

/// Exponential backoff with full jitter. See
/// <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    /// Forces the next `fail()` to return `max_backoff`.
    pub fn set_max_backoff(&mut self) {
        self.num_failures = u32::MAX.div(2);
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.gen::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut rng = rand::thread_rng();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let d = backoff.fail(&mut rng);
            assert!(d <= Duration::from_secs(1));
            last = d;
        }
        let _ = last;
        assert!(backoff.failures() == 20);
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            backoff.fail(&mut rng);
        }
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }
}
