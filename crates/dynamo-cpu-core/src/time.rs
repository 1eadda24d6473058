//! Wall-clock source for the scheduler's timeout queue and for the RDTSC
//! helper.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }

    pub fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn deadline_after(&self, delay: Duration) -> u64 {
        self.now_nanos() + delay.as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn deadline_is_strictly_after_now() {
        let clock = Clock::new();
        let now = clock.now_nanos();
        let deadline = clock.deadline_after(Duration::from_millis(1));
        assert!(deadline > now);
    }
}
