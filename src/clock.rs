use std::time::Instant;

/// Monotonic time source. All scheduler timestamps are milliseconds since
/// the clock was created, which happens once at process start.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since process start.
    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1e3
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
    use std::thread;
    use std::time::Duration;

    #[test]
    fn clock_advances_monotonically() {
        let clock = Clock::new();
        let t0 = clock.now_ms();
        thread::sleep(Duration::from_millis(5));
        let t1 = clock.now_ms();
        assert!(t0 >= 0.0);
        assert!(t1 > t0, "clock must advance: {t0} -> {t1}");
    }

    #[test]
    fn copies_share_the_origin() {
        let clock = Clock::new();
        let copy = clock;
        assert!((clock.now_ms() - copy.now_ms()).abs() < 1.0);
    }
}
