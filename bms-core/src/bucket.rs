//! Leaky-bucket failure counter with a hysteretic latch

/// Classifies a link as broken under sustained failures.
///
/// Every failed transaction pours `failure_fill` into the bucket, every
/// successful one drains `success_drain`. The `filled` latch raises once the
/// level reaches `fill_threshold` and only clears again below
/// `clear_threshold`.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LeakyBucket {
    fill_level: u32,
    fill_threshold: u32,
    clear_threshold: u32,
    success_drain: u32,
    failure_fill: u32,
    filled: bool,
}

impl LeakyBucket {
    pub const fn new(
        fill_threshold: u32,
        clear_threshold: u32,
        success_drain: u32,
        failure_fill: u32,
    ) -> Self {
        Self {
            fill_level: 0,
            fill_threshold,
            clear_threshold,
            success_drain,
            failure_fill,
            filled: false,
        }
    }

    /// Record a failed transaction, clamping the level at the fill threshold.
    pub fn failure(&mut self) {
        let remaining = self.fill_threshold - self.fill_level;
        if remaining <= self.failure_fill {
            self.fill_level = self.fill_threshold;
            self.filled = true;
        } else {
            self.fill_level += self.failure_fill;
        }
    }

    /// Record a successful transaction, clamping the level at zero.
    pub fn success(&mut self) {
        self.fill_level = self.fill_level.saturating_sub(self.success_drain);
        if self.fill_level < self.clear_threshold {
            self.filled = false;
        }
    }

    pub fn filled(&self) -> bool {
        self.filled
    }

    pub fn level(&self) -> u32 {
        self.fill_level
    }

    pub fn reset(&mut self) {
        self.fill_level = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Reference comms configuration: trips near a 1:10 sustained
    // failure-to-success ratio.
    fn comms_bucket() -> LeakyBucket {
        LeakyBucket::new(200, 100, 1, 10)
    }

    #[test]
    fn fills_and_latches() {
        let mut bucket = comms_bucket();

        for _ in 0..19 {
            bucket.failure();
        }
        assert!(!bucket.filled());

        bucket.failure();
        assert!(bucket.filled());
        assert_eq!(bucket.level(), 200);
    }

    #[test]
    fn latch_clears_only_below_clear_threshold() {
        let mut bucket = comms_bucket();

        for _ in 0..20 {
            bucket.failure();
        }
        assert!(bucket.filled());

        // Drain down to exactly the clear threshold, still latched.
        for _ in 0..100 {
            bucket.success();
        }
        assert_eq!(bucket.level(), 100);
        assert!(bucket.filled());

        bucket.success();
        assert!(!bucket.filled());
    }

    #[test]
    fn one_in_five_failure_rate_trips_the_latch() {
        let mut bucket = comms_bucket();

        let mut latched_at = None;
        for i in 0..400 {
            if i % 5 == 0 {
                bucket.failure();
            } else {
                bucket.success();
            }
            if bucket.filled() && latched_at.is_none() {
                latched_at = Some(i);
            }
        }

        // Net fill is +6 per 5 transactions, so the latch must trip well
        // before the end of the run and stay tripped.
        assert!(latched_at.is_some());
        assert!(bucket.filled());
    }

    #[test]
    fn one_in_twenty_failure_rate_stays_clear() {
        let mut bucket = comms_bucket();

        for i in 0..4000 {
            if i % 20 == 0 {
                bucket.failure();
            } else {
                bucket.success();
            }
        }

        assert!(!bucket.filled());
    }
}
