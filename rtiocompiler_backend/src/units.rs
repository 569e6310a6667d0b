//! Machine-unit time base.
//!
//! Every timestamp on the timeline is an integer number of machine units
//! (`mu`, one reference period of the RTIO clock). The output hardware only
//! resolves ordering at the granularity of a *coarse cycle* (several mu), which
//! is what the lane distributor compares and what the controllers use as their
//! minimal stagger between logically simultaneous writes.

/// Timestamp or duration in machine units.
pub type Mu = i64;

/// Conversion between seconds and machine units.
///
/// # Example
/// ```
/// use rtiocompiler_backend::units::TimeBase;
///
/// let tb = TimeBase::default();
/// assert_eq!(tb.seconds_to_mu(1e-6), 1000);
/// assert_eq!(tb.coarse(15), 1);
/// assert_eq!(tb.stagger_mu(), 8);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBase {
    ref_period_s: f64,
    coarse_cycle_mu: Mu,
    stagger_cycles: Mu,
}

impl Default for TimeBase {
    fn default() -> Self {
        Self {
            ref_period_s: 1e-9,
            coarse_cycle_mu: 8,
            stagger_cycles: 1,
        }
    }
}

impl TimeBase {
    pub fn new(ref_period_s: f64, coarse_cycle_mu: Mu, stagger_cycles: Mu) -> Self {
        Self {
            ref_period_s,
            coarse_cycle_mu: coarse_cycle_mu.max(1),
            stagger_cycles: stagger_cycles.max(1),
        }
    }

    pub fn ref_period_s(&self) -> f64 {
        self.ref_period_s
    }

    pub fn coarse_cycle_mu(&self) -> Mu {
        self.coarse_cycle_mu
    }

    /// Rounds to the nearest machine unit.
    pub fn seconds_to_mu(&self, seconds: f64) -> Mu {
        (seconds / self.ref_period_s).round() as Mu
    }

    pub fn mu_to_seconds(&self, mu: Mu) -> f64 {
        mu as f64 * self.ref_period_s
    }

    /// Coarse-cycle index of a timestamp (floor, also for negative values).
    pub fn coarse(&self, ts: Mu) -> Mu {
        ts.div_euclid(self.coarse_cycle_mu)
    }

    /// Spacing inserted between logically simultaneous writes.
    pub fn stagger_mu(&self) -> Mu {
        self.stagger_cycles * self.coarse_cycle_mu
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn coarse_floors_negative_timestamps() {
        let tb = TimeBase::default();
        assert_eq!(tb.coarse(0), 0);
        assert_eq!(tb.coarse(7), 0);
        assert_eq!(tb.coarse(8), 1);
        assert_eq!(tb.coarse(-1), -1);
    }

    #[test]
    fn conversions() {
        let tb = TimeBase::new(1e-9, 8, 2);
        assert_eq!(tb.seconds_to_mu(5e-3), 5_000_000);
        assert!((tb.mu_to_seconds(2_500) - 2.5e-6).abs() < 1e-15);
        assert_eq!(tb.stagger_mu(), 16);
    }
}
