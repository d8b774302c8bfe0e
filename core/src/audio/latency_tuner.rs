//! Latency tuner: watches buffer fill and steers the resampler ratio.
//!
//! The tuner never changes more than ±`max_deviation` (0.5% by default), so
//! over any window of a second or more the produced sample count stays within
//! one sample of nominal while the buffer level drifts toward the target.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::time::Nanos;

/// Tuning aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyProfile {
    /// No tuning; the scaling factor is always exactly 1.0.
    Intact,
    /// Fast convergence, for low-latency links that can tolerate small
    /// pitch deviations.
    Responsive,
    /// Slow convergence, for smooth playback on jittery links.
    Gradual,
}

/// Default bound on the scaling factor deviation from 1.0.
pub const DEFAULT_MAX_DEVIATION: f64 = 0.005;

/// Number of observations folded into one controller step.
const DECIMATION: u32 = 8;

/// Proportional-integral controller producing the resampler scaling factor.
#[derive(Debug)]
pub struct LatencyTuner {
    profile: LatencyProfile,
    target_ns: Nanos,
    max_deviation: f64,
    kp: f64,
    ki: f64,
    integral: f64,
    accum: f64,
    accum_count: u32,
    scaling: f64,
    last_latency_ns: Nanos,
}

impl LatencyTuner {
    /// Creates a tuner holding `target_ns` of buffered latency.
    pub fn new(profile: LatencyProfile, target_ns: Nanos) -> Self {
        let (kp, ki) = match profile {
            LatencyProfile::Intact => (0.0, 0.0),
            LatencyProfile::Responsive => (5e-3, 1e-4),
            LatencyProfile::Gradual => (1e-3, 2e-5),
        };
        LatencyTuner {
            profile,
            target_ns: target_ns.max(1),
            max_deviation: DEFAULT_MAX_DEVIATION,
            kp,
            ki,
            integral: 0.0,
            accum: 0.0,
            accum_count: 0,
            scaling: 1.0,
            last_latency_ns: 0,
        }
    }

    /// Profile this tuner was created with.
    pub fn profile(&self) -> LatencyProfile {
        self.profile
    }

    /// Latency observed at the last update.
    pub fn last_latency(&self) -> Nanos {
        self.last_latency_ns
    }

    /// Feeds one latency observation (buffered duration in nanoseconds).
    pub fn observe(&mut self, latency_ns: Nanos) {
        self.last_latency_ns = latency_ns;
        if self.profile == LatencyProfile::Intact {
            return;
        }

        let error = (latency_ns - self.target_ns) as f64 / self.target_ns as f64;
        self.accum += error;
        self.accum_count += 1;
        if self.accum_count < DECIMATION {
            return;
        }

        let error = self.accum / self.accum_count as f64;
        self.accum = 0.0;
        self.accum_count = 0;

        self.integral = (self.integral + error).clamp(-50.0, 50.0);
        let raw = 1.0 + self.kp * error + self.ki * self.integral;
        self.scaling = raw.clamp(1.0 - self.max_deviation, 1.0 + self.max_deviation);

        debug!(
            latency_ns,
            target_ns = self.target_ns,
            scaling = self.scaling,
            "latency tuner step"
        );
    }

    /// Current scaling factor for the resampler, in
    /// `[1 - max_deviation, 1 + max_deviation]`.
    pub fn scaling(&self) -> f64 {
        self.scaling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MILLISECOND;

    const TARGET: Nanos = 100 * MILLISECOND;

    fn run(tuner: &mut LatencyTuner, latency: Nanos, steps: u32) {
        for _ in 0..steps {
            tuner.observe(latency);
        }
    }

    #[test]
    fn test_intact_never_tunes() {
        let mut tuner = LatencyTuner::new(LatencyProfile::Intact, TARGET);
        run(&mut tuner, 10 * TARGET, 1000);
        assert_eq!(tuner.scaling(), 1.0);
    }

    #[test]
    fn test_overfull_buffer_speeds_up() {
        let mut tuner = LatencyTuner::new(LatencyProfile::Responsive, TARGET);
        run(&mut tuner, 2 * TARGET, 64);
        assert!(tuner.scaling() > 1.0);
        assert!(tuner.scaling() <= 1.0 + DEFAULT_MAX_DEVIATION);
    }

    #[test]
    fn test_underfull_buffer_slows_down() {
        let mut tuner = LatencyTuner::new(LatencyProfile::Responsive, TARGET);
        run(&mut tuner, TARGET / 4, 64);
        assert!(tuner.scaling() < 1.0);
        assert!(tuner.scaling() >= 1.0 - DEFAULT_MAX_DEVIATION);
    }

    #[test]
    fn test_scaling_stays_clamped() {
        let mut tuner = LatencyTuner::new(LatencyProfile::Responsive, TARGET);
        run(&mut tuner, 1000 * TARGET, 10_000);
        assert_eq!(tuner.scaling(), 1.0 + DEFAULT_MAX_DEVIATION);
        run(&mut tuner, 0, 10_000);
        assert_eq!(tuner.scaling(), 1.0 - DEFAULT_MAX_DEVIATION);
    }

    #[test]
    fn test_gradual_reacts_slower_than_responsive() {
        let mut gradual = LatencyTuner::new(LatencyProfile::Gradual, TARGET);
        let mut responsive = LatencyTuner::new(LatencyProfile::Responsive, TARGET);
        run(&mut gradual, 110 * MILLISECOND, 16);
        run(&mut responsive, 110 * MILLISECOND, 16);
        assert!(gradual.scaling() > 1.0);
        assert!(gradual.scaling() < responsive.scaling());
    }

    #[test]
    fn test_on_target_is_neutral() {
        let mut tuner = LatencyTuner::new(LatencyProfile::Gradual, TARGET);
        run(&mut tuner, TARGET, 256);
        assert!((tuner.scaling() - 1.0).abs() < 1e-9);
    }
}
