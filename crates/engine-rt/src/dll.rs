//! Second order delay-locked loop tracking a device's period clock.
//!
//! Fed with the wall-clock time of every period wake-up, the loop filters
//! scheduling jitter out of the timestamps and yields a smoothed estimate of
//! the true period length. The ratio between the nominal and the estimated
//! period is the device's speed relative to the host clock.

use std::f64::consts::{PI, SQRT_2};

/// Default loop bandwidth in Hz.
pub const DEFAULT_DLL_BANDWIDTH: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct DelayLockedLoop {
    b: f64,
    c: f64,
    /// Filtered start of the current period, seconds.
    t0: f64,
    /// Predicted start of the next period, seconds.
    t1: f64,
    /// Filtered period length, seconds.
    e2: f64,
    nominal: f64,
    initialized: bool,
}

impl DelayLockedLoop {
    pub fn new(sample_rate: u32, period: u32, bandwidth: f64) -> Self {
        let nominal = f64::from(period) / f64::from(sample_rate.max(1));
        let omega = 2.0 * PI * bandwidth * nominal;
        Self {
            b: SQRT_2 * omega,
            c: omega * omega,
            t0: 0.0,
            t1: 0.0,
            e2: nominal,
            nominal,
            initialized: false,
        }
    }

    /// Restarts tracking at `now`, discarding the accumulated estimate.
    pub fn reset(&mut self, now: f64) {
        self.e2 = self.nominal;
        self.t0 = now;
        self.t1 = now + self.e2;
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Feeds the wake-up time of one period. The first call after a reset
    /// only seeds the loop.
    pub fn update(&mut self, now: f64) {
        if !self.initialized {
            self.reset(now);
            return;
        }
        let error = now - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * error + self.e2;
        self.e2 += self.c * error;
    }

    /// Filtered period length in seconds.
    pub fn period_estimate(&self) -> f64 {
        self.e2
    }

    pub fn nominal_period(&self) -> f64 {
        self.nominal
    }

    /// Nominal over estimated period; above 1.0 the device runs fast.
    pub fn speed(&self) -> f64 {
        if self.e2 > 0.0 {
            self.nominal / self.e2
        } else {
            1.0
        }
    }

    pub fn cycle_start(&self) -> f64 {
        self.t0
    }

    pub fn next_cycle_start(&self) -> f64 {
        self.t1
    }
}
