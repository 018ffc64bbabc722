use std::collections::VecDeque;

use crate::angle;
use crate::types::Vec3;

/// First-order IIR low-pass on a 3-vector.
#[derive(Clone, Debug)]
pub struct LowPassFilter {
    alpha: f64,
    last_output: Vec3,
    initialized: bool,
}

impl LowPassFilter {
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        let dt = 1.0 / sample_rate_hz;
        let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
        let alpha = dt / (rc + dt);
        Self {
            alpha,
            last_output: Vec3::zeros(),
            initialized: false,
        }
    }

    pub fn update(&mut self, input: Vec3) -> Vec3 {
        if !self.initialized {
            self.last_output = input;
            self.initialized = true;
            return input;
        }
        self.last_output = self.last_output * (1.0 - self.alpha) + input * self.alpha;
        self.last_output
    }

    pub fn output(&self) -> Vec3 {
        self.last_output
    }

    pub fn reset(&mut self) {
        self.initialized = false;
        self.last_output = Vec3::zeros();
    }
}

/// Total variance (sum over axes) of the last `capacity` vectors.
#[derive(Clone, Debug)]
pub struct RollingVariance {
    window: VecDeque<Vec3>,
    capacity: usize,
    sum: Vec3,
    sum_sq: Vec3,
}

impl RollingVariance {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: Vec3::zeros(),
            sum_sq: Vec3::zeros(),
        }
    }

    pub fn push(&mut self, v: Vec3) -> f64 {
        if self.window.len() == self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
                self.sum_sq -= old.component_mul(&old);
            }
        }
        self.sum += v;
        self.sum_sq += v.component_mul(&v);
        self.window.push_back(v);
        self.variance()
    }

    pub fn variance(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let n = n as f64;
        let mean = self.sum / n;
        let var = self.sum_sq / n - mean.component_mul(&mean);
        // Running sums can dip a hair below zero.
        var.iter().map(|v| v.max(0.0)).sum()
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.sum = Vec3::zeros();
        self.sum_sq = Vec3::zeros();
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HeadingUpdate {
    Accepted(f64),
    /// Raw reading jumped too far from the previous one; output unchanged.
    Rejected,
    /// Jumps persisted, the smoother restarted at the raw reading.
    Reseeded(f64),
}

/// Wrapped exponential filter for headings with jump rejection.
#[derive(Clone, Debug)]
pub struct HeadingSmoother {
    value: Option<f64>,
    last_raw: f64,
    jump_limit: f64,
    reseed_after: u32,
    rejected_run: u32,
    pub rejected_total: u64,
}

impl HeadingSmoother {
    pub fn new(jump_limit_rad: f64, reseed_after: u32) -> Self {
        Self {
            value: None,
            last_raw: 0.0,
            jump_limit: jump_limit_rad,
            reseed_after: reseed_after.max(1),
            rejected_run: 0,
            rejected_total: 0,
        }
    }

    pub fn update(&mut self, raw: f64, gain: f64) -> HeadingUpdate {
        let raw = angle::wrap(raw);
        let Some(current) = self.value else {
            self.seed(raw);
            return HeadingUpdate::Accepted(raw);
        };

        if angle::diff(raw, self.last_raw).abs() > self.jump_limit {
            self.rejected_run += 1;
            self.rejected_total += 1;
            if self.rejected_run >= self.reseed_after {
                self.seed(raw);
                return HeadingUpdate::Reseeded(raw);
            }
            return HeadingUpdate::Rejected;
        }

        self.rejected_run = 0;
        self.last_raw = raw;
        let next = angle::blend(current, raw, gain.clamp(0.0, 1.0));
        self.value = Some(next);
        HeadingUpdate::Accepted(next)
    }

    pub fn seed(&mut self, heading: f64) {
        let heading = angle::wrap(heading);
        self.value = Some(heading);
        self.last_raw = heading;
        self.rejected_run = 0;
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
