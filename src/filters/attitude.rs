// attitude.rs — Body→world orientation tracker
//
// Gyro integration in quaternion form, nudged toward gravity by the
// accelerometer and toward magnetic reference by the magnetometer.
// World frame: z up, x along the horizontal magnetic field.

use std::collections::VecDeque;

use crate::angle;
use crate::config::AttitudeConfig;
use crate::smoothing::{HeadingSmoother, HeadingUpdate, LowPassFilter, RollingVariance};
use crate::types::{
    orthonormalize, secs_between, AttitudeState, Channel, Mat3, Quat, SensorSample, Vec3,
    GRAVITY,
};

/// Integration steps longer than this many nominal periods are clamped.
const MAX_DT_PERIODS: f64 = 5.0;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttitudeCounters {
    pub gravity_corrections: u64,
    pub mag_corrections: u64,
    pub mag_gated: u64,
    pub heading_rejections: u64,
    pub heading_reseeds: u64,
}

pub struct AttitudeTracker {
    config: AttitudeConfig,
    nominal_dt: f64,
    q_bw: Quat,
    initialized: bool,
    last_t: Option<u64>,

    accel_lpf: LowPassFilter,
    accel_variance: RollingVariance,
    gyro_ema: f64,

    mag_field_ref: Option<f64>,
    mag_confidence: f64,

    smoother: HeadingSmoother,
    heading: f64,
    history: VecDeque<(u64, f64)>,

    omega_world: Vec3,
    is_stable: bool,
    stability_ms: u32,
    unstable_since: Option<u64>,
    last_variance: f64,

    pub counters: AttitudeCounters,
}

impl AttitudeTracker {
    pub fn new(config: &AttitudeConfig, sample_rate_hz: f64) -> Self {
        let window = (config.variance_window_s * sample_rate_hz).round().max(2.0) as usize;
        Self {
            config: config.clone(),
            nominal_dt: 1.0 / sample_rate_hz,
            q_bw: Quat::identity(),
            initialized: false,
            last_t: None,
            accel_lpf: LowPassFilter::new(config.accel_lpf_cutoff_hz, sample_rate_hz),
            accel_variance: RollingVariance::new(window),
            gyro_ema: 0.0,
            mag_field_ref: None,
            mag_confidence: 0.0,
            smoother: HeadingSmoother::new(
                config.heading_jump_deg.to_radians(),
                config.heading_reseed_after,
            ),
            heading: 0.0,
            history: VecDeque::new(),
            omega_world: Vec3::zeros(),
            is_stable: false,
            stability_ms: 0,
            unstable_since: None,
            last_variance: 0.0,
            counters: AttitudeCounters::default(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Process one calibrated body-frame sample.
    pub fn update(&mut self, sample: &SensorSample) -> AttitudeState {
        let accel_ok = sample.valid.has(Channel::Accel);
        let gyro_ok = sample.valid.has(Channel::Gyro);
        let mag_ok = sample.valid.has(Channel::Mag);

        if !self.initialized {
            if accel_ok {
                let mag = if mag_ok { Some(&sample.mag) } else { None };
                if let Some(q) = align_to_gravity(&sample.accel, mag) {
                    self.q_bw = q;
                    self.initialized = true;
                    self.last_t = Some(sample.t_ns);
                    let yaw = self.yaw();
                    self.smoother.seed(yaw);
                    self.heading = yaw;
                    self.push_history(sample.t_ns);
                    log::debug!("attitude aligned, heading {:.1}°", yaw.to_degrees());
                }
            }
            return self.state();
        }

        let dt = match self.last_t {
            Some(last) => {
                secs_between(last, sample.t_ns).clamp(0.0, self.nominal_dt * MAX_DT_PERIODS)
            }
            None => self.nominal_dt,
        };
        self.last_t = Some(sample.t_ns);

        // ── Gyro integration ──
        if gyro_ok && dt > 0.0 {
            self.q_bw *= Quat::from_scaled_axis(sample.gyro * dt);
            self.q_bw.renormalize();
            debug_assert!((self.q_bw.quaternion().norm() - 1.0).abs() < 1e-9);
        }
        let gyro_norm = if gyro_ok { sample.gyro.norm() } else { 0.0 };
        self.gyro_ema += self.config.gyro_ema_alpha * (gyro_norm - self.gyro_ema);

        // ── Accel statistics (low-passed) ──
        let variance = if accel_ok {
            let filtered = self.accel_lpf.update(sample.accel);
            self.accel_variance.push(filtered)
        } else {
            self.last_variance
        };
        self.last_variance = variance;

        if accel_ok {
            self.correct_gravity(&sample.accel, variance);
        }

        self.mag_confidence = if mag_ok {
            let c = self.score_mag(&sample.mag);
            self.correct_mag(&sample.mag, c);
            c
        } else {
            0.0
        };

        // ── Heading ──
        let gain = self.config.heading_gain_min
            + (self.config.heading_gain_max - self.config.heading_gain_min) * self.mag_confidence;
        match self.smoother.update(self.yaw(), gain) {
            HeadingUpdate::Accepted(h) => self.heading = h,
            HeadingUpdate::Rejected => self.counters.heading_rejections += 1,
            HeadingUpdate::Reseeded(h) => {
                self.counters.heading_rejections += 1;
                self.counters.heading_reseeds += 1;
                log::warn!("heading smoother re-seeded at {:.1}°", h.to_degrees());
                self.heading = h;
            }
        }
        self.push_history(sample.t_ns);

        // ── Stability ──
        self.omega_world = if gyro_ok {
            self.q_bw * sample.gyro
        } else {
            Vec3::zeros()
        };
        self.is_stable =
            variance < self.config.stable_accel_variance && gyro_norm < self.config.stable_gyro;
        if self.is_stable {
            self.stability_ms = self
                .stability_ms
                .saturating_add((dt * 1000.0).round() as u32);
            self.unstable_since = None;
        } else {
            self.stability_ms = 0;
            if self.unstable_since.is_none() {
                self.unstable_since = Some(sample.t_ns);
            }
        }

        self.state()
    }

    fn correct_gravity(&mut self, accel: &Vec3, variance: f64) {
        let norm = accel.norm();
        if (norm - GRAVITY).abs() >= self.config.gravity_gate
            || variance >= self.config.gravity_variance_gate
        {
            return;
        }
        let a_world = self.q_bw * accel;
        let down = Vec3::new(0.0, 0.0, -1.0);
        if let Some(err) = Quat::rotation_between(&a_world, &down) {
            let correction = Quat::from_scaled_axis(err.scaled_axis() * self.config.alpha_acc);
            self.q_bw = correction * self.q_bw;
            self.q_bw.renormalize();
            self.counters.gravity_corrections += 1;
        }
    }

    /// Confidence in the magnetometer: field magnitude near the learned local
    /// magnitude and little recent rotation.
    fn score_mag(&mut self, mag: &Vec3) -> f64 {
        let norm = mag.norm();
        if norm.is_nan() || norm <= 1.0 {
            return 0.0;
        }
        let reference = *self.mag_field_ref.get_or_insert(norm);
        let dev = (norm - reference).abs() / reference;
        let tol = self.config.mag_field_tolerance;

        let field_score = if dev <= tol {
            1.0 - 0.5 * dev / tol
        } else {
            (0.5 - 1.5 * (dev - tol)).max(0.0)
        };
        if dev <= tol {
            self.mag_field_ref = Some(reference + self.config.mag_field_alpha * (norm - reference));
        }

        let quiet = self.config.mag_quiet_gyro;
        let motion_score = if self.gyro_ema < quiet {
            1.0
        } else {
            (quiet / self.gyro_ema).max(0.5)
        };
        (field_score * motion_score).clamp(0.0, 1.0)
    }

    fn correct_mag(&mut self, mag: &Vec3, confidence: f64) {
        if confidence < self.config.mag_min_confidence {
            self.counters.mag_gated += 1;
            return;
        }
        let m_world = self.q_bw * mag;
        if m_world.xy().norm() < 1e-6 {
            return;
        }
        let err = m_world.y.atan2(m_world.x);
        let gain = self.config.alpha_mag_base * confidence;
        let correction = Quat::from_scaled_axis(Vec3::z() * (-gain * err));
        self.q_bw = correction * self.q_bw;
        self.q_bw.renormalize();
        self.counters.mag_corrections += 1;
    }

    fn yaw(&self) -> f64 {
        angle::wrap(self.q_bw.euler_angles().2)
    }

    fn push_history(&mut self, t_ns: u64) {
        self.history.push_back((t_ns, self.heading));
        let horizon = (self.config.heading_history_s * 1e9) as u64;
        while let Some(&(t, _)) = self.history.front() {
            if t_ns.saturating_sub(t) > horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Smoothed heading at `t_ns`: latest entry not after `t_ns`, else the oldest kept.
    pub fn heading_at(&self, t_ns: u64) -> f64 {
        self.history
            .iter()
            .rev()
            .find(|(t, _)| *t <= t_ns)
            .or_else(|| self.history.front())
            .map_or(self.heading, |(_, h)| *h)
    }

    pub fn heading(&self) -> f64 {
        self.heading
    }

    pub fn q_bw(&self) -> Quat {
        self.q_bw
    }

    /// Upward dynamic acceleration `−(R_bw·a)_z − g`. None before alignment or if the
    /// projection is not finite.
    pub fn vertical_accel(&self, accel: &Vec3) -> Option<f64> {
        if !self.initialized {
            return None;
        }
        let a_v = -(self.q_bw * accel).z - GRAVITY;
        a_v.is_finite().then_some(a_v)
    }

    /// |ω_world,z| below the steady threshold.
    pub fn heading_steady(&self) -> bool {
        self.omega_world.z.abs() < self.config.heading_steady_rate
    }

    /// How long the tracker has been unstable at `t_ns`, zero when stable.
    pub fn unstable_ms(&self, t_ns: u64) -> u64 {
        self.unstable_since
            .map_or(0, |since| t_ns.saturating_sub(since) / 1_000_000)
    }

    pub fn gyro_activity(&self) -> f64 {
        self.gyro_ema
    }

    pub fn state(&self) -> AttitudeState {
        AttitudeState {
            q_bw: self.q_bw,
            omega_world: self.omega_world,
            is_stable: self.is_stable,
            stability_ms: self.stability_ms,
            accel_variance: self.last_variance as f32,
            mag_confidence: self.mag_confidence,
            heading: self.heading,
        }
    }

    /// Restart the integration clock at `t_ns` without touching orientation.
    pub fn reseed_time(&mut self, t_ns: u64) {
        if self.initialized {
            self.last_t = Some(t_ns);
        }
    }
}

/// TRIAD alignment: world up from gravity, world x from the horizontal magnetic
/// field (or the body x axis when no field is available).
pub fn align_to_gravity(accel: &Vec3, mag: Option<&Vec3>) -> Option<Quat> {
    let norm = accel.norm();
    if norm.is_nan() || norm <= 1e-3 {
        return None;
    }
    let up = -accel / norm;

    let horizontal = |v: &Vec3| {
        let h = v - up * v.dot(&up);
        (h.norm() > 1e-6).then(|| h.normalize())
    };
    let x_w = mag
        .and_then(|m| horizontal(m))
        .or_else(|| horizontal(&Vec3::x()))
        .or_else(|| horizontal(&Vec3::y()))?;
    let y_w = up.cross(&x_w);

    let r_bw = Mat3::from_rows(&[x_w.transpose(), y_w.transpose(), up.transpose()]);
    let rot = orthonormalize(&r_bw)?;
    Some(Quat::from_rotation_matrix(&rot))
}
