//! Pocket calibration.
//!
//! While the user walks, collect a window of raw samples and estimate sensor
//! biases plus the fixed rotation between the phone and the walker's body:
//! body z is up (against mean gravity), body x is the principal horizontal
//! axis of motion.

use nalgebra::SymmetricEigen;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::CalibrationConfig;
use crate::error::{PdrError, PdrResult};
use crate::types::{
    orthogonality_error, orthonormalize, Channel, Mat3, Rot3, SensorSample, Vec3, GRAVITY,
    NANOS_PER_SEC,
};

/// Size of the persisted record: 21 little-endian f32 + one i64.
pub const CALIBRATION_RECORD_LEN: usize = 21 * 4 + 8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationSnapshot {
    pub accel_bias: Vec3,
    pub gyro_bias: Vec3,
    pub mag_bias: Vec3,
    pub r_body_to_phone: Rot3,
    pub avg_gravity_body: Vec3,
    /// Monotonic ns; the snapshot is stale once `now >= valid_until_ns`.
    pub valid_until_ns: i64,
}

impl CalibrationSnapshot {
    /// Zero biases, phone frame taken as body frame.
    pub fn identity(valid_until_ns: i64) -> Self {
        Self {
            accel_bias: Vec3::zeros(),
            gyro_bias: Vec3::zeros(),
            mag_bias: Vec3::zeros(),
            r_body_to_phone: Rot3::identity(),
            avg_gravity_body: Vec3::new(0.0, 0.0, -GRAVITY),
            valid_until_ns,
        }
    }

    pub fn r_phone_to_body(&self) -> Rot3 {
        self.r_body_to_phone.inverse()
    }

    pub fn is_valid_at(&self, now_ns: u64) -> bool {
        (now_ns as i128) < self.valid_until_ns as i128
    }

    /// Bias-correct a raw phone-frame sample and rotate it into the body frame.
    pub fn apply(&self, sample: &SensorSample) -> SensorSample {
        let r = self.r_phone_to_body();
        SensorSample {
            t_ns: sample.t_ns,
            accel: r * (sample.accel - self.accel_bias),
            gyro: r * (sample.gyro - self.gyro_bias),
            mag: r * (sample.mag - self.mag_bias),
            valid: sample.valid,
        }
    }

    /// Fixed little-endian record: biases, row-major rotation, gravity (f32), validity (i64).
    pub fn to_bytes(&self) -> [u8; CALIBRATION_RECORD_LEN] {
        let m = self.r_body_to_phone.matrix();
        let mut floats = Vec::with_capacity(21);
        floats.extend(self.accel_bias.iter());
        floats.extend(self.gyro_bias.iter());
        floats.extend(self.mag_bias.iter());
        for row in 0..3 {
            for col in 0..3 {
                floats.push(&m[(row, col)]);
            }
        }
        floats.extend(self.avg_gravity_body.iter());

        let mut out = [0u8; CALIBRATION_RECORD_LEN];
        for (i, v) in floats.into_iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&(*v as f32).to_le_bytes());
        }
        out[84..92].copy_from_slice(&self.valid_until_ns.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> PdrResult<Self> {
        if bytes.len() != CALIBRATION_RECORD_LEN {
            return Err(PdrError::CorruptCalibration(format!(
                "expected {} bytes, got {}",
                CALIBRATION_RECORD_LEN,
                bytes.len()
            )));
        }
        let mut floats = [0f64; 21];
        for (i, chunk) in bytes[..84].chunks_exact(4).enumerate() {
            let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
            floats[i] = f32::from_le_bytes(raw) as f64;
        }
        if floats.iter().any(|v| !v.is_finite()) {
            return Err(PdrError::CorruptCalibration(
                "non-finite value in record".to_string(),
            ));
        }
        let mut validity = [0u8; 8];
        validity.copy_from_slice(&bytes[84..92]);

        let vec_at = |i: usize| Vec3::new(floats[i], floats[i + 1], floats[i + 2]);
        let m = Mat3::from_row_slice(&floats[9..18]);
        if orthogonality_error(&m) > 1e-3 || m.determinant() <= 0.0 {
            return Err(PdrError::CorruptCalibration(
                "stored matrix is not a rotation".to_string(),
            ));
        }
        let r_body_to_phone = orthonormalize(&m).ok_or_else(|| {
            PdrError::CorruptCalibration("stored matrix could not be orthonormalized".to_string())
        })?;

        Ok(Self {
            accel_bias: vec_at(0),
            gyro_bias: vec_at(3),
            mag_bias: vec_at(6),
            r_body_to_phone,
            avg_gravity_body: vec_at(18),
            valid_until_ns: i64::from_le_bytes(validity),
        })
    }
}

/// Calibration as seen by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationState {
    Valid(CalibrationSnapshot),
    /// Coarse fallback after a failed calibration; tracking runs with reduced trust.
    Degraded(CalibrationSnapshot),
}

impl CalibrationState {
    pub fn snapshot(&self) -> &CalibrationSnapshot {
        match self {
            CalibrationState::Valid(s) | CalibrationState::Degraded(s) => s,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, CalibrationState::Degraded(_))
    }

    /// Only a valid, unexpired calibration skips the bootstrap.
    pub fn is_valid_at(&self, now_ns: u64) -> bool {
        match self {
            CalibrationState::Valid(s) => s.is_valid_at(now_ns),
            CalibrationState::Degraded(_) => false,
        }
    }

    /// Identity calibration marked degraded, expiring immediately.
    pub fn degraded_identity(now_ns: u64) -> Self {
        CalibrationState::Degraded(CalibrationSnapshot::identity(now_ns as i64))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStep {
    Collecting,
    WaitingForSteps,
    Complete,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationProgress {
    pub step: CalibrationStep,
    pub progress: f64,
    pub message: String,
    pub is_complete: bool,
}

/// Bootstrap calibrator fed with raw phone-frame samples.
pub struct PocketCalibrator {
    config: CalibrationConfig,
    window: VecDeque<SensorSample>,
    step_times: VecDeque<u64>,
    started_ns: Option<u64>,
    samples_seen: usize,
    progress: f64,
}

impl PocketCalibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            config: config.clone(),
            window: VecDeque::with_capacity(config.samples),
            step_times: VecDeque::new(),
            started_ns: None,
            samples_seen: 0,
            progress: 0.0,
        }
    }

    pub fn start(&mut self, now_ns: u64) {
        self.window.clear();
        self.step_times.clear();
        self.started_ns = Some(now_ns);
        self.samples_seen = 0;
        self.progress = 0.0;
        log::info!(
            "pocket calibration started ({} samples, {:.0} s timeout)",
            self.config.samples,
            self.config.timeout_s
        );
    }

    pub fn is_running(&self) -> bool {
        self.started_ns.is_some()
    }

    /// Add a raw sample; returns a progress report every `progress_every` samples.
    pub fn push(&mut self, sample: &SensorSample) -> Option<CalibrationProgress> {
        self.started_ns?;
        if self.window.len() == self.config.samples {
            self.window.pop_front();
        }
        self.window.push_back(*sample);
        self.samples_seen += 1;
        self.trim_steps();

        if self.samples_seen % self.config.progress_every != 0 {
            return None;
        }
        let collected = (self.window.len() as f64 / self.config.samples as f64).min(1.0);
        let steps = (self.step_times.len() as f64 / self.config.min_steps as f64).min(1.0);
        // Monotonic and never 1.0 until the estimate is done.
        self.progress = self.progress.max((0.8 * collected + 0.2 * steps).min(0.99));

        let (step, message) = if self.window.len() < self.config.samples {
            (
                CalibrationStep::Collecting,
                format!("collecting {}/{}", self.window.len(), self.config.samples),
            )
        } else {
            (
                CalibrationStep::WaitingForSteps,
                format!(
                    "keep walking: {}/{} steps",
                    self.step_times.len(),
                    self.config.min_steps
                ),
            )
        };
        Some(CalibrationProgress {
            step,
            progress: self.progress,
            message,
            is_complete: false,
        })
    }

    pub fn record_step(&mut self, t_ns: u64) {
        self.step_times.push_back(t_ns);
        self.trim_steps();
    }

    /// Drop steps that have slid out of the sample window.
    fn trim_steps(&mut self) {
        let Some(oldest) = self.window.front().map(|s| s.t_ns) else {
            return;
        };
        while let Some(&t) = self.step_times.front() {
            if t < oldest {
                self.step_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn steps_in_window(&self) -> usize {
        self.step_times.len()
    }

    /// Finished estimate, timeout failure, or None while still collecting.
    pub fn poll(&mut self, now_ns: u64) -> Option<PdrResult<CalibrationSnapshot>> {
        let started = self.started_ns?;

        if self.window.len() >= self.config.samples
            && self.step_times.len() >= self.config.min_steps
        {
            self.started_ns = None;
            let samples: Vec<SensorSample> = self.window.drain(..).collect();
            let result = estimate(&samples, &self.config, now_ns);
            match &result {
                Ok(snapshot) => log::info!(
                    "calibration done: accel bias {:.3?}, gyro bias {:.4?}, gravity body {:.2?}",
                    snapshot.accel_bias.as_slice(),
                    snapshot.gyro_bias.as_slice(),
                    snapshot.avg_gravity_body.as_slice()
                ),
                Err(e) => log::warn!("calibration estimate failed: {}", e),
            }
            return Some(result);
        }

        let elapsed = now_ns.saturating_sub(started) as f64 / NANOS_PER_SEC;
        if elapsed > self.config.timeout_s {
            self.started_ns = None;
            let steps = self.step_times.len();
            log::warn!(
                "calibration timed out after {:.1} s with {} steps",
                elapsed,
                steps
            );
            return Some(Err(PdrError::CalibrationInsufficientMotion {
                steps,
                required: self.config.min_steps,
            }));
        }
        None
    }

    pub fn cancel(&mut self) {
        self.started_ns = None;
        self.window.clear();
        self.step_times.clear();
    }
}

/// Estimate biases and the body-to-phone rotation from a window of raw samples.
pub fn estimate(
    samples: &[SensorSample],
    config: &CalibrationConfig,
    now_ns: u64,
) -> PdrResult<CalibrationSnapshot> {
    let accels: Vec<Vec3> = samples
        .iter()
        .filter(|s| s.valid.has(Channel::Accel))
        .map(|s| s.accel)
        .collect();
    if accels.len() < 2 {
        return Err(PdrError::NumericalInstability(
            "no accelerometer data in calibration window".to_string(),
        ));
    }
    let mean_accel = accels.iter().sum::<Vec3>() / accels.len() as f64;
    let g_norm = mean_accel.norm();
    if g_norm <= 1.0 {
        return Err(PdrError::NumericalInstability(format!(
            "mean acceleration {:.3} m/s² too small to infer gravity",
            g_norm
        )));
    }
    let down = mean_accel / g_norm;
    let accel_bias = down * (g_norm - GRAVITY);

    let gyro_bias = still_gyro_bias(samples, config);
    let mag_bias = mag_centroid(samples, config.mag_min_span_ut);

    let e_z = -down;
    let e_x = principal_horizontal_axis(&accels, &mean_accel, &e_z)
        .or_else(|| project_horizontal(&Vec3::x(), &e_z))
        .or_else(|| project_horizontal(&Vec3::y(), &e_z))
        .ok_or_else(|| {
            PdrError::NumericalInstability("no horizontal axis for body frame".to_string())
        })?;
    let e_y = e_z.cross(&e_x);

    let r_phone_to_body = Mat3::from_rows(&[e_x.transpose(), e_y.transpose(), e_z.transpose()]);
    let r_phone_to_body = orthonormalize(&r_phone_to_body).ok_or_else(|| {
        PdrError::NumericalInstability("body frame is not orthonormalizable".to_string())
    })?;
    let r_body_to_phone = r_phone_to_body.inverse();

    let validity_ns = (config.validity_s * NANOS_PER_SEC) as i64;
    Ok(CalibrationSnapshot {
        accel_bias,
        gyro_bias,
        mag_bias,
        r_body_to_phone,
        avg_gravity_body: r_phone_to_body * (mean_accel - accel_bias),
        valid_until_ns: (now_ns as i64).saturating_add(validity_ns),
    })
}

/// Mean gyro over the windows where the phone was still.
fn still_gyro_bias(samples: &[SensorSample], config: &CalibrationConfig) -> Vec3 {
    let gyros: Vec<Vec3> = samples
        .iter()
        .filter(|s| s.valid.has(Channel::Gyro))
        .map(|s| s.gyro)
        .collect();
    let mut sum = Vec3::zeros();
    let mut windows = 0usize;
    for chunk in gyros.chunks_exact(config.gyro_window) {
        let mean_norm = chunk.iter().map(|g| g.norm()).sum::<f64>() / chunk.len() as f64;
        if mean_norm < config.gyro_still_threshold {
            sum += chunk.iter().sum::<Vec3>() / chunk.len() as f64;
            windows += 1;
        }
    }
    if windows == 0 {
        Vec3::zeros()
    } else {
        sum / windows as f64
    }
}

/// Centroid of the magnetometer samples, trusted only with enough rotation coverage.
fn mag_centroid(samples: &[SensorSample], min_span: f64) -> Vec3 {
    let mags: Vec<Vec3> = samples
        .iter()
        .filter(|s| s.valid.has(Channel::Mag))
        .map(|s| s.mag)
        .collect();
    if mags.is_empty() {
        return Vec3::zeros();
    }
    let mut lo = Vec3::repeat(f64::INFINITY);
    let mut hi = Vec3::repeat(f64::NEG_INFINITY);
    for m in &mags {
        lo = lo.inf(m);
        hi = hi.sup(m);
    }
    let span = hi - lo;
    if span.iter().all(|s| *s >= min_span) {
        mags.iter().sum::<Vec3>() / mags.len() as f64
    } else {
        log::debug!(
            "mag span {:.1?} µT below {:.0} µT, keeping zero mag bias",
            span.as_slice(),
            min_span
        );
        Vec3::zeros()
    }
}

/// Dominant axis of horizontal acceleration, pointing the way the user walks.
///
/// `accels` must be in time order. Falls back to a positive largest phone-frame
/// component when the gait gives no usable sign.
fn principal_horizontal_axis(accels: &[Vec3], mean: &Vec3, up: &Vec3) -> Option<Vec3> {
    let mut cov = Mat3::zeros();
    for a in accels {
        let d = a - mean;
        let h = d - up * d.dot(up);
        cov += h * h.transpose();
    }
    cov /= accels.len() as f64;

    let eig = SymmetricEigen::new(cov);
    let (idx, value) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| {
            if *v > best.1 {
                (i, *v)
            } else {
                best
            }
        });
    if value <= 1e-6 {
        return None;
    }
    let axis = project_horizontal(&eig.eigenvectors.column(idx).into_owned(), up)?;
    let sign = gait_sign(accels, mean, up, &axis).unwrap_or_else(|| {
        log::debug!("no gait phase along surge axis, signing by largest component");
        axis[axis.iamax()].signum()
    });
    Some(if sign < 0.0 { -axis } else { axis })
}

/// Forward surge rises while the upward acceleration is rising, so the
/// correlation of the horizontal component with the central difference of
/// upward acceleration is positive along the walking direction.
fn gait_sign(accels: &[Vec3], mean: &Vec3, up: &Vec3, axis: &Vec3) -> Option<f64> {
    let score: f64 = accels
        .windows(3)
        .map(|w| {
            let surge = (w[1] - mean).dot(axis);
            // upward acceleration is -(a - mean)·up
            let rise = -(w[2] - w[0]).dot(up);
            surge * rise
        })
        .sum();
    let energy: f64 = accels
        .iter()
        .map(|a| {
            let d = a - mean;
            d.dot(axis).powi(2) + d.dot(up).powi(2)
        })
        .sum();
    (score.abs() > 1e-2 * energy).then(|| score.signum())
}

fn project_horizontal(v: &Vec3, up: &Vec3) -> Option<Vec3> {
    let h = v - up * v.dot(up);
    (h.norm() > 1e-6).then(|| h.normalize())
}
