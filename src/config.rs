// Session configuration and per-component tuning. Every threshold the
// pipeline uses lives here, so a replay can load different values from JSON.

use serde::{Deserialize, Serialize};

use crate::error::{PdrError, PdrResult};
use crate::types::NANOS_PER_SEC;

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdrConfig {
    /// Nominal rate of every sensor channel (Hz), 5..=75.
    pub sample_rate_hz: f64,
    pub max_cadence_bpm: f64,
    pub min_point_distance_m: f64,
    pub outlier_threshold_m: f64,
    pub trajectory_max_length: usize,

    // ── Mode tracking ──
    /// No step for this long switches Walking → Stationary.
    pub walking_timeout_s: f64,
    /// Magnetometer confidence below the floor for this long switches to Degraded.
    pub degraded_mag_s: f64,

    pub intake: IntakeConfig,
    pub attitude: AttitudeConfig,
    pub calibration: CalibrationConfig,
    pub step_detector: StepDetectorConfig,
    pub stride: StrideConfig,
    pub ekf: EkfConfig,
}

impl Default for PdrConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            max_cadence_bpm: 240.0,
            min_point_distance_m: 0.10,
            outlier_threshold_m: 2.0,
            trajectory_max_length: 10_000,
            walking_timeout_s: 2.0,
            degraded_mag_s: 2.0,
            intake: IntakeConfig::default(),
            attitude: AttitudeConfig::default(),
            calibration: CalibrationConfig::default(),
            step_detector: StepDetectorConfig::default(),
            stride: StrideConfig::default(),
            ekf: EkfConfig::default(),
        }
    }
}

impl PdrConfig {
    pub fn from_json_str(json: &str) -> PdrResult<Self> {
        let config: PdrConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> PdrResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Nominal sample period in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        (NANOS_PER_SEC / self.sample_rate_hz).round() as u64
    }

    pub fn dt(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }

    pub fn max_cadence_hz(&self) -> f64 {
        self.max_cadence_bpm / 60.0
    }

    /// Refuse the configuration, naming the first bad field.
    pub fn validate(&self) -> PdrResult<()> {
        check_range("sample_rate_hz", self.sample_rate_hz, 5.0, 75.0)?;
        check_range("max_cadence_bpm", self.max_cadence_bpm, 30.0, 400.0)?;
        check_range("min_point_distance_m", self.min_point_distance_m, 0.0, 10.0)?;
        if !(self.outlier_threshold_m.is_finite()
            && self.outlier_threshold_m > self.min_point_distance_m)
        {
            return Err(invalid(
                "outlier_threshold_m",
                "must exceed min_point_distance_m",
            ));
        }
        if self.trajectory_max_length < 2 {
            return Err(invalid("trajectory_max_length", "must be at least 2"));
        }
        check_positive("walking_timeout_s", self.walking_timeout_s)?;
        check_positive("degraded_mag_s", self.degraded_mag_s)?;

        self.intake.validate()?;
        self.attitude.validate()?;
        self.calibration.validate()?;
        self.step_detector.validate()?;
        self.stride.validate()?;
        self.ekf.validate()
    }
}

// ─── Sensor intake ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Half-width of the alignment window, in nominal periods.
    pub tolerance_periods: f64,
    /// Silence longer than this many periods is a stale channel.
    pub stale_periods: f64,
    /// How long a reference sample waits for a lagging channel delivered in a
    /// batch, in periods. Also added to the lag a channel may show before it is stale.
    pub reorder_periods: f64,
    pub queue_capacity: usize,
    pub drop_rate_alpha: f64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            tolerance_periods: 1.0,
            stale_periods: 4.0,
            reorder_periods: 10.0,
            queue_capacity: 256,
            drop_rate_alpha: 0.02,
        }
    }
}

impl IntakeConfig {
    fn validate(&self) -> PdrResult<()> {
        check_positive("intake.tolerance_periods", self.tolerance_periods)?;
        if !(self.stale_periods > self.tolerance_periods) {
            return Err(invalid(
                "intake.stale_periods",
                "must exceed tolerance_periods",
            ));
        }
        check_range("intake.reorder_periods", self.reorder_periods, 0.0, 100.0)?;
        if self.queue_capacity < 4 {
            return Err(invalid("intake.queue_capacity", "must be at least 4"));
        }
        check_range("intake.drop_rate_alpha", self.drop_rate_alpha, 1e-6, 1.0)
    }
}

// ─── Attitude tracker ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttitudeConfig {
    // ── Gravity correction ──
    pub alpha_acc: f64,
    /// `|‖a‖ − g|` must be below this (m/s²).
    pub gravity_gate: f64,
    /// Filtered accel variance must be below this (m²/s⁴).
    pub gravity_variance_gate: f64,

    // ── Magnetic correction ──
    pub alpha_mag_base: f64,
    pub mag_min_confidence: f64,
    /// Relative deviation from the learned field magnitude still considered clean.
    pub mag_field_tolerance: f64,
    pub mag_field_alpha: f64,
    /// Smoothed gyro magnitude below which motion does not reduce mag confidence.
    pub mag_quiet_gyro: f64,
    pub gyro_ema_alpha: f64,

    // ── Stability ──
    pub accel_lpf_cutoff_hz: f64,
    pub variance_window_s: f64,
    pub stable_accel_variance: f64,
    pub stable_gyro: f64,
    /// |ω_world,z| below this counts as heading-steady.
    pub heading_steady_rate: f64,

    // ── Heading smoother ──
    pub heading_gain_min: f64,
    pub heading_gain_max: f64,
    pub heading_jump_deg: f64,
    /// Consecutive rejected jumps before the smoother re-seeds.
    pub heading_reseed_after: u32,
    pub heading_history_s: f64,
}

impl Default for AttitudeConfig {
    fn default() -> Self {
        Self {
            alpha_acc: 0.02,
            gravity_gate: 0.5,
            gravity_variance_gate: 0.5,
            alpha_mag_base: 0.005,
            mag_min_confidence: 0.1,
            mag_field_tolerance: 0.2,
            mag_field_alpha: 0.01,
            mag_quiet_gyro: 0.3,
            gyro_ema_alpha: 0.1,
            accel_lpf_cutoff_hz: 0.5,
            variance_window_s: 1.0,
            stable_accel_variance: 0.05,
            stable_gyro: 0.1,
            heading_steady_rate: 0.1,
            heading_gain_min: 0.1,
            heading_gain_max: 0.3,
            heading_jump_deg: 30.0,
            heading_reseed_after: 3,
            heading_history_s: 2.0,
        }
    }
}

impl AttitudeConfig {
    fn validate(&self) -> PdrResult<()> {
        check_range("attitude.alpha_acc", self.alpha_acc, 0.0, 1.0)?;
        check_range("attitude.alpha_mag_base", self.alpha_mag_base, 0.0, 1.0)?;
        check_range(
            "attitude.mag_min_confidence",
            self.mag_min_confidence,
            0.0,
            1.0,
        )?;
        check_range(
            "attitude.mag_field_tolerance",
            self.mag_field_tolerance,
            0.01,
            1.0,
        )?;
        check_positive("attitude.accel_lpf_cutoff_hz", self.accel_lpf_cutoff_hz)?;
        check_positive("attitude.variance_window_s", self.variance_window_s)?;
        if !(0.0 < self.heading_gain_min && self.heading_gain_min <= self.heading_gain_max
            && self.heading_gain_max <= 1.0)
        {
            return Err(invalid(
                "attitude.heading_gain_min",
                "need 0 < heading_gain_min <= heading_gain_max <= 1",
            ));
        }
        check_range("attitude.heading_jump_deg", self.heading_jump_deg, 1.0, 180.0)?;
        check_positive("attitude.heading_history_s", self.heading_history_s)
    }
}

// ─── Pocket calibrator ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub samples: usize,
    pub progress_every: usize,
    pub timeout_s: f64,
    pub gyro_still_threshold: f64,
    pub gyro_window: usize,
    pub min_steps: usize,
    pub mag_min_span_ut: f64,
    /// How long a successful calibration stays valid.
    pub validity_s: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            samples: 250,
            progress_every: 10,
            timeout_s: 15.0,
            gyro_still_threshold: 0.02,
            gyro_window: 10,
            min_steps: 4,
            mag_min_span_ut: 30.0,
            validity_s: 1800.0,
        }
    }
}

impl CalibrationConfig {
    fn validate(&self) -> PdrResult<()> {
        if self.samples < 20 {
            return Err(invalid("calibration.samples", "must be at least 20"));
        }
        if self.progress_every == 0 {
            return Err(invalid("calibration.progress_every", "must be non-zero"));
        }
        if self.gyro_window == 0 || self.gyro_window > self.samples {
            return Err(invalid(
                "calibration.gyro_window",
                "must be within 1..=samples",
            ));
        }
        check_positive("calibration.timeout_s", self.timeout_s)?;
        check_positive("calibration.validity_s", self.validity_s)
    }
}

// ─── Step detector ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GyroConfirmation {
    Off,
    On,
    /// On while the magnetometer is degraded.
    Auto,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDetectorConfig {
    pub rise_threshold: f64,
    pub fall_threshold: f64,
    pub trough_threshold: f64,
    pub fallback_rise_threshold: f64,
    pub fallback_fall_threshold: f64,
    pub fallback_trough_threshold: f64,
    pub peak_timeout_ms: u64,
    pub refractory_ms: u64,
    pub min_interval_ms: u64,
    pub cadence_window: usize,
    pub initial_cadence_hz: f64,
    /// Unstable attitude for longer than this switches to the magnitude signal.
    pub fallback_unstable_ms: u64,
    pub gyro_confirmation: GyroConfirmation,
    pub gyro_confirm_window_ms: u64,
    pub gyro_confirm_threshold: f64,
    pub native_match_window_ms: u64,
    /// Unmatched platform steps older than this are discarded.
    pub native_expiry_ms: u64,
    /// Once the platform has reported steps, a detected step is held this long
    /// after its peak so a late platform report can still claim it.
    pub native_hold_ms: u64,
    /// Peak-to-trough swing that maps to full prominence.
    pub full_prominence: f64,
}

impl Default for StepDetectorConfig {
    fn default() -> Self {
        Self {
            rise_threshold: 0.6,
            fall_threshold: 0.2,
            trough_threshold: -0.3,
            fallback_rise_threshold: 1.2,
            fallback_fall_threshold: 0.4,
            fallback_trough_threshold: -0.5,
            peak_timeout_ms: 800,
            refractory_ms: 250,
            min_interval_ms: 150,
            cadence_window: 8,
            initial_cadence_hz: 2.0,
            fallback_unstable_ms: 2000,
            gyro_confirmation: GyroConfirmation::Auto,
            gyro_confirm_window_ms: 500,
            gyro_confirm_threshold: 0.1,
            native_match_window_ms: 200,
            native_expiry_ms: 1000,
            native_hold_ms: 400,
            full_prominence: 1.5,
        }
    }
}

impl StepDetectorConfig {
    fn validate(&self) -> PdrResult<()> {
        if !(self.rise_threshold > self.fall_threshold
            && self.fall_threshold > self.trough_threshold)
        {
            return Err(invalid(
                "step_detector.rise_threshold",
                "need rise > fall > trough",
            ));
        }
        if !(self.fallback_rise_threshold > self.fallback_fall_threshold
            && self.fallback_fall_threshold > self.fallback_trough_threshold)
        {
            return Err(invalid(
                "step_detector.fallback_rise_threshold",
                "need rise > fall > trough",
            ));
        }
        if self.peak_timeout_ms == 0 {
            return Err(invalid("step_detector.peak_timeout_ms", "must be non-zero"));
        }
        if self.cadence_window < 2 {
            return Err(invalid("step_detector.cadence_window", "must be at least 2"));
        }
        if self.native_hold_ms > self.native_expiry_ms {
            return Err(invalid(
                "step_detector.native_hold_ms",
                "must not exceed native_expiry_ms",
            ));
        }
        check_range(
            "step_detector.initial_cadence_hz",
            self.initial_cadence_hz,
            0.2,
            6.0,
        )?;
        check_positive("step_detector.full_prominence", self.full_prominence)
    }
}

// ─── Stride model ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrideConfig {
    pub reference_height_m: f64,
    pub reference_cadence_hz: f64,
    pub reference_stride_m: f64,
    pub cadence_exponent: f64,
    pub min_stride_m: f64,
    pub max_stride_m: f64,
    /// Weight of a platform-supplied length against the anthropometric estimate (1 = platform only).
    pub platform_weight: f64,
}

impl Default for StrideConfig {
    fn default() -> Self {
        Self {
            reference_height_m: 1.75,
            reference_cadence_hz: 2.0,
            reference_stride_m: 0.75,
            cadence_exponent: 0.3,
            min_stride_m: 0.25,
            max_stride_m: 1.20,
            platform_weight: 1.0,
        }
    }
}

impl StrideConfig {
    fn validate(&self) -> PdrResult<()> {
        check_positive("stride.reference_height_m", self.reference_height_m)?;
        check_positive("stride.reference_cadence_hz", self.reference_cadence_hz)?;
        check_positive("stride.reference_stride_m", self.reference_stride_m)?;
        if !(0.0 < self.min_stride_m && self.min_stride_m < self.max_stride_m) {
            return Err(invalid(
                "stride.min_stride_m",
                "need 0 < min_stride_m < max_stride_m",
            ));
        }
        check_range("stride.platform_weight", self.platform_weight, 0.0, 1.0)
    }
}

// ─── Pose EKF ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfConfig {
    /// Position process noise per second of prediction gap (m²).
    pub q_xy: f64,
    /// Heading process noise std per √s (rad).
    pub q_theta: f64,
    pub max_predict_gap_s: f64,
    pub sigma_step_m: f64,
    pub sigma_heading_deg: f64,
    pub heading_gate_deg: f64,
    pub heading_min_mag_confidence: f64,
    /// Consecutive gated headings before θ is re-seeded.
    pub heading_reacquire_count: u32,
    pub initial_position_var: f64,
    pub initial_heading_std_deg: f64,
    /// Confidence lost per second without any update.
    pub confidence_decay_per_s: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            q_xy: 0.01,
            q_theta: 0.01,
            max_predict_gap_s: 2.0,
            sigma_step_m: 0.05,
            sigma_heading_deg: 5.0,
            heading_gate_deg: 30.0,
            heading_min_mag_confidence: 0.1,
            heading_reacquire_count: 10,
            initial_position_var: 0.01,
            initial_heading_std_deg: 10.0,
            confidence_decay_per_s: 0.1,
        }
    }
}

impl EkfConfig {
    fn validate(&self) -> PdrResult<()> {
        check_positive("ekf.q_xy", self.q_xy)?;
        check_positive("ekf.q_theta", self.q_theta)?;
        check_positive("ekf.max_predict_gap_s", self.max_predict_gap_s)?;
        check_positive("ekf.sigma_step_m", self.sigma_step_m)?;
        check_positive("ekf.sigma_heading_deg", self.sigma_heading_deg)?;
        check_range("ekf.heading_gate_deg", self.heading_gate_deg, 1.0, 180.0)?;
        check_range(
            "ekf.heading_min_mag_confidence",
            self.heading_min_mag_confidence,
            0.0,
            1.0,
        )?;
        check_positive("ekf.initial_position_var", self.initial_position_var)?;
        check_positive("ekf.initial_heading_std_deg", self.initial_heading_std_deg)?;
        check_range(
            "ekf.confidence_decay_per_s",
            self.confidence_decay_per_s,
            0.0,
            10.0,
        )
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn invalid(field: &str, reason: &str) -> PdrError {
    PdrError::ConfigInvalid(format!("{}: {}", field, reason))
}

fn check_range(field: &str, value: f64, lo: f64, hi: f64) -> PdrResult<()> {
    if value.is_finite() && value >= lo && value <= hi {
        Ok(())
    } else {
        Err(PdrError::ConfigInvalid(format!(
            "{}: {} outside [{}, {}]",
            field, value, lo, hi
        )))
    }
}

fn check_positive(field: &str, value: f64) -> PdrResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PdrError::ConfigInvalid(format!(
            "{}: must be positive, got {}",
            field, value
        )))
    }
}
