use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::TrackingMode;

/// Flat JSON snapshot of a running session, for dashboards and debugging.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub session_state: String,
    pub mode: TrackingMode,
    pub session_seconds: f64,
    // Pose
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
    pub confidence: f64,
    pub step_count: u64,
    pub distance_m: f64,
    pub trajectory_points: usize,
    // Calibration
    pub calibration: String,
    pub calibration_degraded: bool,
    // Attitude
    pub attitude_stable: bool,
    pub mag_confidence: f64,
    // Intake health
    pub samples_processed: u64,
    pub late_samples: u64,
    pub overflow_dropped: u64,
    pub drop_rate: f64,
    pub accel_healthy: bool,
    pub gyro_healthy: bool,
    pub mag_healthy: bool,
    pub accel_silence_ms: u64,
    pub gyro_silence_ms: u64,
    pub mag_silence_ms: u64,
    // Rejections and resets
    pub rejected_cadence: u64,
    pub heading_gated: u64,
    pub heading_rejected: u64,
    pub heading_reacquired: u64,
    pub numerical_resets: u64,
    pub outlier_corrected: u64,
    pub outlier_rejected: u64,
    pub native_duplicates: u64,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            session_state: "uninit".to_string(),
            mode: TrackingMode::Stationary,
            session_seconds: 0.0,
            x: 0.0,
            y: 0.0,
            heading_deg: 0.0,
            confidence: 0.0,
            step_count: 0,
            distance_m: 0.0,
            trajectory_points: 0,
            calibration: "none".to_string(),
            calibration_degraded: false,
            attitude_stable: false,
            mag_confidence: 0.0,
            samples_processed: 0,
            late_samples: 0,
            overflow_dropped: 0,
            drop_rate: 0.0,
            accel_healthy: true,
            gyro_healthy: true,
            mag_healthy: true,
            accel_silence_ms: 0,
            gyro_silence_ms: 0,
            mag_silence_ms: 0,
            rejected_cadence: 0,
            heading_gated: 0,
            heading_rejected: 0,
            heading_reacquired: 0,
            numerical_resets: 0,
            outlier_corrected: 0,
            outlier_rejected: 0,
            native_duplicates: 0,
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
