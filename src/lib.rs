//! Pedestrian dead-reckoning core.
//!
//! Raw accelerometer, gyroscope and magnetometer streams go in; a planar pose
//! `(x, y, θ)` with a confidence in `[0, 1]` comes out. [`session::PdrSession`]
//! owns the pipeline and delivers results through [`events::PdrListener`].

pub mod angle;
pub mod calibration;
pub mod config;
pub mod error;
pub mod events;
pub mod filters;
pub mod health_monitor;
pub mod live_status;
pub mod sensors;
pub mod session;
pub mod smoothing;
pub mod step_detector;
pub mod storage;
pub mod stride;
pub mod trajectory;
pub mod types;

pub use calibration::{CalibrationSnapshot, CalibrationState};
pub use config::PdrConfig;
pub use error::{PdrError, PdrResult};
pub use events::{PdrEvent, PdrListener};
pub use session::{PdrSession, SessionState};
pub use types::{
    Channel, ChannelReading, NativeStep, Pose, SensorSample, StepEvent, TrackingMode,
    TrajectoryPoint, UserProfile,
};
