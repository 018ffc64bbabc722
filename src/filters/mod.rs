pub mod attitude;
pub mod pose_ekf;
