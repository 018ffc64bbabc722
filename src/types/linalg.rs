//! Linear algebra type system for the PDR core
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the pose filter and the attitude math.

use nalgebra::{Matrix3, Rotation3, SMatrix, SVector, UnitQuaternion, Vector3};

// ===== State Dimensions =====
pub const POSE_DIM: usize = 3; // (px, py, theta)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_POSITION: usize = 2; // (px, py)
pub const MEASURE_DIM_HEADING: usize = 1; // theta

// ===== Pose Filter Types =====
pub type PoseVec = SVector<f64, POSE_DIM>;
pub type PoseCov = SMatrix<f64, POSE_DIM, POSE_DIM>;

// Measurement types
pub type PositionObs = SVector<f64, MEASURE_DIM_POSITION>;
pub type PositionNoise = SMatrix<f64, MEASURE_DIM_POSITION, MEASURE_DIM_POSITION>;
pub type HeadingObs = SVector<f64, MEASURE_DIM_HEADING>;
pub type HeadingNoise = SMatrix<f64, MEASURE_DIM_HEADING, MEASURE_DIM_HEADING>;

// Jacobian types
pub type JacobianPosition = SMatrix<f64, MEASURE_DIM_POSITION, POSE_DIM>; // 2×3
pub type JacobianHeading = SMatrix<f64, MEASURE_DIM_HEADING, POSE_DIM>; // 1×3

// ===== Attitude Types =====
pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;
pub type Rot3 = Rotation3<f64>;
pub type Quat = UnitQuaternion<f64>;

/// Frobenius norm of `R·Rᵀ − I`, the orthogonality residual of a rotation.
pub fn orthogonality_error(r: &Mat3) -> f64 {
    (r * r.transpose() - Mat3::identity()).norm()
}

/// Re-orthonormalize a nearly orthogonal matrix via SVD, keeping det = +1.
pub fn orthonormalize(m: &Mat3) -> Option<Rot3> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Some(Rot3::from_matrix_unchecked(r))
}
