//! The sliding-window photometric bundle adjuster.
//!
//! [`EnergyFunction`] is the entry point: it mirrors the window's keyframes
//! into a [`Parameters`] block, builds one [`Residual`] per visible
//! (host entry, target entry, point) triple, and refines poses, affine
//! brightness pairs, and log-depths by Levenberg-Marquardt over the robust
//! photometric energy. The structured normal equations are assembled in
//! [`hessian`] and reduced by Schur elimination of the point block in
//! [`crate::linalg`].

use nalgebra::{MatrixXx2, SMatrix, SVector};

pub mod delta;
pub mod energy;
pub mod hessian;
pub mod motion;
pub mod parameters;
pub mod parametrization;
pub mod precomputed;
pub mod residual;
pub mod step_control;

pub use delta::{DeltaParameterVector, FrameParameterOrder};
pub use energy::{EnergyFunction, IterationInfo, OptimizationSummary};
pub use motion::MotionDerivatives;
pub use parameters::{Parameters, PointRef};
pub use parametrization::ParametrizationJacobians;
pub use precomputed::{
    PrecomputedHostToTarget, PrecomputedLightHostToTarget, PrecomputedMotionDerivatives,
};
pub use residual::Residual;
pub use step_control::StepController;

/// 2×7 block over one pose's storage coordinates (quaternion, translation).
pub type Mat27 = SMatrix<f64, 2, 7>;
/// 7×7 pose-pose block in storage coordinates.
pub type Mat77 = SMatrix<f64, 7, 7>;
/// 7×2 pose-affine block.
pub type Mat72 = SMatrix<f64, 7, 2>;
/// 7×6 map from a pose's minimal tangent to its storage coordinates.
pub type Mat76 = SMatrix<f64, 7, 6>;
/// Pose-sized storage vector.
pub type Vec7 = SVector<f64, 7>;
/// Pattern-length × 2 matrix (one row per pattern sample).
pub type MatR2 = MatrixXx2<f64>;
