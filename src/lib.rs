//! # direct-ba
//!
//! Sliding-window photometric bundle adjustment for multi-fisheye direct
//! sparse odometry.
//!
//! Given a window of keyframes (each a multi-camera image bundle with a
//! body-to-world pose, per-camera affine brightness correction, and a set of
//! sparse points with log-depth estimates), the adjuster jointly refines all
//! of these by minimizing a robust photometric energy: the intensity
//! difference between each point's pattern in its host frame and the
//! predicted pattern in every target frame it reprojects into.
//!
//! ## Features
//!
//! - **Structured Gauss-Newton / Levenberg-Marquardt**: block normal
//!   equations with frame-frame, frame-point, and point-point structure,
//!   Schur elimination of the diagonal point block
//! - **Analytic Jacobians**: SE(3) tangent space, intrinsic fisheye
//!   projection, bicubic image interpolation, composed affine brightness
//! - **Gauge fixing**: anchored first keyframe, scale sphere on the second
//! - **Adaptive damping**: prediction-quality-driven λ schedule with
//!   geometric rejection back-off
//!
//! ## Example
//!
//! ```no_run
//! use direct_ba::camera::{CameraBundle, KannalaBrandt};
//! use direct_ba::optimize::EnergyFunction;
//! use direct_ba::settings::Settings;
//! # fn window() -> Vec<direct_ba::keyframe::KeyFrame> { Vec::new() }
//!
//! let camera = KannalaBrandt::new(
//!     380.0, 380.0, 320.0, 240.0, [0.0, 0.0, 0.0, 0.0], 640.0, 480.0,
//!     100.0_f64.to_radians(),
//! );
//! let bundle = CameraBundle::single(camera);
//! let mut key_frames = window();
//!
//! let mut energy =
//!     EnergyFunction::new(&bundle, &mut key_frames, Settings::default()).unwrap();
//! let summary = energy.optimize(30).unwrap();
//! println!("{summary}");
//! ```

pub mod camera;
pub mod error;
pub mod geometry;
pub mod image;
pub mod keyframe;
pub mod linalg;
pub mod logger;
pub mod loss;
pub mod optimize;
pub mod settings;

pub use error::{DirectBaError, DirectBaResult};
pub use logger::{init_logger, init_logger_with_level};
pub use optimize::{EnergyFunction, OptimizationSummary};
pub use settings::Settings;
