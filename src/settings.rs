//! Configuration for the sliding-window photometric bundle adjuster.
//!
//! All knobs are plain structs with `Default` implementations; callers
//! override the fields they care about and hand a [`Settings`] to
//! [`EnergyFunction::new`](crate::optimize::EnergyFunction::new).

use nalgebra::Vector2;

/// The robust loss applied to squared pattern residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossType {
    /// Plain least squares
    Trivial,
    /// Huber loss with scale `intensity.outlier_diff`
    #[default]
    Huber,
}

/// The star of pixel offsets evaluated around every point.
#[derive(Debug, Clone)]
pub struct ResidualPatternSettings {
    /// Integer pixel offsets relative to the point, (x, y)
    pattern: Vec<Vector2<f64>>,
    /// Border in pixels a reprojection must keep from the image edge
    pub height: f64,
}

impl ResidualPatternSettings {
    pub fn new(pattern: Vec<Vector2<f64>>, height: f64) -> Self {
        Self { pattern, height }
    }

    pub fn pattern(&self) -> &[Vector2<f64>] {
        &self.pattern
    }

    pub fn size(&self) -> usize {
        self.pattern.len()
    }
}

impl Default for ResidualPatternSettings {
    fn default() -> Self {
        // Eight-tap star used by direct sparse odometry.
        Self {
            pattern: vec![
                Vector2::new(0.0, 0.0),
                Vector2::new(0.0, -2.0),
                Vector2::new(-1.0, -1.0),
                Vector2::new(1.0, -1.0),
                Vector2::new(-2.0, 0.0),
                Vector2::new(2.0, 0.0),
                Vector2::new(-1.0, 1.0),
                Vector2::new(0.0, 2.0),
            ],
            height: 4.0,
        }
    }
}

/// Gradient-based downweighting of high-contrast samples.
#[derive(Debug, Clone, Copy)]
pub struct ResidualWeightingSettings {
    /// Scale of the gradient weight `c / sqrt(c² + ‖∇I‖²)`
    pub c: f64,
    /// Floor factor guarding against negative robust-loss curvature
    pub loss_eps: f64,
}

impl Default for ResidualWeightingSettings {
    fn default() -> Self {
        Self {
            c: 50.0,
            loss_eps: 1e-2,
        }
    }
}

/// Intensity-domain thresholds.
#[derive(Debug, Clone, Copy)]
pub struct IntensitySettings {
    /// Huber threshold on pattern residuals, in gray levels
    pub outlier_diff: f64,
}

impl Default for IntensitySettings {
    fn default() -> Self {
        Self { outlier_diff: 12.0 }
    }
}

/// Admissible depth range; `exp(log_depth)` is clamped to it.
#[derive(Debug, Clone, Copy)]
pub struct DepthSettings {
    pub min: f64,
    pub max: f64,
}

impl Default for DepthSettings {
    fn default() -> Self {
        Self {
            min: 1e-3,
            max: 1e4,
        }
    }
}

/// Bounds and master switch for the per-entry affine brightness pair.
#[derive(Debug, Clone, Copy)]
pub struct AffineLightSettings {
    pub min_affine_light_a: f64,
    pub max_affine_light_a: f64,
    pub min_affine_light_b: f64,
    pub max_affine_light_b: f64,
    pub optimize_affine_light: bool,
}

impl Default for AffineLightSettings {
    fn default() -> Self {
        Self {
            min_affine_light_a: -0.7,
            max_affine_light_a: 0.7,
            min_affine_light_b: -50.0,
            max_affine_light_b: 50.0,
            optimize_affine_light: true,
        }
    }
}

/// Levenberg-Marquardt schedule and step limits.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationSettings {
    /// Damping at the first iteration
    pub initial_lambda: f64,
    /// Applied to λ when a step is accepted without a usable quality ratio
    pub success_multiplier: f64,
    /// Applied to λ when the damped linear solve itself fails
    pub fail_multiplier: f64,
    /// Growth of the rejection multiplier after consecutive rejections
    pub fail_multiplier_multiplier: f64,
    /// Lower clamp of the cubic λ reduction on accepted steps
    pub min_lambda_multiplier: f64,
    /// Minimum prediction quality `actual/predicted` for acceptance
    pub accepted_quality: f64,
    /// Log-depth deltas larger than this are clipped to zero
    pub max_abs_delta_d: f64,
    /// Robust loss selection
    pub loss_type: LossType,
    /// Rejection multiplier right after an accepted step
    pub initial_fail_multiplier: f64,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            initial_lambda: 1e-4,
            success_multiplier: 0.5,
            fail_multiplier: 2.0,
            fail_multiplier_multiplier: 2.0,
            min_lambda_multiplier: 1.0 / 3.0,
            accepted_quality: 0.1,
            max_abs_delta_d: 0.5,
            loss_type: LossType::Huber,
            initial_fail_multiplier: 2.0,
        }
    }
}

/// Gauge handling of the first two keyframes.
#[derive(Debug, Clone, Copy)]
pub struct BundleAdjusterSettings {
    /// Below this baseline the second keyframe's translation is frozen
    /// instead of sphere-constrained
    pub min_first_to_second_radius: f64,
    /// Freeze the second keyframe's rotation
    pub fixed_rotation_on_second_kf: bool,
    /// Freeze the second keyframe entirely on a two-frame window
    pub fixed_motion_on_first_adjustment: bool,
}

impl Default for BundleAdjusterSettings {
    fn default() -> Self {
        Self {
            min_first_to_second_radius: 1e-2,
            fixed_rotation_on_second_kf: false,
            fixed_motion_on_first_adjustment: false,
        }
    }
}

/// Worker threads for the residual fan-out.
#[derive(Debug, Clone, Copy)]
pub struct ThreadingSettings {
    /// 0 uses the global rayon pool
    pub num_threads: usize,
}

impl Default for ThreadingSettings {
    fn default() -> Self {
        Self { num_threads: 0 }
    }
}

/// Aggregate configuration of the adjuster.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub residual_pattern: ResidualPatternSettings,
    pub residual_weighting: ResidualWeightingSettings,
    pub intensity: IntensitySettings,
    pub depth: DepthSettings,
    pub affine_light: AffineLightSettings,
    pub optimization: OptimizationSettings,
    pub bundle_adjuster: BundleAdjusterSettings,
    pub threading: ThreadingSettings,
}
