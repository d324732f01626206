//! Robust loss functions for outlier rejection in the photometric energy.
//!
//! With a robust loss ρ(s), the energy of a residual sample `r` becomes
//! `ρ(r²)` instead of `r²`, bounding the influence of occlusions and
//! specularities on the normal equations.
//!
//! Each loss evaluates the triple `[ρ(s), ρ'(s), ρ''(s)]` at the squared
//! residual `s = r²`. The first derivative is the classic IRLS weight; the
//! second enters the curvature-corrected weight used by the adjuster.
//!
//! Dispatch in the inner sample loop goes through the [`RobustLoss`] tagged
//! union rather than a trait object.

use crate::error::{DirectBaError, DirectBaResult};
use crate::settings::{LossType, OptimizationSettings};

/// Trait for robust loss functions.
///
/// The `evaluate` method returns `[ρ(s), ρ'(s), ρ''(s)]` at the squared
/// residual norm `s` (always non-negative). Near zero every loss behaves
/// like least squares: ρ(0) = 0, ρ'(0) = 1, ρ''(0) = 0.
pub trait Loss: Send + Sync {
    /// Evaluate the loss function and its first two derivatives at `s = r²`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// Identity loss: plain least squares.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialLoss;

impl Loss for TrivialLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Huber loss: quadratic for inliers, linear for outliers.
///
/// ```text
/// ρ(s) = s                 if s ≤ δ²
///      = 2δ√s - δ²         if s > δ²
/// ```
///
/// where `δ` is the scale parameter and `s = r²`.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    /// Scale parameter δ
    scale: f64,
    /// Cached value δ²
    scale2: f64,
}

impl HuberLoss {
    /// Create a new Huber loss with the given scale parameter.
    ///
    /// # Arguments
    ///
    /// * `scale` - The threshold δ separating inliers from outliers
    ///   (must be positive)
    pub fn new(scale: f64) -> DirectBaResult<Self> {
        if scale <= 0.0 {
            return Err(DirectBaError::InvalidInput(
                "huber scale needs to be larger than zero".to_string(),
            ));
        }
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }

    /// The scale parameter δ.
    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            // Outlier region: linear cost
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Tagged union over the supported losses.
///
/// Keeps the per-sample dispatch in the residual loop free of virtual calls.
#[derive(Debug, Clone, Copy)]
pub enum RobustLoss {
    Trivial(TrivialLoss),
    Huber(HuberLoss),
}

impl RobustLoss {
    /// Build the loss selected by the optimization settings.
    pub fn from_settings(
        optimization: &OptimizationSettings,
        outlier_diff: f64,
    ) -> DirectBaResult<Self> {
        match optimization.loss_type {
            LossType::Trivial => Ok(RobustLoss::Trivial(TrivialLoss)),
            LossType::Huber => Ok(RobustLoss::Huber(HuberLoss::new(outlier_diff)?)),
        }
    }

    /// Evaluate `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual `s`.
    #[inline]
    pub fn evaluate(&self, s: f64) -> [f64; 3] {
        match self {
            RobustLoss::Trivial(loss) => loss.evaluate(s),
            RobustLoss::Huber(loss) => loss.evaluate(s),
        }
    }
}
