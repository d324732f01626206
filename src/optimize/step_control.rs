//! Levenberg-Marquardt damping schedule.
//!
//! λ is adapted from the ratio of actual to predicted energy reduction. Good
//! steps shrink λ through a cubic of the prediction quality; bad steps grow
//! it by a fail multiplier that itself backs off geometrically under
//! consecutive rejections.

use crate::settings::OptimizationSettings;
use tracing::debug;

/// Floor applied when growing λ, so a pathological λ = 0 start can still
/// recover through the rejection branch.
const MIN_LAMBDA: f64 = 1e-12;

/// Maintains λ and the rejection multiplier across iterations.
#[derive(Debug, Clone)]
pub struct StepController {
    lambda: f64,
    fail_multiplier: f64,
    settings: OptimizationSettings,
}

impl StepController {
    pub fn new(settings: &OptimizationSettings) -> Self {
        Self {
            lambda: settings.initial_lambda,
            fail_multiplier: settings.initial_fail_multiplier,
            settings: *settings,
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Scale λ directly, for driver paths that bypass the quality ratio
    /// (failed linear solve, degenerate prediction).
    pub fn scale_lambda(&mut self, factor: f64) {
        self.lambda *= factor;
        if factor > 1.0 {
            self.lambda = self.lambda.max(MIN_LAMBDA);
        }
    }

    /// Judge a trial step and update λ.
    ///
    /// Returns whether the prediction quality clears `accepted_quality`.
    /// A negative predicted difference (degenerate linearization) flips the
    /// sign of both differences before the ratio is formed.
    pub fn new_step(&mut self, old_energy: f64, new_energy: f64, predicted_energy: f64) -> bool {
        let mut predicted_diff = old_energy - predicted_energy;
        let mut actual_diff = old_energy - new_energy;
        if predicted_diff < 0.0 {
            predicted_diff = -predicted_diff;
            actual_diff = -actual_diff;
        }

        let old_lambda = self.lambda;
        let quality = actual_diff / predicted_diff;
        let q2m1 = 2.0 * quality - 1.0;
        let successful = quality > self.settings.accepted_quality;
        if successful {
            self.lambda *= self
                .settings
                .min_lambda_multiplier
                .max(1.0 - q2m1 * q2m1 * q2m1);
            self.fail_multiplier = self.settings.initial_fail_multiplier;
        } else {
            self.lambda = (self.lambda * self.fail_multiplier).max(MIN_LAMBDA);
            self.fail_multiplier *= self.settings.fail_multiplier_multiplier;
        }
        debug!(
            "step quality {:.3} (actual {:.3e} / predicted {:.3e}), lambda {:.3e} -> {:.3e}",
            quality, actual_diff, predicted_diff, old_lambda, self.lambda
        );

        successful
    }
}
