//! The photometric energy function and its Levenberg-Marquardt driver.
//!
//! [`EnergyFunction`] owns one adjustment problem: it mirrors the window into
//! a parameter block, constructs every visible residual once, and then runs
//! the damped trial-step loop of [`EnergyFunction::optimize`]. Residuals are
//! never added or removed mid-solve; [`Values`] and [`Derivatives`] are
//! disposable snapshots recreated whenever the parameters move.

use crate::camera::{CameraBundle, CameraModel};
use crate::error::{DirectBaError, DirectBaResult};
use crate::keyframe::{KeyFrame, PointState};
use crate::loss::RobustLoss;
use crate::optimize::hessian::{
    AccumulatedBlocks, AccumulatedGradientBlocks, Gradient, Hessian,
};
use crate::optimize::parameters::{Parameters, PointRef};
use crate::optimize::parametrization::ParametrizationJacobians;
use crate::optimize::precomputed::{
    PrecomputedHostToTarget, PrecomputedLightHostToTarget, PrecomputedMotionDerivatives,
};
use crate::optimize::residual::{remap_depthed, Residual, ResidualJacobian};
use crate::optimize::step_control::StepController;
use crate::settings::Settings;
use nalgebra::{DVector, Vector2};
use rayon::prelude::*;
use std::fmt;
use tracing::{debug, info, warn};

/// λ beyond this terminates the solve; the linearization is hopeless.
const LAMBDA_OVERFLOW: f64 = 1e32;
/// Energy below this terminates the solve.
const ENERGY_TOLERANCE: f64 = 1e-12;
/// Predicted reductions below this are numerically meaningless and bypass
/// the quality ratio.
const PREDICTION_FLOOR: f64 = 1e-15;

/// Per-iteration diagnostic record handed to the callback.
#[derive(Debug, Clone, Copy)]
pub struct IterationInfo {
    pub iteration: usize,
    pub energy_before: f64,
    pub energy_after: f64,
    pub lambda: f64,
    pub accepted: bool,
}

/// Outcome statistics of one `optimize` call.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationSummary {
    pub initial_energy: f64,
    pub final_energy: f64,
    pub iterations: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub final_lambda: f64,
}

impl fmt::Display for OptimizationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Bundle Adjustment Summary ===")?;
        writeln!(f, "Initial energy:   {:.6e}", self.initial_energy)?;
        writeln!(f, "Final energy:     {:.6e}", self.final_energy)?;
        writeln!(f, "Iterations:       {}", self.iterations)?;
        writeln!(f, "Accepted steps:   {}", self.accepted_steps)?;
        writeln!(f, "Rejected steps:   {}", self.rejected_steps)?;
        writeln!(f, "Final lambda:     {:.6e}", self.final_lambda)?;
        Ok(())
    }
}

/// All residuals' pattern values and cached center reprojections at one
/// parameter point.
#[derive(Debug, Clone)]
pub struct Values {
    values: Vec<DVector<f64>>,
    reprojections: Vec<Vector2<f64>>,
}

impl Values {
    fn new<C: CameraModel>(
        residuals: &[Residual],
        parameters: &Parameters,
        cam: &CameraBundle<C>,
        key_frames: &[KeyFrame],
        host_to_target: &PrecomputedHostToTarget,
        light_host_to_target: &PrecomputedLightHostToTarget,
    ) -> Self {
        let computed: Vec<(DVector<f64>, Vector2<f64>)> = residuals
            .par_iter()
            .map(|res| {
                let (ti, tci) = (res.target_ind(), res.target_cam_ind());
                let mut reproj = Vector2::zeros();
                let vals = res.values(
                    &cam.bundle[tci].cam,
                    &key_frames[ti].frames[tci],
                    host_to_target.get(res.host_ind(), res.host_cam_ind(), ti, tci),
                    &light_host_to_target.get(res.host_ind(), res.host_cam_ind(), ti, tci),
                    parameters.log_depth(res.point_ind()),
                    Some(&mut reproj),
                );
                (vals, reproj)
            })
            .collect();

        let mut values = Vec::with_capacity(computed.len());
        let mut reprojections = Vec::with_capacity(computed.len());
        for (vals, reproj) in computed {
            values.push(vals);
            reprojections.push(reproj);
        }
        Self {
            values,
            reprojections,
        }
    }

    pub fn values(&self, residual_ind: usize) -> &DVector<f64> {
        &self.values[residual_ind]
    }

    pub fn reprojection(&self, residual_ind: usize) -> Vector2<f64> {
        self.reprojections[residual_ind]
    }

    /// `Σ_residuals Σ_i gradWeightᵢ · ρ(rᵢ²)`.
    pub fn total_energy(&self, residuals: &[Residual], loss: &RobustLoss) -> f64 {
        let mut energy = 0.0;
        for (res, vals) in residuals.iter().zip(self.values.iter()) {
            let grad_weights = res.grad_weights();
            for i in 0..vals.len() {
                let [rho, _, _] = loss.evaluate(vals[i] * vals[i]);
                energy += grad_weights[i] * rho;
            }
        }
        energy
    }
}

/// All residuals' analytic Jacobians plus the parametrization maps at one
/// parameter point.
#[derive(Debug, Clone)]
pub struct Derivatives {
    pub parametrization: ParametrizationJacobians,
    pub residual_jacobians: Vec<ResidualJacobian>,
}

impl Derivatives {
    fn new<C: CameraModel>(
        residuals: &[Residual],
        parameters: &Parameters,
        cam: &CameraBundle<C>,
        key_frames: &[KeyFrame],
        host_to_target: &PrecomputedHostToTarget,
        motion_derivatives: &mut PrecomputedMotionDerivatives,
        light_host_to_target: &PrecomputedLightHostToTarget,
        settings: &Settings,
    ) -> Self {
        // Warm every pair the residual set touches so the parallel fan-out
        // below only reads.
        for res in residuals {
            motion_derivatives.ensure(
                res.host_ind(),
                res.host_cam_ind(),
                res.target_ind(),
                res.target_cam_ind(),
            );
        }
        let motion = &*motion_derivatives;

        let residual_jacobians = residuals
            .par_iter()
            .map(|res| {
                let (hi, hci) = (res.host_ind(), res.host_cam_ind());
                let (ti, tci) = (res.target_ind(), res.target_cam_ind());
                res.jacobian(
                    &cam.bundle[tci].cam,
                    &key_frames[ti].frames[tci],
                    host_to_target.get(hi, hci, ti, tci),
                    motion.get(hi, hci, ti, tci),
                    &parameters.light_world_to_frame(hi, hci),
                    &light_host_to_target.get(hi, hci, ti, tci),
                    parameters.log_depth(res.point_ind()),
                    settings.depth.max,
                )
            })
            .collect();

        Self {
            parametrization: ParametrizationJacobians::new(parameters),
            residual_jacobians,
        }
    }
}

/// The sliding-window photometric bundle adjuster.
pub struct EnergyFunction<'a, C: CameraModel> {
    cam: &'a CameraBundle<C>,
    key_frames: &'a mut [KeyFrame],
    parameters: Parameters,
    residuals: Vec<Residual>,
    loss: RobustLoss,
    settings: Settings,
    #[allow(clippy::type_complexity)]
    callback: Option<Box<dyn FnMut(&IterationInfo) + Send + 'a>>,
}

impl<'a, C: CameraModel> EnergyFunction<'a, C> {
    /// Mirror the window and construct every residual whose point reprojects
    /// into a target image. Points outside every target are silently
    /// skipped; that is expected and common.
    pub fn new(
        cam: &'a CameraBundle<C>,
        key_frames: &'a mut [KeyFrame],
        settings: Settings,
    ) -> DirectBaResult<Self> {
        let num_key_frames = key_frames.len();
        if num_key_frames < 2 {
            return Err(DirectBaError::WindowTooSmall {
                got: num_key_frames,
            });
        }
        if cam.size() == 0 {
            return Err(DirectBaError::EmptyCameraBundle);
        }
        if settings.residual_pattern.size() == 0 {
            return Err(DirectBaError::EmptyResidualPattern);
        }
        for (i, kf) in key_frames.iter().enumerate() {
            if kf.frames.len() != cam.size() {
                return Err(DirectBaError::BundleArityMismatch {
                    keyframe: i,
                    entries: kf.frames.len(),
                    cameras: cam.size(),
                });
            }
        }

        let loss = RobustLoss::from_settings(&settings.optimization, settings.intensity.outlier_diff)?;
        let mut parameters = Parameters::new(cam.size(), key_frames, &settings);
        let host_to_target = PrecomputedHostToTarget::new(cam, &parameters);
        let border = settings.residual_pattern.height;

        let mut residuals = Vec::new();
        let mut point_refs = Vec::new();
        let mut log_depths = Vec::new();
        let log_depth_bounds = (settings.depth.min.ln(), settings.depth.max.ln());
        for host_ind in 0..num_key_frames {
            for host_cam_ind in 0..cam.size() {
                let host_points = &key_frames[host_ind].frames[host_cam_ind].optimized_points;
                for (local_ind, point) in host_points.iter().enumerate() {
                    if point.state != PointState::Active {
                        continue;
                    }
                    let log_depth = point.log_depth.clamp(log_depth_bounds.0, log_depth_bounds.1);
                    let mut has_residuals = false;
                    for target_ind in 0..num_key_frames {
                        if host_ind == target_ind {
                            continue;
                        }
                        for target_cam_ind in 0..cam.size() {
                            let host_to_target_image =
                                host_to_target.get(host_ind, host_cam_ind, target_ind, target_cam_ind);
                            let cam_target = &cam.bundle[target_cam_ind].cam;
                            let ray_target =
                                remap_depthed(host_to_target_image, &point.dir, log_depth.exp());
                            if !cam_target.is_mappable(&ray_target) {
                                continue;
                            }
                            let reproj = cam_target.map(&ray_target);
                            if !cam_target.is_on_image(&reproj, border) {
                                continue;
                            }

                            if !has_residuals {
                                has_residuals = true;
                                point_refs.push(PointRef {
                                    host_ind,
                                    host_cam_ind,
                                    point_ind: local_ind,
                                });
                                log_depths.push(log_depth);
                            }

                            residuals.push(Residual::new(
                                host_ind,
                                host_cam_ind,
                                target_ind,
                                target_cam_ind,
                                point_refs.len() - 1,
                                &cam.bundle[host_cam_ind].cam,
                                cam_target,
                                &key_frames[host_ind].frames[host_cam_ind],
                                point,
                                log_depth,
                                host_to_target_image,
                                &settings,
                            ));
                        }
                    }
                }
            }
        }
        parameters.set_points(point_refs, log_depths);

        info!(
            "created energy function with {} residuals over {} points",
            residuals.len(),
            parameters.num_points()
        );

        Ok(Self {
            cam,
            key_frames,
            parameters,
            residuals,
            loss,
            settings,
            callback: None,
        })
    }

    /// Install a diagnostic callback invoked once per iteration.
    pub fn set_iteration_callback(&mut self, callback: impl FnMut(&IterationInfo) + Send + 'a) {
        self.callback = Some(Box::new(callback));
    }

    pub fn num_points(&self) -> usize {
        self.parameters.num_points()
    }

    pub fn num_residuals(&self) -> usize {
        self.residuals.len()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn residual(&self, residual_ind: usize) -> &Residual {
        &self.residuals[residual_ind]
    }

    fn current_values(&self) -> Values {
        let host_to_target = PrecomputedHostToTarget::new(self.cam, &self.parameters);
        let light_host_to_target = PrecomputedLightHostToTarget::new(&self.parameters);
        Values::new(
            &self.residuals,
            &self.parameters,
            self.cam,
            self.key_frames,
            &host_to_target,
            &light_host_to_target,
        )
    }

    /// Photometric energy at the current parameters.
    pub fn total_energy(&self) -> f64 {
        self.current_values().total_energy(&self.residuals, &self.loss)
    }

    /// Pattern residual vector of one residual at the current parameters.
    pub fn residual_values(&self, residual_ind: usize) -> DVector<f64> {
        self.current_values().values(residual_ind).clone()
    }

    fn assemble(&self, values: &Values, derivatives: &Derivatives) -> (Hessian, Gradient) {
        let mut hessian_blocks = AccumulatedBlocks::new(
            self.parameters.num_key_frames(),
            self.parameters.cam_bundle_size(),
            self.parameters.num_points(),
        );
        let mut gradient_blocks = AccumulatedGradientBlocks::new(
            self.parameters.num_key_frames(),
            self.parameters.cam_bundle_size(),
            self.parameters.num_points(),
        );
        for (ri, res) in self.residuals.iter().enumerate() {
            let vals = values.values(ri);
            let weights = res.weights(vals, &self.loss);
            let jacobian = &derivatives.residual_jacobians[ri];
            hessian_blocks.add(res, &res.delta_hessian(&weights, jacobian));
            gradient_blocks.add(res, &res.delta_gradient(vals, &weights, jacobian));
        }
        let mut hessian = Hessian::new(&hessian_blocks, &derivatives.parametrization);
        let mut gradient = Gradient::new(&gradient_blocks, &derivatives.parametrization);
        // The anchor keyframe is the rigid gauge; eliminate it from the
        // solve so its delta is exactly zero.
        hessian.fix_frame(0);
        gradient.fix_frame(0);
        (hessian, gradient)
    }

    /// Run the adjustment and write the refined parameters back into the
    /// keyframes.
    pub fn optimize(&mut self, max_iterations: usize) -> DirectBaResult<OptimizationSummary> {
        let num_threads = self.settings.threading.num_threads;
        if num_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| DirectBaError::InvalidInput(format!("thread pool: {e}")))?;
            pool.install(|| self.optimize_inner(max_iterations))
        } else {
            self.optimize_inner(max_iterations)
        }
    }

    fn optimize_inner(&mut self, max_iterations: usize) -> DirectBaResult<OptimizationSummary> {
        let mut step_controller = StepController::new(&self.settings.optimization);

        if self.residuals.is_empty() {
            warn!("no residuals in the window, nothing to optimize");
            self.parameters.apply(self.key_frames);
            return Ok(OptimizationSummary {
                initial_energy: 0.0,
                final_energy: 0.0,
                iterations: 0,
                accepted_steps: 0,
                rejected_steps: 0,
                final_lambda: step_controller.lambda(),
            });
        }

        let mut host_to_target = PrecomputedHostToTarget::new(self.cam, &self.parameters);
        let mut light_host_to_target = PrecomputedLightHostToTarget::new(&self.parameters);
        let mut motion_derivatives =
            PrecomputedMotionDerivatives::new(self.cam, &self.parameters);
        let mut cur_values = Values::new(
            &self.residuals,
            &self.parameters,
            self.cam,
            self.key_frames,
            &host_to_target,
            &light_host_to_target,
        );
        let mut cur_derivatives = Derivatives::new(
            &self.residuals,
            &self.parameters,
            self.cam,
            self.key_frames,
            &host_to_target,
            &mut motion_derivatives,
            &light_host_to_target,
            &self.settings,
        );
        let (mut hessian, mut gradient) = self.assemble(&cur_values, &cur_derivatives);

        let initial_energy = cur_values.total_energy(&self.residuals, &self.loss);
        let mut cur_energy = initial_energy;
        let mut parameters_updated = false;
        let mut accepted_steps = 0;
        let mut rejected_steps = 0;
        let mut iterations = 0;

        for iteration in 0..max_iterations {
            if parameters_updated {
                // The linearization point moved: rebuild motion derivatives,
                // Jacobians, and the normal equations.
                motion_derivatives =
                    PrecomputedMotionDerivatives::new(self.cam, &self.parameters);
                cur_derivatives = Derivatives::new(
                    &self.residuals,
                    &self.parameters,
                    self.cam,
                    self.key_frames,
                    &host_to_target,
                    &mut motion_derivatives,
                    &light_host_to_target,
                    &self.settings,
                );
                let assembled = self.assemble(&cur_values, &cur_derivatives);
                hessian = assembled.0;
                gradient = assembled.1;
                parameters_updated = false;
            }

            cur_energy = cur_values.total_energy(&self.residuals, &self.loss);
            if cur_energy < ENERGY_TOLERANCE {
                debug!("energy {cur_energy:.3e} below tolerance, terminating");
                break;
            }
            let lambda = step_controller.lambda();
            if lambda > LAMBDA_OVERFLOW {
                debug!("lambda {lambda:.3e} overflowed, terminating");
                break;
            }
            iterations = iteration + 1;

            let damped = hessian.levenberg_marquardt_damp(lambda);
            let mut delta = match damped.solve(&gradient) {
                Ok(delta) => delta,
                Err(err) => {
                    debug!("linear solve failed ({err}), growing lambda");
                    step_controller.scale_lambda(self.settings.optimization.fail_multiplier);
                    rejected_steps += 1;
                    if let Some(cb) = self.callback.as_mut() {
                        cb(&IterationInfo {
                            iteration,
                            energy_before: cur_energy,
                            energy_after: cur_energy,
                            lambda,
                            accepted: false,
                        });
                    }
                    continue;
                }
            };
            if !self.settings.affine_light.optimize_affine_light {
                delta.set_affine_zero();
            }
            delta.constrain_depths(self.settings.optimization.max_abs_delta_d);

            // Predicted reduction of the damped quadratic model:
            // ½ δᵀ(λ·diag(H)·δ − g).
            let diagonal = hessian.diagonal();
            let predicted_reduction =
                0.5 * (lambda * delta.dot(&delta.component_mul(&diagonal)) - gradient.dot(&delta));
            let predicted_energy = cur_energy - predicted_reduction;

            let saved_state = self.parameters.save_state();
            self.parameters.update(&delta);

            let new_host_to_target = PrecomputedHostToTarget::new(self.cam, &self.parameters);
            let new_light_host_to_target = PrecomputedLightHostToTarget::new(&self.parameters);
            let new_values = Values::new(
                &self.residuals,
                &self.parameters,
                self.cam,
                self.key_frames,
                &new_host_to_target,
                &new_light_host_to_target,
            );
            let new_energy = new_values.total_energy(&self.residuals, &self.loss);

            let accepted = if predicted_reduction.abs() < PREDICTION_FLOOR {
                // The linear model predicts nothing measurable; judge by
                // energy alone.
                let ok = new_energy < cur_energy;
                step_controller.scale_lambda(if ok {
                    self.settings.optimization.success_multiplier
                } else {
                    self.settings.optimization.fail_multiplier
                });
                ok
            } else {
                let quality_ok =
                    step_controller.new_step(cur_energy, new_energy, predicted_energy);
                quality_ok && new_energy < cur_energy
            };

            info!(
                "iteration {iteration}: energy {cur_energy:.6e} -> {new_energy:.6e}, \
                 lambda {lambda:.3e}, {}",
                if accepted { "accepted" } else { "rejected" }
            );
            if let Some(cb) = self.callback.as_mut() {
                cb(&IterationInfo {
                    iteration,
                    energy_before: cur_energy,
                    energy_after: new_energy,
                    lambda,
                    accepted,
                });
            }

            if accepted {
                cur_values = new_values;
                host_to_target = new_host_to_target;
                light_host_to_target = new_light_host_to_target;
                cur_energy = new_energy;
                parameters_updated = true;
                accepted_steps += 1;
            } else {
                self.parameters.recover_state(saved_state);
                rejected_steps += 1;
            }
        }

        self.parameters.apply(self.key_frames);

        let summary = OptimizationSummary {
            initial_energy,
            final_energy: cur_energy,
            iterations,
            accepted_steps,
            rejected_steps,
            final_lambda: step_controller.lambda(),
        };
        info!(
            "bundle adjustment finished: energy {:.6e} -> {:.6e} in {} iterations \
             ({} accepted, {} rejected)",
            summary.initial_energy,
            summary.final_energy,
            summary.iterations,
            summary.accepted_steps,
            summary.rejected_steps
        );
        Ok(summary)
    }
}
