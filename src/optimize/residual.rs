//! One photometric residual: a (host entry, target entry, point) triple.
//!
//! A residual compares the bicubically sampled target intensities around the
//! point's reprojection with the affine-brightness-transformed host
//! intensities over a fixed pattern of pixel offsets. Construction
//! precomputes everything that stays fixed over the solve: the reprojected
//! pattern shape (linearized under small reprojection deformation), the host
//! intensities, and the gradient-based sample weights.
//!
//! Entries and points are referenced by stable indices
//! `(hi, hci, ti, tci, pi)`; the parameter block is the single owner of the
//! mutable state.

use crate::camera::CameraModel;
use crate::keyframe::{AffineLight, KeyFrameEntry, OptimizedPoint};
use crate::loss::RobustLoss;
use crate::optimize::motion::MotionDerivatives;
use crate::optimize::{Mat27, Mat72, Mat77, MatR2, Vec7};
use crate::settings::Settings;
use nalgebra::{DVector, Isometry3, Matrix2, Matrix2x3, Matrix2x4, Vector2, Vector3};
use std::fmt;

/// Transform a host ray at the given depth; non-finite depth degenerates to
/// the rotation-only (infinite depth) reprojection.
#[inline]
pub fn remap_depthed(
    frame_to_frame: &Isometry3<f64>,
    ray: &Vector3<f64>,
    depth: f64,
) -> Vector3<f64> {
    if depth.is_finite() {
        frame_to_frame.rotation * (ray * depth) + frame_to_frame.translation.vector
    } else {
        frame_to_frame.rotation * ray
    }
}

/// Scale each row of a pattern-length matrix by the matching weight.
fn scale_rows(m: &MatR2, weights: &DVector<f64>) -> MatR2 {
    let mut out = m.clone();
    for i in 0..out.nrows() {
        out[(i, 0)] *= weights[i];
        out[(i, 1)] *= weights[i];
    }
    out
}

/// Partials of the reprojection and the pattern residuals with respect to one
/// frame's parameters (pose in storage coordinates, affine pair).
#[derive(Debug, Clone)]
pub struct DiffFrameParams {
    /// ∂(reprojection)/∂(quaternion), 2×4
    pub dp_dq: Matrix2x4<f64>,
    /// ∂(reprojection)/∂(translation), 2×3
    pub dp_dt: Matrix2x3<f64>,
    /// ∂(residuals)/∂(a, b), one row per pattern sample
    pub dr_dab: MatR2,
}

impl DiffFrameParams {
    fn zeros(pattern_size: usize) -> Self {
        Self {
            dp_dq: Matrix2x4::zeros(),
            dp_dt: Matrix2x3::zeros(),
            dr_dab: MatR2::zeros(pattern_size),
        }
    }
}

/// Analytic Jacobian of one residual at a parameter point.
#[derive(Debug, Clone)]
pub struct ResidualJacobian {
    pub dhost: DiffFrameParams,
    pub dtarget: DiffFrameParams,
    /// ∂(reprojection)/∂(log-depth)
    pub dp_dlogd: Vector2<f64>,
    /// Target image gradient at each pattern sample, rows (∂I/∂x, ∂I/∂y)
    pub grad_i_target: MatR2,
    /// The depth was non-finite and the rotation-only model was linearized
    pub is_inf_depth: bool,
}

impl ResidualJacobian {
    fn new(pattern_size: usize) -> Self {
        Self {
            dhost: DiffFrameParams::zeros(pattern_size),
            dtarget: DiffFrameParams::zeros(pattern_size),
            dp_dlogd: Vector2::zeros(),
            grad_i_target: MatR2::zeros(pattern_size),
            is_inf_depth: false,
        }
    }

    /// Host pose block `[∂p/∂q | ∂p/∂t]` (2×7).
    pub fn dhost_dp_dqt(&self) -> Mat27 {
        let mut m = Mat27::zeros();
        m.fixed_view_mut::<2, 4>(0, 0).copy_from(&self.dhost.dp_dq);
        m.fixed_view_mut::<2, 3>(0, 4).copy_from(&self.dhost.dp_dt);
        m
    }

    /// Target pose block `[∂p/∂q | ∂p/∂t]` (2×7).
    pub fn dtarget_dp_dqt(&self) -> Mat27 {
        let mut m = Mat27::zeros();
        m.fixed_view_mut::<2, 4>(0, 0).copy_from(&self.dtarget.dp_dq);
        m.fixed_view_mut::<2, 3>(0, 4).copy_from(&self.dtarget.dp_dt);
        m
    }

    /// Pattern residual derivative along log-depth.
    pub fn dr_dlogd(&self) -> DVector<f64> {
        &self.grad_i_target * self.dp_dlogd
    }
}

/// Frame-frame block of one residual's Hessian contribution, split by
/// parameter group.
#[derive(Debug, Clone)]
pub struct FrameFrameHessian {
    pub qtqt: Mat77,
    pub qtab: Mat72,
    pub abqt: Mat27,
    pub abab: Matrix2<f64>,
}

impl FrameFrameHessian {
    pub fn transpose(&self) -> FrameFrameHessian {
        FrameFrameHessian {
            qtqt: self.qtqt.transpose(),
            qtab: self.abqt.transpose(),
            abqt: self.qtab.transpose(),
            abab: self.abab.transpose(),
        }
    }
}

/// Frame-point block of one residual's Hessian contribution.
#[derive(Debug, Clone)]
pub struct FramePointHessian {
    pub qtd: Vec7,
    pub abd: Vector2<f64>,
}

/// All block contributions of one residual to the normal equations.
#[derive(Debug, Clone)]
pub struct DeltaHessian {
    pub host_host: FrameFrameHessian,
    pub host_target: FrameFrameHessian,
    pub target_target: FrameFrameHessian,
    pub host_point: FramePointHessian,
    pub target_point: FramePointHessian,
    pub point_point: f64,
}

/// One frame's share of a residual's gradient contribution.
#[derive(Debug, Clone)]
pub struct FrameGradient {
    pub qt: Vec7,
    pub ab: Vector2<f64>,
}

/// All gradient contributions of one residual.
#[derive(Debug, Clone)]
pub struct DeltaGradient {
    pub host: FrameGradient,
    pub target: FrameGradient,
    pub point: f64,
}

fn frame_frame(
    df1_dp_dqt: &Mat27,
    df2_dp_dqt: &Mat27,
    df1_dr_dab: &MatR2,
    df2_dr_dab: &MatR2,
    weights: &DVector<f64>,
    sum_wgradgrad: &Matrix2<f64>,
    sum_gradab1: &Matrix2<f64>,
    sum_gradab2: &Matrix2<f64>,
    same_frame: bool,
) -> FrameFrameHessian {
    let qtqt = df1_dp_dqt.transpose() * sum_wgradgrad * df2_dp_dqt;
    let qtab = df1_dp_dqt.transpose() * sum_gradab2;
    let abqt = if same_frame {
        qtab.transpose()
    } else {
        sum_gradab1.transpose() * df2_dp_dqt
    };
    let abab = scale_rows(df1_dr_dab, weights).transpose() * df2_dr_dab;
    FrameFrameHessian {
        qtqt,
        qtab,
        abqt,
        abab,
    }
}

fn frame_point(
    dp_dqt: &Mat27,
    dp_dlogd: &Vector2<f64>,
    sum_wgradgrad: &Matrix2<f64>,
    sum_gradab: &Matrix2<f64>,
) -> FramePointHessian {
    FramePointHessian {
        qtd: dp_dqt.transpose() * sum_wgradgrad * dp_dlogd,
        abd: sum_gradab.transpose() * dp_dlogd,
    }
}

/// One photometric residual between a host and a target keyframe entry.
#[derive(Debug, Clone)]
pub struct Residual {
    host_ind: usize,
    host_cam_ind: usize,
    target_ind: usize,
    target_cam_ind: usize,
    point_ind: usize,
    host_point: Vector2<f64>,
    host_dir: Vector3<f64>,
    /// Pattern shape in the target image, relative to the center reprojection
    reproj_pattern: Vec<Vector2<f64>>,
    host_intensities: DVector<f64>,
    grad_weights: DVector<f64>,
    loss_eps: f64,
}

impl Residual {
    /// Precompute the reprojected pattern, host intensities, and gradient
    /// weights. The caller has already verified that the center reprojection
    /// is mappable and inside the target image.
    #[allow(clippy::too_many_arguments)]
    pub fn new<C: CameraModel>(
        host_ind: usize,
        host_cam_ind: usize,
        target_ind: usize,
        target_cam_ind: usize,
        point_ind: usize,
        cam_host: &C,
        cam_target: &C,
        host_entry: &KeyFrameEntry,
        point: &OptimizedPoint,
        log_depth: f64,
        host_to_target_image: &Isometry3<f64>,
        settings: &Settings,
    ) -> Self {
        let pattern = settings.residual_pattern.pattern();
        let pattern_size = pattern.len();
        let depth = log_depth.exp();

        let reproj = cam_target.map(&remap_depthed(host_to_target_image, &point.dir, depth));
        let mut reproj_pattern = Vec::with_capacity(pattern_size);
        for offset in pattern {
            let ray = cam_host.unmap(&(point.p + offset)).normalize();
            let shifted = cam_target.map(&remap_depthed(host_to_target_image, &ray, depth));
            reproj_pattern.push(shifted - reproj);
        }

        let host_image = host_entry.image();
        let mut host_intensities = DVector::zeros(pattern_size);
        let mut grad_weights = DVector::zeros(pattern_size);
        let c = settings.residual_weighting.c;
        for (i, offset) in pattern.iter().enumerate() {
            let p = point.p + offset;
            let (intensity, grad_y, grad_x) = host_image.evaluate(p.y, p.x);
            host_intensities[i] = intensity;
            let norm_sq = grad_x * grad_x + grad_y * grad_y;
            grad_weights[i] = c / (c * c + norm_sq).sqrt();
        }

        Self {
            host_ind,
            host_cam_ind,
            target_ind,
            target_cam_ind,
            point_ind,
            host_point: point.p,
            host_dir: point.dir,
            reproj_pattern,
            host_intensities,
            grad_weights,
            loss_eps: settings.residual_weighting.loss_eps,
        }
    }

    pub fn host_ind(&self) -> usize {
        self.host_ind
    }

    pub fn host_cam_ind(&self) -> usize {
        self.host_cam_ind
    }

    pub fn target_ind(&self) -> usize {
        self.target_ind
    }

    pub fn target_cam_ind(&self) -> usize {
        self.target_cam_ind
    }

    pub fn point_ind(&self) -> usize {
        self.point_ind
    }

    pub fn pattern_size(&self) -> usize {
        self.reproj_pattern.len()
    }

    pub fn grad_weights(&self) -> &DVector<f64> {
        &self.grad_weights
    }

    pub fn host_intensities(&self) -> &DVector<f64> {
        &self.host_intensities
    }

    /// Evaluate the pattern residuals at the current parameters.
    ///
    /// `reproj_out`, when given, receives the center reprojection in target
    /// pixels.
    pub fn values<C: CameraModel>(
        &self,
        cam_target: &C,
        target_entry: &KeyFrameEntry,
        host_to_target: &Isometry3<f64>,
        light_host_to_target: &AffineLight,
        log_depth: f64,
        reproj_out: Option<&mut Vector2<f64>>,
    ) -> DVector<f64> {
        let depth = log_depth.exp();
        let reproj = cam_target.map(&remap_depthed(host_to_target, &self.host_dir, depth));
        let target_image = target_entry.image();

        let mut result = DVector::zeros(self.pattern_size());
        for i in 0..self.pattern_size() {
            let p = reproj + self.reproj_pattern[i];
            let target_intensity = target_image.sample(p.y, p.x);
            result[i] = target_intensity - light_host_to_target.apply(self.host_intensities[i]);
        }

        if let Some(out) = reproj_out {
            *out = reproj;
        }
        result
    }

    /// Per-sample weights: gradient weight times the curvature-corrected
    /// robust weight `max(ρ' + 2ρ''v², ε·ρ')`.
    pub fn weights(&self, values: &DVector<f64>, loss: &RobustLoss) -> DVector<f64> {
        DVector::from_fn(self.pattern_size(), |i, _| {
            let v2 = values[i] * values[i];
            let [_, rho1, rho2] = loss.evaluate(v2);
            let robust = (rho1 + 2.0 * rho2 * v2).max(self.loss_eps * rho1);
            self.grad_weights[i] * robust
        })
    }

    /// Closed-form Jacobian with respect to log-depth, both poses (storage
    /// coordinates), and both affine pairs.
    #[allow(clippy::too_many_arguments)]
    pub fn jacobian<C: CameraModel>(
        &self,
        cam_target: &C,
        target_entry: &KeyFrameEntry,
        host_to_target: &Isometry3<f64>,
        d_host_to_target: &MotionDerivatives,
        light_world_to_host: &AffineLight,
        light_host_to_target: &AffineLight,
        log_depth: f64,
        depth_max: f64,
    ) -> ResidualJacobian {
        let mut jacobian = ResidualJacobian::new(self.pattern_size());

        let mut depth = log_depth.exp();
        if !depth.is_finite() {
            jacobian.is_inf_depth = true;
            depth = depth_max;
        }
        let host_vec = depth * self.host_dir;
        let target_vec =
            host_to_target.rotation * host_vec + host_to_target.translation.vector;

        let (reproj, dpi) = cam_target.diff_map(&target_vec);

        let target_image = target_entry.image();
        for i in 0..self.pattern_size() {
            let p = reproj + self.reproj_pattern[i];
            let (_, grad_y, grad_x) = target_image.evaluate(p.y, p.x);
            jacobian.grad_i_target[(i, 0)] = grad_x;
            jacobian.grad_i_target[(i, 1)] = grad_y;
        }

        jacobian.dp_dlogd = dpi * (host_to_target.rotation * host_vec);
        jacobian.dhost.dp_dq = dpi * d_host_to_target.daction_dq_host(&host_vec);
        jacobian.dhost.dp_dt = dpi * d_host_to_target.daction_dt_host;
        jacobian.dtarget.dp_dq = dpi * d_host_to_target.daction_dq_target(&host_vec);
        jacobian.dtarget.dp_dt = dpi * d_host_to_target.daction_dt_target;

        for i in 0..self.pattern_size() {
            let d_da =
                light_host_to_target.ea() * (self.host_intensities[i] - light_world_to_host.b);
            jacobian.dhost.dr_dab[(i, 0)] = d_da;
            jacobian.dhost.dr_dab[(i, 1)] = light_host_to_target.ea();
            jacobian.dtarget.dr_dab[(i, 0)] = -d_da;
            jacobian.dtarget.dr_dab[(i, 1)] = -1.0;
        }

        jacobian
    }

    /// Contract the Jacobian into the per-residual Hessian blocks
    /// `Σᵢ wᵢ JᵀJ`, with the target image gradient as the shared inner
    /// factor.
    pub fn delta_hessian(
        &self,
        weights: &DVector<f64>,
        jacobian: &ResidualJacobian,
    ) -> DeltaHessian {
        let dhost_dp_dqt = jacobian.dhost_dp_dqt();
        let dtarget_dp_dqt = jacobian.dtarget_dp_dqt();

        let weighted_grad = scale_rows(&jacobian.grad_i_target, weights);
        let sum_wgradgrad: Matrix2<f64> = jacobian.grad_i_target.transpose() * &weighted_grad;
        let sum_gradab_host: Matrix2<f64> = weighted_grad.transpose() * &jacobian.dhost.dr_dab;
        let sum_gradab_target: Matrix2<f64> = weighted_grad.transpose() * &jacobian.dtarget.dr_dab;

        let host_host = frame_frame(
            &dhost_dp_dqt,
            &dhost_dp_dqt,
            &jacobian.dhost.dr_dab,
            &jacobian.dhost.dr_dab,
            weights,
            &sum_wgradgrad,
            &sum_gradab_host,
            &sum_gradab_host,
            true,
        );
        let host_target = frame_frame(
            &dhost_dp_dqt,
            &dtarget_dp_dqt,
            &jacobian.dhost.dr_dab,
            &jacobian.dtarget.dr_dab,
            weights,
            &sum_wgradgrad,
            &sum_gradab_host,
            &sum_gradab_target,
            false,
        );
        let target_target = frame_frame(
            &dtarget_dp_dqt,
            &dtarget_dp_dqt,
            &jacobian.dtarget.dr_dab,
            &jacobian.dtarget.dr_dab,
            weights,
            &sum_wgradgrad,
            &sum_gradab_target,
            &sum_gradab_target,
            true,
        );

        let host_point = frame_point(
            &dhost_dp_dqt,
            &jacobian.dp_dlogd,
            &sum_wgradgrad,
            &sum_gradab_host,
        );
        let target_point = frame_point(
            &dtarget_dp_dqt,
            &jacobian.dp_dlogd,
            &sum_wgradgrad,
            &sum_gradab_target,
        );

        let point_point = jacobian.dp_dlogd.dot(&(sum_wgradgrad * jacobian.dp_dlogd));

        DeltaHessian {
            host_host,
            host_target,
            target_target,
            host_point,
            target_point,
            point_point,
        }
    }

    /// Contract the Jacobian into the per-residual gradient `Jᵀ W r`.
    pub fn delta_gradient(
        &self,
        values: &DVector<f64>,
        weights: &DVector<f64>,
        jacobian: &ResidualJacobian,
    ) -> DeltaGradient {
        let mut wgrad_r = Vector2::zeros();
        let mut ab_host = Vector2::zeros();
        let mut ab_target = Vector2::zeros();
        for i in 0..self.pattern_size() {
            let wr = weights[i] * values[i];
            wgrad_r.x += wr * jacobian.grad_i_target[(i, 0)];
            wgrad_r.y += wr * jacobian.grad_i_target[(i, 1)];
            ab_host.x += wr * jacobian.dhost.dr_dab[(i, 0)];
            ab_host.y += wr * jacobian.dhost.dr_dab[(i, 1)];
            ab_target.x += wr * jacobian.dtarget.dr_dab[(i, 0)];
            ab_target.y += wr * jacobian.dtarget.dr_dab[(i, 1)];
        }

        DeltaGradient {
            host: FrameGradient {
                qt: jacobian.dhost_dp_dqt().transpose() * wgrad_r,
                ab: ab_host,
            },
            target: FrameGradient {
                qt: jacobian.dtarget_dp_dqt().transpose() * wgrad_r,
                ab: ab_target,
            },
            point: jacobian.dp_dlogd.dot(&wgrad_r),
        }
    }
}

impl fmt::Display for Residual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "residual host ({}, {}) target ({}, {}) point {} at [{:.1}, {:.1}]",
            self.host_ind,
            self.host_cam_ind,
            self.target_ind,
            self.target_cam_ind,
            self.point_ind,
            self.host_point.x,
            self.host_point.y
        )
    }
}
