//! Assembly of the block-structured normal equations.
//!
//! Residual contributions are first summed in storage coordinates
//! ([`AccumulatedBlocks`] / [`AccumulatedGradientBlocks`]), then contracted
//! with the per-keyframe parametrization Jacobians into the minimal frame
//! system:
//!
//! - `H_FF`: dense symmetric, `numKeyFrames · (6 + 2·camBundleSize)`
//! - `H_FP`: one column per point, rows only at the host/target frames
//! - `H_PP`: diagonal, one entry per point (all residuals of a point share
//!   its log-depth)
//!
//! Levenberg-Marquardt damping adds `λ·diag(H)` to the frame and point
//! blocks; the damped system is reduced by Schur elimination in
//! [`crate::linalg::SchurComplementSolver`].

use crate::linalg::{LinAlgResult, SchurComplementSolver};
use crate::optimize::delta::{DeltaParameterVector, FrameParameterOrder};
use crate::optimize::parametrization::ParametrizationJacobians;
use crate::optimize::residual::{DeltaGradient, DeltaHessian, Residual};
use crate::optimize::{Mat72, Mat77, Vec7};
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

/// Per-residual Hessian contributions summed in storage coordinates.
#[derive(Debug, Clone)]
pub struct AccumulatedBlocks {
    num_key_frames: usize,
    num_cameras: usize,
    num_points: usize,
    /// `[hi][ti]`, both orientations stored explicitly
    pose_pose: Vec<Mat77>,
    /// `[hi][(ti, tci)]`, pose rows, affine columns
    pose_aff: Vec<Mat72>,
    /// `[(hi, hci)][(ti, tci)]`
    aff_aff: Vec<Matrix2<f64>>,
    /// `[hi][pi]`
    pose_point: Vec<Vec7>,
    /// `[(hi, hci)][pi]`
    aff_point: Vec<Vector2<f64>>,
    /// `[pi]`
    point_point: Vec<f64>,
}

impl AccumulatedBlocks {
    pub fn new(num_key_frames: usize, num_cameras: usize, num_points: usize) -> Self {
        let entries = num_key_frames * num_cameras;
        Self {
            num_key_frames,
            num_cameras,
            num_points,
            pose_pose: vec![Mat77::zeros(); num_key_frames * num_key_frames],
            pose_aff: vec![Mat72::zeros(); num_key_frames * entries],
            aff_aff: vec![Matrix2::zeros(); entries * entries],
            pose_point: vec![Vec7::zeros(); num_key_frames * num_points],
            aff_point: vec![Vector2::zeros(); entries * num_points],
            point_point: vec![0.0; num_points],
        }
    }

    #[inline]
    fn entry_ind(&self, frame_ind: usize, cam_ind: usize) -> usize {
        frame_ind * self.num_cameras + cam_ind
    }

    /// Route one residual's blocks into the window-level sums.
    pub fn add(&mut self, residual: &Residual, delta: &DeltaHessian) {
        let (hi, hci) = (residual.host_ind(), residual.host_cam_ind());
        let (ti, tci) = (residual.target_ind(), residual.target_cam_ind());
        let pi = residual.point_ind();
        let n = self.num_key_frames;
        let entries = n * self.num_cameras;
        let host_entry = self.entry_ind(hi, hci);
        let target_entry = self.entry_ind(ti, tci);

        self.pose_pose[hi * n + hi] += delta.host_host.qtqt;
        self.pose_pose[ti * n + ti] += delta.target_target.qtqt;
        self.pose_pose[hi * n + ti] += delta.host_target.qtqt;
        self.pose_pose[ti * n + hi] += delta.host_target.qtqt.transpose();

        self.pose_aff[hi * entries + host_entry] += delta.host_host.qtab;
        self.pose_aff[hi * entries + target_entry] += delta.host_target.qtab;
        self.pose_aff[ti * entries + host_entry] += delta.host_target.abqt.transpose();
        self.pose_aff[ti * entries + target_entry] += delta.target_target.qtab;

        self.aff_aff[host_entry * entries + host_entry] += delta.host_host.abab;
        self.aff_aff[target_entry * entries + target_entry] += delta.target_target.abab;
        self.aff_aff[host_entry * entries + target_entry] += delta.host_target.abab;
        self.aff_aff[target_entry * entries + host_entry] += delta.host_target.abab.transpose();

        self.pose_point[hi * self.num_points + pi] += delta.host_point.qtd;
        self.pose_point[ti * self.num_points + pi] += delta.target_point.qtd;
        self.aff_point[host_entry * self.num_points + pi] += delta.host_point.abd;
        self.aff_point[target_entry * self.num_points + pi] += delta.target_point.abd;

        self.point_point[pi] += delta.point_point;
    }
}

/// Per-residual gradient contributions summed in storage coordinates.
#[derive(Debug, Clone)]
pub struct AccumulatedGradientBlocks {
    num_cameras: usize,
    pose: Vec<Vec7>,
    aff: Vec<Vector2<f64>>,
    point: Vec<f64>,
}

impl AccumulatedGradientBlocks {
    pub fn new(num_key_frames: usize, num_cameras: usize, num_points: usize) -> Self {
        Self {
            num_cameras,
            pose: vec![Vec7::zeros(); num_key_frames],
            aff: vec![Vector2::zeros(); num_key_frames * num_cameras],
            point: vec![0.0; num_points],
        }
    }

    pub fn add(&mut self, residual: &Residual, delta: &DeltaGradient) {
        let (hi, hci) = (residual.host_ind(), residual.host_cam_ind());
        let (ti, tci) = (residual.target_ind(), residual.target_cam_ind());
        self.pose[hi] += delta.host.qt;
        self.pose[ti] += delta.target.qt;
        self.aff[hi * self.num_cameras + hci] += delta.host.ab;
        self.aff[ti * self.num_cameras + tci] += delta.target.ab;
        self.point[residual.point_ind()] += delta.point;
    }
}

/// The assembled normal-equation matrix in minimal coordinates.
#[derive(Debug, Clone)]
pub struct Hessian {
    order: FrameParameterOrder,
    pub frame_frame: DMatrix<f64>,
    pub frame_point: DMatrix<f64>,
    pub point_point: DVector<f64>,
}

impl Hessian {
    /// Contract the storage-coordinate sums with the parametrization
    /// Jacobians.
    pub fn new(blocks: &AccumulatedBlocks, parametrization: &ParametrizationJacobians) -> Self {
        let n = blocks.num_key_frames;
        let num_cameras = blocks.num_cameras;
        let num_points = blocks.num_points;
        let entries = n * num_cameras;
        let order = FrameParameterOrder::new(n, num_cameras);
        let dim = order.total_frame_parameters();

        let pose_maps: Vec<_> = (0..n).map(|i| parametrization.pose_block(i)).collect();

        let mut frame_frame = DMatrix::zeros(dim, dim);
        for hi in 0..n {
            for ti in 0..n {
                let minimal = pose_maps[hi].transpose() * blocks.pose_pose[hi * n + ti]
                    * pose_maps[ti];
                frame_frame
                    .view_mut((order.rot_offset(hi), order.rot_offset(ti)), (6, 6))
                    .copy_from(&minimal);
            }
            for ti in 0..n {
                for tci in 0..num_cameras {
                    let entry = ti * num_cameras + tci;
                    let minimal =
                        pose_maps[hi].transpose() * blocks.pose_aff[hi * entries + entry];
                    let row = order.rot_offset(hi);
                    let col = order.aff_offset(ti, tci);
                    frame_frame.view_mut((row, col), (6, 2)).copy_from(&minimal);
                    frame_frame
                        .view_mut((col, row), (2, 6))
                        .copy_from(&minimal.transpose());
                }
            }
        }
        for he in 0..entries {
            for te in 0..entries {
                let (hi, hci) = (he / num_cameras, he % num_cameras);
                let (ti, tci) = (te / num_cameras, te % num_cameras);
                frame_frame
                    .view_mut((order.aff_offset(hi, hci), order.aff_offset(ti, tci)), (2, 2))
                    .copy_from(&blocks.aff_aff[he * entries + te]);
            }
        }

        let mut frame_point = DMatrix::zeros(dim, num_points);
        for hi in 0..n {
            for pi in 0..num_points {
                let minimal =
                    pose_maps[hi].transpose() * blocks.pose_point[hi * num_points + pi];
                frame_point
                    .view_mut((order.rot_offset(hi), pi), (6, 1))
                    .copy_from(&minimal);
            }
            for hci in 0..num_cameras {
                let entry = hi * num_cameras + hci;
                for pi in 0..num_points {
                    let block = blocks.aff_point[entry * num_points + pi];
                    frame_point[(order.aff_offset(hi, hci), pi)] = block.x;
                    frame_point[(order.aff_offset(hi, hci) + 1, pi)] = block.y;
                }
            }
        }

        Self {
            order,
            frame_frame,
            frame_point,
            point_point: DVector::from_vec(blocks.point_point.clone()),
        }
    }

    pub fn order(&self) -> FrameParameterOrder {
        self.order
    }

    /// Decouple a gauge-fixed keyframe from the system: zero its rows and
    /// columns and put ones on its diagonal, so the solve returns an exactly
    /// zero delta for it instead of spreading corrections across the gauge.
    pub fn fix_frame(&mut self, frame_ind: usize) {
        let start = self.order.rot_offset(frame_ind);
        let size = self.order.frame_size();
        for i in start..start + size {
            for j in 0..self.frame_frame.ncols() {
                self.frame_frame[(i, j)] = 0.0;
                self.frame_frame[(j, i)] = 0.0;
            }
            self.frame_frame[(i, i)] = 1.0;
            for p in 0..self.frame_point.ncols() {
                self.frame_point[(i, p)] = 0.0;
            }
        }
    }

    /// `H + λ·diag(H)` on the frame and point blocks (Marquardt scaling).
    pub fn levenberg_marquardt_damp(&self, lambda: f64) -> Hessian {
        let mut damped = self.clone();
        for i in 0..damped.frame_frame.nrows() {
            damped.frame_frame[(i, i)] += lambda * self.frame_frame[(i, i)];
        }
        for i in 0..damped.point_point.len() {
            damped.point_point[i] += lambda * self.point_point[i];
        }
        damped
    }

    /// Diagonal of the block system as a parameter-shaped vector.
    pub fn diagonal(&self) -> DeltaParameterVector {
        DeltaParameterVector::from_parts(
            self.order,
            self.frame_frame.diagonal(),
            self.point_point.clone(),
        )
    }

    /// Schur-eliminate the point block and solve `H δ = -g`.
    pub fn solve(&self, gradient: &Gradient) -> LinAlgResult<DeltaParameterVector> {
        let solver = SchurComplementSolver::new();
        let (frame, point) = solver.solve(
            &self.frame_frame,
            &self.frame_point,
            &self.point_point,
            &gradient.frame,
            &gradient.point,
        )?;
        Ok(DeltaParameterVector::from_parts(self.order, frame, point))
    }
}

/// The assembled gradient in minimal coordinates.
#[derive(Debug, Clone)]
pub struct Gradient {
    order: FrameParameterOrder,
    pub frame: DVector<f64>,
    pub point: DVector<f64>,
}

impl Gradient {
    pub fn new(
        blocks: &AccumulatedGradientBlocks,
        parametrization: &ParametrizationJacobians,
    ) -> Self {
        let n = blocks.pose.len();
        let num_cameras = blocks.num_cameras;
        let order = FrameParameterOrder::new(n, num_cameras);

        let mut frame = DVector::zeros(order.total_frame_parameters());
        for i in 0..n {
            let minimal = parametrization.pose_block(i).transpose() * blocks.pose[i];
            frame
                .view_mut((order.rot_offset(i), 0), (6, 1))
                .copy_from(&minimal);
            for ci in 0..num_cameras {
                let ab = blocks.aff[i * num_cameras + ci];
                frame[order.aff_offset(i, ci)] = ab.x;
                frame[order.aff_offset(i, ci) + 1] = ab.y;
            }
        }

        Self {
            order,
            frame,
            point: DVector::from_vec(blocks.point.clone()),
        }
    }

    pub fn order(&self) -> FrameParameterOrder {
        self.order
    }

    /// Zero the gradient entries of a gauge-fixed keyframe.
    pub fn fix_frame(&mut self, frame_ind: usize) {
        let start = self.order.rot_offset(frame_ind);
        for i in start..start + self.order.frame_size() {
            self.frame[i] = 0.0;
        }
    }

    pub fn dot(&self, delta: &DeltaParameterVector) -> f64 {
        self.frame.dot(delta.frame()) + self.point.dot(delta.point())
    }
}
