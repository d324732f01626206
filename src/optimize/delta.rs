//! The minimal-coordinate update vector of one Levenberg-Marquardt step.
//!
//! Frame parameters are laid out per keyframe as
//! `[so(3) rotation (3), translation (3), (a, b) per camera]`; point
//! parameters are the per-point log-depth deltas.

use nalgebra::{DVector, Vector2, Vector3};

/// Index arithmetic of the frame parameter layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParameterOrder {
    num_key_frames: usize,
    num_cameras: usize,
}

impl FrameParameterOrder {
    pub fn new(num_key_frames: usize, num_cameras: usize) -> Self {
        Self {
            num_key_frames,
            num_cameras,
        }
    }

    pub fn num_key_frames(&self) -> usize {
        self.num_key_frames
    }

    pub fn num_cameras(&self) -> usize {
        self.num_cameras
    }

    /// Minimal parameters per keyframe: 3 rotation + 3 translation + 2 per camera.
    pub fn frame_size(&self) -> usize {
        6 + 2 * self.num_cameras
    }

    pub fn total_frame_parameters(&self) -> usize {
        self.num_key_frames * self.frame_size()
    }

    pub fn rot_offset(&self, frame_ind: usize) -> usize {
        frame_ind * self.frame_size()
    }

    pub fn trans_offset(&self, frame_ind: usize) -> usize {
        self.rot_offset(frame_ind) + 3
    }

    pub fn aff_offset(&self, frame_ind: usize, cam_ind: usize) -> usize {
        self.rot_offset(frame_ind) + 6 + 2 * cam_ind
    }
}

/// One tangent-space increment over all active parameters.
#[derive(Debug, Clone)]
pub struct DeltaParameterVector {
    order: FrameParameterOrder,
    frame: DVector<f64>,
    point: DVector<f64>,
}

impl DeltaParameterVector {
    pub fn zeros(num_key_frames: usize, num_cameras: usize, num_points: usize) -> Self {
        let order = FrameParameterOrder::new(num_key_frames, num_cameras);
        Self {
            frame: DVector::zeros(order.total_frame_parameters()),
            point: DVector::zeros(num_points),
            order,
        }
    }

    pub fn from_parts(
        order: FrameParameterOrder,
        frame: DVector<f64>,
        point: DVector<f64>,
    ) -> Self {
        debug_assert_eq!(frame.len(), order.total_frame_parameters());
        Self {
            order,
            frame,
            point,
        }
    }

    pub fn order(&self) -> FrameParameterOrder {
        self.order
    }

    pub fn frame(&self) -> &DVector<f64> {
        &self.frame
    }

    pub fn point(&self) -> &DVector<f64> {
        &self.point
    }

    pub fn rot(&self, frame_ind: usize) -> Vector3<f64> {
        self.frame
            .fixed_rows::<3>(self.order.rot_offset(frame_ind))
            .into_owned()
    }

    pub fn trans(&self, frame_ind: usize) -> Vector3<f64> {
        self.frame
            .fixed_rows::<3>(self.order.trans_offset(frame_ind))
            .into_owned()
    }

    pub fn aff(&self, frame_ind: usize, cam_ind: usize) -> Vector2<f64> {
        self.frame
            .fixed_rows::<2>(self.order.aff_offset(frame_ind, cam_ind))
            .into_owned()
    }

    pub fn point_delta(&self, point_ind: usize) -> f64 {
        self.point[point_ind]
    }

    pub fn dot(&self, other: &DeltaParameterVector) -> f64 {
        self.frame.dot(&other.frame) + self.point.dot(&other.point)
    }

    /// Component-wise product, used to contract a step with a Hessian diagonal.
    pub fn component_mul(&self, other: &DeltaParameterVector) -> DeltaParameterVector {
        DeltaParameterVector {
            order: self.order,
            frame: self.frame.component_mul(&other.frame),
            point: self.point.component_mul(&other.point),
        }
    }

    /// Zero the affine blocks of every non-anchor keyframe.
    pub fn set_affine_zero(&mut self) {
        for frame_ind in 1..self.order.num_key_frames() {
            for cam_ind in 0..self.order.num_cameras() {
                let offset = self.order.aff_offset(frame_ind, cam_ind);
                self.frame[offset] = 0.0;
                self.frame[offset + 1] = 0.0;
            }
        }
    }

    /// Clip runaway log-depth deltas to zero; the point waits for the next
    /// linearization instead of jumping.
    pub fn constrain_depths(&mut self, max_abs_delta_d: f64) {
        for d in self.point.iter_mut() {
            if d.abs() > max_abs_delta_d {
                *d = 0.0;
            }
        }
    }
}

impl std::ops::Mul<&DeltaParameterVector> for f64 {
    type Output = DeltaParameterVector;

    fn mul(self, delta: &DeltaParameterVector) -> DeltaParameterVector {
        DeltaParameterVector {
            order: delta.order,
            frame: &delta.frame * self,
            point: &delta.point * self,
        }
    }
}
