//! Tangent maps from the minimal update into the overparametrized storage.
//!
//! Residual Jacobians are taken with respect to the storage coordinates
//! (quaternion + translation per pose, affine pair, scalar log-depth).
//! Contracting them with these per-keyframe maps produces the minimal-system
//! blocks; translation, affine, and log-depth storage already coincide with
//! their tangent spaces, so only the quaternion needs a nontrivial map.

use crate::geometry::quat_exp_tangent;
use crate::optimize::parameters::Parameters;
use crate::optimize::Mat76;
use nalgebra::Matrix4x3;

/// Per-keyframe tangent maps at the current parameter point.
#[derive(Debug, Clone)]
pub struct ParametrizationJacobians {
    /// `∂(q ⊗ exp(ξ/2))/∂ξ` at ξ = 0, one per keyframe
    d_quat_d_tangent: Vec<Matrix4x3<f64>>,
}

impl ParametrizationJacobians {
    pub fn new(parameters: &Parameters) -> Self {
        let d_quat_d_tangent = (0..parameters.num_key_frames())
            .map(|i| quat_exp_tangent(&parameters.body_to_world(i).rotation))
            .collect();
        Self { d_quat_d_tangent }
    }

    /// The 4×3 quaternion tangent map of a keyframe.
    pub fn quat(&self, frame_ind: usize) -> &Matrix4x3<f64> {
        &self.d_quat_d_tangent[frame_ind]
    }

    /// The full 7×6 pose map `[∂q/∂ξ 0; 0 I₃]` of a keyframe.
    pub fn pose_block(&self, frame_ind: usize) -> Mat76 {
        let mut block = Mat76::zeros();
        block
            .fixed_view_mut::<4, 3>(0, 0)
            .copy_from(&self.d_quat_d_tangent[frame_ind]);
        block
            .fixed_view_mut::<3, 3>(4, 3)
            .copy_from(&nalgebra::Matrix3::identity());
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageGrid;
    use crate::keyframe::{KeyFrame, KeyFrameEntry};
    use crate::settings::Settings;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

    #[test]
    fn test_pose_block_layout() {
        let key_frames: Vec<KeyFrame> = (0..2)
            .map(|i| {
                let image = ImageGrid::from_fn(8, 8, |r, c| (r * c) as f64);
                KeyFrame::new(
                    Isometry3::from_parts(
                        Translation3::new(i as f64, 0.0, 0.0),
                        UnitQuaternion::from_scaled_axis(Vector3::new(0.1 * i as f64, 0.0, 0.2)),
                    ),
                    vec![KeyFrameEntry::new(image, 1)],
                )
            })
            .collect();
        let parameters = Parameters::new(1, &key_frames, &Settings::default());
        let jacobians = ParametrizationJacobians::new(&parameters);

        let block = jacobians.pose_block(1);
        // Quaternion part matches the standalone tangent map.
        let quat = jacobians.quat(1);
        for r in 0..4 {
            for c in 0..3 {
                assert_eq!(block[(r, c)], quat[(r, c)]);
            }
        }
        // Translation part is the identity.
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert_eq!(block[(4 + r, 3 + c)], expected);
            }
        }
        // Off-diagonal coupling is zero.
        assert_eq!(block[(0, 3)], 0.0);
        assert_eq!(block[(4, 0)], 0.0);
    }
}
