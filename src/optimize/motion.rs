//! Partials of the composed host-camera-to-target-camera transform.
//!
//! For a keyframe pair, the transform acting on a host-camera point `v` is
//!
//! ```text
//! T(v) = T_body→cam(target) · T_world→body(target) · T_body→world(host) · T_cam→body(host) · v
//! ```
//!
//! The constant parts (rotation compositions, translations) are precomputed
//! once per pair per iteration; the quaternion blocks depend on the point and
//! are produced on demand by contracting the stored frames with the
//! quaternion rotation partials. Downstream code stays
//! quaternion-parameterized while updates happen in so(3).

use crate::geometry::{drotate_dq, drotate_inv_dq};
use nalgebra::{Isometry3, Matrix3, Matrix3x4, UnitQuaternion, Vector3};

/// Derivatives of one host-camera→target-camera transform with respect to
/// the two body-to-world poses.
#[derive(Debug, Clone)]
pub struct MotionDerivatives {
    /// `R_body→cam(target) · R_world(target)ᵀ`, the map from world-frame
    /// displacements into the target camera
    world_to_target_cam: Matrix3<f64>,
    /// `∂T(v)/∂t_host`, constant over points
    pub daction_dt_host: Matrix3<f64>,
    /// `∂T(v)/∂t_target`, constant over points
    pub daction_dt_target: Matrix3<f64>,
    host_cam_to_body: Isometry3<f64>,
    host_body_to_world: Isometry3<f64>,
    target_rotation: UnitQuaternion<f64>,
    target_translation: Vector3<f64>,
    target_body_to_cam_rot: Matrix3<f64>,
}

impl MotionDerivatives {
    pub fn new(
        host_cam_to_body: &Isometry3<f64>,
        host_body_to_world: &Isometry3<f64>,
        target_body_to_world: &Isometry3<f64>,
        target_body_to_cam: &Isometry3<f64>,
    ) -> Self {
        let target_body_to_cam_rot = target_body_to_cam.rotation.to_rotation_matrix().into_inner();
        let target_world_to_body_rot = target_body_to_world
            .rotation
            .inverse()
            .to_rotation_matrix()
            .into_inner();
        let world_to_target_cam = target_body_to_cam_rot * target_world_to_body_rot;

        Self {
            world_to_target_cam,
            daction_dt_host: world_to_target_cam,
            daction_dt_target: -world_to_target_cam,
            host_cam_to_body: *host_cam_to_body,
            host_body_to_world: *host_body_to_world,
            target_rotation: target_body_to_world.rotation,
            target_translation: target_body_to_world.translation.vector,
            target_body_to_cam_rot,
        }
    }

    /// Host point lifted into the host body frame.
    #[inline]
    fn host_body_vec(&self, host_vec: &Vector3<f64>) -> Vector3<f64> {
        self.host_cam_to_body.rotation * host_vec + self.host_cam_to_body.translation.vector
    }

    /// `∂T(v)/∂q_host` as a 3×4 block over `(w, x, y, z)`.
    pub fn daction_dq_host(&self, host_vec: &Vector3<f64>) -> Matrix3x4<f64> {
        let body_vec = self.host_body_vec(host_vec);
        self.world_to_target_cam * drotate_dq(&self.host_body_to_world.rotation, &body_vec)
    }

    /// `∂T(v)/∂q_target` as a 3×4 block over `(w, x, y, z)`.
    pub fn daction_dq_target(&self, host_vec: &Vector3<f64>) -> Matrix3x4<f64> {
        let body_vec = self.host_body_vec(host_vec);
        let world_vec = self.host_body_to_world.rotation * body_vec
            + self.host_body_to_world.translation.vector;
        let rel = world_vec - self.target_translation;
        self.target_body_to_cam_rot * drotate_inv_dq(&self.target_rotation, &rel)
    }
}
