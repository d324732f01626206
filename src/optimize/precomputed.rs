//! Per-iteration tables keyed by (host frame, host camera, target frame,
//! target camera).
//!
//! These would otherwise be recomputed inside every residual evaluation and
//! dominate runtime. All three own their data (no borrows into the parameter
//! block), so they can outlive a trial update and be swapped wholesale when a
//! step is accepted. Keys with equal host and target frame are never read.

use crate::camera::{CameraBundle, CameraModel};
use crate::keyframe::AffineLight;
use crate::optimize::motion::MotionDerivatives;
use crate::optimize::parameters::Parameters;
use nalgebra::Isometry3;

#[inline]
fn table_index(
    num_key_frames: usize,
    num_cameras: usize,
    host_ind: usize,
    host_cam_ind: usize,
    target_ind: usize,
    target_cam_ind: usize,
) -> usize {
    ((host_ind * num_cameras + host_cam_ind) * num_key_frames + target_ind) * num_cameras
        + target_cam_ind
}

/// Eagerly filled table of host-camera→target-camera rigid transforms.
#[derive(Debug, Clone)]
pub struct PrecomputedHostToTarget {
    num_key_frames: usize,
    num_cameras: usize,
    table: Vec<Isometry3<f64>>,
}

impl PrecomputedHostToTarget {
    pub fn new<C: CameraModel>(cam: &CameraBundle<C>, parameters: &Parameters) -> Self {
        let num_key_frames = parameters.num_key_frames();
        let num_cameras = cam.size();
        let mut table =
            vec![Isometry3::identity(); num_key_frames * num_cameras * num_key_frames * num_cameras];

        for host_ind in 0..num_key_frames {
            for target_ind in 0..num_key_frames {
                if host_ind == target_ind {
                    continue;
                }
                let host_body_to_target_body = parameters.body_to_world(target_ind).inverse()
                    * parameters.body_to_world(host_ind);
                for host_cam_ind in 0..num_cameras {
                    let host_cam_to_target_body =
                        host_body_to_target_body * cam.bundle[host_cam_ind].this_to_body;
                    for target_cam_ind in 0..num_cameras {
                        let index = table_index(
                            num_key_frames,
                            num_cameras,
                            host_ind,
                            host_cam_ind,
                            target_ind,
                            target_cam_ind,
                        );
                        table[index] =
                            cam.bundle[target_cam_ind].body_to_this * host_cam_to_target_body;
                    }
                }
            }
        }

        Self {
            num_key_frames,
            num_cameras,
            table,
        }
    }

    pub fn get(
        &self,
        host_ind: usize,
        host_cam_ind: usize,
        target_ind: usize,
        target_cam_ind: usize,
    ) -> &Isometry3<f64> {
        &self.table[table_index(
            self.num_key_frames,
            self.num_cameras,
            host_ind,
            host_cam_ind,
            target_ind,
            target_cam_ind,
        )]
    }
}

/// Eagerly filled table of host→target affine light compositions.
#[derive(Debug, Clone)]
pub struct PrecomputedLightHostToTarget {
    num_key_frames: usize,
    num_cameras: usize,
    table: Vec<AffineLight>,
}

impl PrecomputedLightHostToTarget {
    pub fn new(parameters: &Parameters) -> Self {
        let num_key_frames = parameters.num_key_frames();
        let num_cameras = parameters.cam_bundle_size();
        let size = num_key_frames * num_cameras * num_key_frames * num_cameras;
        let mut table = vec![AffineLight::identity(); size];

        for host_ind in 0..num_key_frames {
            for host_cam_ind in 0..num_cameras {
                let host_inverse = parameters
                    .light_world_to_frame(host_ind, host_cam_ind)
                    .inverse();
                for target_ind in 0..num_key_frames {
                    if host_ind == target_ind {
                        continue;
                    }
                    for target_cam_ind in 0..num_cameras {
                        let index = table_index(
                            num_key_frames,
                            num_cameras,
                            host_ind,
                            host_cam_ind,
                            target_ind,
                            target_cam_ind,
                        );
                        table[index] = parameters
                            .light_world_to_frame(target_ind, target_cam_ind)
                            * host_inverse;
                    }
                }
            }
        }

        Self {
            num_key_frames,
            num_cameras,
            table,
        }
    }

    pub fn get(
        &self,
        host_ind: usize,
        host_cam_ind: usize,
        target_ind: usize,
        target_cam_ind: usize,
    ) -> AffineLight {
        self.table[table_index(
            self.num_key_frames,
            self.num_cameras,
            host_ind,
            host_cam_ind,
            target_ind,
            target_cam_ind,
        )]
    }
}

/// Lazily filled table of motion derivatives.
///
/// Filling is driven by [`PrecomputedMotionDerivatives::ensure`]; the
/// Derivatives snapshot pre-warms every pair its residuals touch before
/// fanning out, after which [`PrecomputedMotionDerivatives::get`] is a plain
/// shared read.
#[derive(Debug, Clone)]
pub struct PrecomputedMotionDerivatives {
    num_key_frames: usize,
    num_cameras: usize,
    cam_to_body: Vec<Isometry3<f64>>,
    body_to_cam: Vec<Isometry3<f64>>,
    body_to_world: Vec<Isometry3<f64>>,
    table: Vec<Option<MotionDerivatives>>,
}

impl PrecomputedMotionDerivatives {
    pub fn new<C: CameraModel>(cam: &CameraBundle<C>, parameters: &Parameters) -> Self {
        let num_key_frames = parameters.num_key_frames();
        let num_cameras = cam.size();
        Self {
            num_key_frames,
            num_cameras,
            cam_to_body: cam.bundle.iter().map(|c| c.this_to_body).collect(),
            body_to_cam: cam.bundle.iter().map(|c| c.body_to_this).collect(),
            body_to_world: (0..num_key_frames)
                .map(|i| *parameters.body_to_world(i))
                .collect(),
            table: vec![None; num_key_frames * num_cameras * num_key_frames * num_cameras],
        }
    }

    /// Fill the entry for a pair if it is still empty.
    pub fn ensure(
        &mut self,
        host_ind: usize,
        host_cam_ind: usize,
        target_ind: usize,
        target_cam_ind: usize,
    ) {
        let index = table_index(
            self.num_key_frames,
            self.num_cameras,
            host_ind,
            host_cam_ind,
            target_ind,
            target_cam_ind,
        );
        if self.table[index].is_none() {
            self.table[index] = Some(MotionDerivatives::new(
                &self.cam_to_body[host_cam_ind],
                &self.body_to_world[host_ind],
                &self.body_to_world[target_ind],
                &self.body_to_cam[target_cam_ind],
            ));
        }
    }

    /// Read a previously ensured entry.
    pub fn get(
        &self,
        host_ind: usize,
        host_cam_ind: usize,
        target_ind: usize,
        target_cam_ind: usize,
    ) -> &MotionDerivatives {
        self.table[table_index(
            self.num_key_frames,
            self.num_cameras,
            host_ind,
            host_cam_ind,
            target_ind,
            target_cam_ind,
        )]
        .as_ref()
        .expect("motion derivatives queried before ensure()")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::KannalaBrandt;
    use crate::image::ImageGrid;
    use crate::keyframe::{KeyFrame, KeyFrameEntry};
    use crate::settings::Settings;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn test_setup() -> (CameraBundle<KannalaBrandt>, Parameters) {
        let camera = KannalaBrandt::new(
            300.0,
            300.0,
            160.0,
            120.0,
            [0.0; 4],
            320.0,
            240.0,
            100.0_f64.to_radians(),
        );
        let cam = CameraBundle::single(camera);
        let key_frames: Vec<KeyFrame> = (0..3)
            .map(|i| {
                let image = ImageGrid::from_fn(8, 8, |r, c| (r + c) as f64);
                KeyFrame::new(
                    Isometry3::from_parts(
                        Translation3::new(0.2 * i as f64, 0.0, 0.0),
                        UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.05 * i as f64, 0.0)),
                    ),
                    vec![KeyFrameEntry::new(image, 1)],
                )
            })
            .collect();
        let parameters = Parameters::new(1, &key_frames, &Settings::default());
        (cam, parameters)
    }

    #[test]
    fn test_host_to_target_composition() {
        let (cam, parameters) = test_setup();
        let table = PrecomputedHostToTarget::new(&cam, &parameters);
        let expected =
            parameters.body_to_world(2).inverse() * parameters.body_to_world(1);
        let got = table.get(1, 0, 2, 0);
        assert!((got.translation.vector - expected.translation.vector).norm() < 1e-12);
        assert!(got.rotation.angle_to(&expected.rotation) < 1e-12);
    }

    #[test]
    fn test_light_composition_identity_for_identity_lights() {
        let (_, parameters) = test_setup();
        let table = PrecomputedLightHostToTarget::new(&parameters);
        let light = table.get(0, 0, 1, 0);
        assert_eq!(light, AffineLight::identity());
    }

    #[test]
    fn test_motion_derivatives_lazy_fill() {
        let (cam, parameters) = test_setup();
        let mut table = PrecomputedMotionDerivatives::new(&cam, &parameters);
        table.ensure(0, 0, 1, 0);
        // Same pair twice stays a single fill.
        table.ensure(0, 0, 1, 0);
        let derivs = table.get(0, 0, 1, 0);
        assert!(derivs.daction_dt_host.norm() > 0.0);
    }

    #[test]
    #[should_panic(expected = "motion derivatives queried before ensure")]
    fn test_motion_derivatives_unfilled_access_panics() {
        let (cam, parameters) = test_setup();
        let table = PrecomputedMotionDerivatives::new(&cam, &parameters);
        let _ = table.get(0, 0, 2, 0);
    }
}
