//! Canonical storage of the active optimization variables.
//!
//! [`Parameters`] mirrors the window's keyframes at construction, is mutated
//! in place during optimization, and writes back to the external keyframes on
//! [`Parameters::apply`]. Trial steps snapshot it through
//! [`Parameters::save_state`] / [`Parameters::recover_state`].
//!
//! Gauge handling lives in [`Parameters::update`]: the first keyframe is the
//! anchor and never moves, the second keyframe's translation is constrained
//! to the sphere around the anchor with its current baseline as radius (or
//! frozen below the minimum baseline), and depth/affine deltas saturate at
//! their bounds.

use crate::geometry::{project_to_sphere_tangent, quat_update};
use crate::keyframe::{AffineLight, KeyFrame, PointState};
use crate::optimize::delta::DeltaParameterVector;
use crate::settings::{AffineLightSettings, BundleAdjusterSettings, DepthSettings, Settings};
use nalgebra::{Isometry3, Vector3};

/// Stable index of an optimized point inside its host keyframe entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointRef {
    pub host_ind: usize,
    pub host_cam_ind: usize,
    pub point_ind: usize,
}

/// Snapshot of the parameter block for trial steps.
#[derive(Debug, Clone)]
pub struct State {
    body_to_world: Vec<Isometry3<f64>>,
    light_world_to_frame: Vec<AffineLight>,
    log_depths: Vec<f64>,
}

/// The active optimization variables of one adjustment problem.
#[derive(Debug, Clone)]
pub struct Parameters {
    body_to_world: Vec<Isometry3<f64>>,
    /// Indexed `frame * num_cameras + cam`
    light_world_to_frame: Vec<AffineLight>,
    log_depths: Vec<f64>,
    point_refs: Vec<PointRef>,
    num_cameras: usize,
    depth: DepthSettings,
    affine_light: AffineLightSettings,
    bundle_adjuster: BundleAdjusterSettings,
}

impl Parameters {
    /// Mirror the keyframes' poses and affine pairs. Points are attached
    /// later through [`Parameters::set_points`] once the residual sweep knows
    /// which of them are observed.
    pub fn new(num_cameras: usize, key_frames: &[KeyFrame], settings: &Settings) -> Self {
        let body_to_world = key_frames.iter().map(|kf| kf.body_to_world).collect();
        let mut light_world_to_frame = Vec::with_capacity(key_frames.len() * num_cameras);
        for kf in key_frames {
            for entry in &kf.frames {
                light_world_to_frame.push(entry.light_world_to_frame);
            }
        }
        Self {
            body_to_world,
            light_world_to_frame,
            log_depths: Vec::new(),
            point_refs: Vec::new(),
            num_cameras,
            depth: settings.depth,
            affine_light: settings.affine_light,
            bundle_adjuster: settings.bundle_adjuster,
        }
    }

    /// Attach the observed points; log-depths are clamped into bounds.
    pub fn set_points(&mut self, point_refs: Vec<PointRef>, log_depths: Vec<f64>) {
        debug_assert_eq!(point_refs.len(), log_depths.len());
        let (lo, hi) = self.log_depth_bounds();
        self.log_depths = log_depths.into_iter().map(|d| d.clamp(lo, hi)).collect();
        self.point_refs = point_refs;
    }

    fn log_depth_bounds(&self) -> (f64, f64) {
        (self.depth.min.ln(), self.depth.max.ln())
    }

    pub fn num_key_frames(&self) -> usize {
        self.body_to_world.len()
    }

    pub fn cam_bundle_size(&self) -> usize {
        self.num_cameras
    }

    pub fn num_points(&self) -> usize {
        self.log_depths.len()
    }

    pub fn body_to_world(&self, frame_ind: usize) -> &Isometry3<f64> {
        &self.body_to_world[frame_ind]
    }

    pub fn light_world_to_frame(&self, frame_ind: usize, cam_ind: usize) -> AffineLight {
        self.light_world_to_frame[frame_ind * self.num_cameras + cam_ind]
    }

    pub fn log_depth(&self, point_ind: usize) -> f64 {
        self.log_depths[point_ind]
    }

    pub fn point_refs(&self) -> &[PointRef] {
        &self.point_refs
    }

    /// Snapshot for a trial step.
    pub fn save_state(&self) -> State {
        State {
            body_to_world: self.body_to_world.clone(),
            light_world_to_frame: self.light_world_to_frame.clone(),
            log_depths: self.log_depths.clone(),
        }
    }

    /// Restore a snapshot after a rejected trial step.
    pub fn recover_state(&mut self, state: State) {
        self.body_to_world = state.body_to_world;
        self.light_world_to_frame = state.light_world_to_frame;
        self.log_depths = state.log_depths;
    }

    /// Apply a minimal tangent-space increment.
    ///
    /// Deltas of gauge-fixed parameters are masked to zero before
    /// application; the second keyframe's translation delta is projected
    /// onto the tangent plane of the scale sphere and the result is
    /// renormalized back onto it.
    pub fn update(&mut self, delta: &DeltaParameterVector) {
        let n = self.num_key_frames();
        for frame_ind in 1..n {
            let mut rot = delta.rot(frame_ind);
            let mut trans = delta.trans(frame_ind);

            if frame_ind == 1 {
                let freeze_motion =
                    self.bundle_adjuster.fixed_motion_on_first_adjustment && n == 2;
                if freeze_motion || self.bundle_adjuster.fixed_rotation_on_second_kf {
                    rot = Vector3::zeros();
                }
                if freeze_motion {
                    trans = Vector3::zeros();
                } else {
                    trans = self.second_frame_translation_delta(&trans);
                }
            }

            if rot != Vector3::zeros() {
                let pose = &mut self.body_to_world[frame_ind];
                pose.rotation = quat_update(&pose.rotation, &rot);
            }
            self.body_to_world[frame_ind].translation.vector += trans;

            if self.affine_light.optimize_affine_light {
                for cam_ind in 0..self.num_cameras {
                    let daff = delta.aff(frame_ind, cam_ind);
                    let light =
                        &mut self.light_world_to_frame[frame_ind * self.num_cameras + cam_ind];
                    light.a = (light.a + daff.x).clamp(
                        self.affine_light.min_affine_light_a,
                        self.affine_light.max_affine_light_a,
                    );
                    light.b = (light.b + daff.y).clamp(
                        self.affine_light.min_affine_light_b,
                        self.affine_light.max_affine_light_b,
                    );
                }
            }
        }

        let (lo, hi) = self.log_depth_bounds();
        for (point_ind, log_depth) in self.log_depths.iter_mut().enumerate() {
            let d = delta.point_delta(point_ind);
            if d != 0.0 {
                *log_depth = (*log_depth + d).clamp(lo, hi);
            }
        }
    }

    /// Effective translation delta of the second keyframe under the scale
    /// gauge: frozen below the minimum baseline, otherwise constrained to
    /// the sphere around the anchor.
    fn second_frame_translation_delta(&self, trans: &Vector3<f64>) -> Vector3<f64> {
        let anchor = self.body_to_world[0].translation.vector;
        let current = self.body_to_world[1].translation.vector;
        let offset = current - anchor;
        let radius = offset.norm();

        if radius <= self.bundle_adjuster.min_first_to_second_radius {
            return Vector3::zeros();
        }
        if *trans == Vector3::zeros() {
            return Vector3::zeros();
        }

        let normal = offset / radius;
        let moved = offset + project_to_sphere_tangent(trans, &normal);
        let norm = moved.norm();
        if norm <= f64::EPSILON {
            return Vector3::zeros();
        }
        anchor + radius * (moved / norm) - current
    }

    /// Write the refined parameters back into the external keyframes.
    pub fn apply(&self, key_frames: &mut [KeyFrame]) {
        for (frame_ind, kf) in key_frames.iter_mut().enumerate() {
            kf.body_to_world = self.body_to_world[frame_ind];
            for (cam_ind, entry) in kf.frames.iter_mut().enumerate() {
                entry.light_world_to_frame =
                    self.light_world_to_frame[frame_ind * self.num_cameras + cam_ind];
            }
        }
        for (point_ref, &log_depth) in self.point_refs.iter().zip(self.log_depths.iter()) {
            let point = &mut key_frames[point_ref.host_ind].frames[point_ref.host_cam_ind]
                .optimized_points[point_ref.point_ind];
            debug_assert_eq!(point.state, PointState::Active);
            point.log_depth = log_depth;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageGrid;
    use crate::keyframe::KeyFrameEntry;
    use crate::optimize::delta::FrameParameterOrder;
    use nalgebra::{DVector, Translation3, UnitQuaternion, Vector2};

    fn order() -> FrameParameterOrder {
        FrameParameterOrder::new(2, 1)
    }

    fn tiny_key_frame(translation: Vector3<f64>) -> KeyFrame {
        let image = ImageGrid::from_fn(8, 8, |r, c| (r + c) as f64);
        KeyFrame::new(
            Isometry3::from_parts(Translation3::from(translation), UnitQuaternion::identity()),
            vec![KeyFrameEntry::new(image, 1)],
        )
    }

    fn two_frame_parameters(settings: &Settings) -> Parameters {
        let key_frames = vec![
            tiny_key_frame(Vector3::zeros()),
            tiny_key_frame(Vector3::new(0.3, 0.0, 0.0)),
        ];
        let mut parameters = Parameters::new(1, &key_frames, settings);
        parameters.set_points(
            vec![PointRef {
                host_ind: 0,
                host_cam_ind: 0,
                point_ind: 0,
            }],
            vec![5.0f64.ln()],
        );
        parameters
    }

    #[test]
    fn test_save_recover_is_bit_exact() {
        let settings = Settings::default();
        let mut parameters = two_frame_parameters(&settings);
        let saved = parameters.save_state();
        let reference = parameters.clone();

        let order = order();
        let mut frame = DVector::zeros(order.total_frame_parameters());
        frame[order.rot_offset(1)] = 0.01;
        frame[order.trans_offset(1) + 1] = 0.02;
        frame[order.aff_offset(1, 0)] = 0.05;
        let delta =
            DeltaParameterVector::from_parts(order, frame, DVector::from_vec(vec![0.1]));
        parameters.update(&delta);

        parameters.recover_state(saved);
        for i in 0..2 {
            assert_eq!(
                parameters.body_to_world(i),
                reference.body_to_world(i),
                "pose {i} must restore bit-exactly"
            );
        }
        assert_eq!(
            parameters.light_world_to_frame(1, 0),
            reference.light_world_to_frame(1, 0)
        );
        assert_eq!(parameters.log_depth(0), reference.log_depth(0));
    }

    #[test]
    fn test_anchor_keyframe_never_moves() {
        let settings = Settings::default();
        let mut parameters = two_frame_parameters(&settings);
        let anchor_before = *parameters.body_to_world(0);
        let light_before = parameters.light_world_to_frame(0, 0);

        let order = order();
        let frame = DVector::from_element(order.total_frame_parameters(), 0.1);
        let delta =
            DeltaParameterVector::from_parts(order, frame, DVector::from_vec(vec![0.0]));
        parameters.update(&delta);

        assert_eq!(*parameters.body_to_world(0), anchor_before);
        assert_eq!(parameters.light_world_to_frame(0, 0), light_before);
        // The second keyframe did move.
        assert_ne!(
            parameters.body_to_world(1).rotation,
            UnitQuaternion::identity()
        );
    }

    #[test]
    fn test_second_frame_stays_on_sphere() {
        let settings = Settings::default();
        let mut parameters = two_frame_parameters(&settings);
        let radius_before = (parameters.body_to_world(1).translation.vector
            - parameters.body_to_world(0).translation.vector)
            .norm();

        let order = order();
        let mut frame = DVector::zeros(order.total_frame_parameters());
        frame[order.trans_offset(1)] = 0.05;
        frame[order.trans_offset(1) + 1] = -0.04;
        frame[order.trans_offset(1) + 2] = 0.03;
        let delta =
            DeltaParameterVector::from_parts(order, frame, DVector::from_vec(vec![0.0]));
        parameters.update(&delta);

        let radius_after = (parameters.body_to_world(1).translation.vector
            - parameters.body_to_world(0).translation.vector)
            .norm();
        assert!((radius_after - radius_before).abs() < 1e-12);
    }

    #[test]
    fn test_second_frame_translation_frozen_below_minimum_radius() {
        let mut settings = Settings::default();
        settings.bundle_adjuster.min_first_to_second_radius = 0.5;
        let mut parameters = two_frame_parameters(&settings);
        let translation_before = parameters.body_to_world(1).translation.vector;

        let order = order();
        let mut frame = DVector::zeros(order.total_frame_parameters());
        frame[order.trans_offset(1)] = 0.1;
        let delta =
            DeltaParameterVector::from_parts(order, frame, DVector::from_vec(vec![0.0]));
        parameters.update(&delta);

        assert_eq!(
            parameters.body_to_world(1).translation.vector,
            translation_before
        );
    }

    #[test]
    fn test_depth_and_affine_bounds_hold_under_update() {
        let mut settings = Settings::default();
        settings.depth.min = 1.0;
        settings.depth.max = 10.0;
        settings.affine_light.max_affine_light_a = 0.3;
        let mut parameters = two_frame_parameters(&settings);

        let order = order();
        let mut frame = DVector::zeros(order.total_frame_parameters());
        frame[order.aff_offset(1, 0)] = 5.0;
        let delta = DeltaParameterVector::from_parts(
            order,
            frame,
            DVector::from_vec(vec![100.0]),
        );
        parameters.update(&delta);

        assert!((parameters.light_world_to_frame(1, 0).a - 0.3).abs() < 1e-12);
        assert!(parameters.log_depth(0) <= 10.0f64.ln() + 1e-12);
    }

    #[test]
    fn test_both_second_frame_flags_freeze_entire_pose() {
        let mut settings = Settings::default();
        settings.bundle_adjuster.fixed_rotation_on_second_kf = true;
        settings.bundle_adjuster.fixed_motion_on_first_adjustment = true;
        let mut parameters = two_frame_parameters(&settings);
        let pose_before = *parameters.body_to_world(1);

        let order = order();
        let frame = DVector::from_element(order.total_frame_parameters(), 0.05);
        let delta =
            DeltaParameterVector::from_parts(order, frame, DVector::from_vec(vec![0.0]));
        parameters.update(&delta);

        assert_eq!(*parameters.body_to_world(1), pose_before);
    }

    #[test]
    fn test_apply_writes_back() {
        let settings = Settings::default();
        let mut key_frames = vec![
            tiny_key_frame(Vector3::zeros()),
            tiny_key_frame(Vector3::new(0.3, 0.0, 0.0)),
        ];
        key_frames[0].frames[0]
            .optimized_points
            .push(crate::keyframe::OptimizedPoint::new(
                Vector2::new(4.0, 4.0),
                Vector3::new(0.0, 0.0, 1.0),
                5.0,
            ));
        let mut parameters = Parameters::new(1, &key_frames, &settings);
        parameters.set_points(
            vec![PointRef {
                host_ind: 0,
                host_cam_ind: 0,
                point_ind: 0,
            }],
            vec![2.0f64.ln()],
        );
        parameters.apply(&mut key_frames);
        assert!((key_frames[0].frames[0].optimized_points[0].depth() - 2.0).abs() < 1e-12);
    }
}
