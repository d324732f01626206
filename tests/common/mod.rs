//! Synthetic two-frame fisheye scene for the end-to-end suites.
//!
//! A textured plane at constant world depth is rendered into both keyframes
//! through the fisheye model, so the photometric energy has a known global
//! optimum at the ground-truth poses, depths, and affine parameters.

#![allow(dead_code)]

use direct_ba::camera::{CameraBundle, CameraModel, KannalaBrandt};
use direct_ba::image::ImageGrid;
use direct_ba::keyframe::{AffineLight, KeyFrame, KeyFrameEntry, OptimizedPoint};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const IMAGE_SIZE: usize = 640;
pub const PLANE_Z: f64 = 5.0;

/// Smooth low-frequency world texture; bicubic interpolation reproduces it
/// almost exactly at pixel scale.
pub fn texture(x: f64, y: f64) -> f64 {
    128.0 + 35.0 * (0.9 * x + 0.5).sin() + 30.0 * (1.1 * y - 0.3).cos() + 20.0 * (0.7 * (x + y)).sin()
}

pub fn scene_camera() -> KannalaBrandt {
    KannalaBrandt::new(
        400.0,
        400.0,
        320.0,
        320.0,
        [0.0, 0.0, 0.0, 0.0],
        IMAGE_SIZE as f64,
        IMAGE_SIZE as f64,
        1.6,
    )
}

/// Ground-truth pose of the second keyframe.
pub fn true_second_pose() -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(0.15, 0.08, 0.05),
        UnitQuaternion::from_scaled_axis(Vector3::new(0.015, -0.02, 0.01)),
    )
}

/// Host pixels of the twelve scene points.
pub fn point_pixels() -> Vec<Vector2<f64>> {
    let mut pixels = Vec::new();
    for &x in &[220.0, 290.0, 360.0, 430.0] {
        for &y in &[230.0, 320.0, 410.0] {
            pixels.push(Vector2::new(x, y));
        }
    }
    pixels
}

/// Render the plane into a camera at the given body-to-world pose, with an
/// affine brightness transform and optional Gaussian noise applied on top.
pub fn render_image(
    cam: &KannalaBrandt,
    body_to_world: &Isometry3<f64>,
    light: AffineLight,
    noise: Option<(u64, f64)>,
) -> ImageGrid {
    let mut rng_sigma = noise.map(|(seed, sigma)| (StdRng::seed_from_u64(seed), sigma));
    ImageGrid::from_fn(IMAGE_SIZE, IMAGE_SIZE, |row, col| {
        let pixel = Vector2::new(col as f64, row as f64);
        let ray_cam = cam.unmap(&pixel);
        let ray_world = body_to_world.rotation * ray_cam;
        let origin = body_to_world.translation.vector;
        let t = (PLANE_Z - origin.z) / ray_world.z;
        let hit = origin + t * ray_world;
        let mut intensity = light.apply(texture(hit.x, hit.y));
        if let Some((rng, sigma)) = rng_sigma.as_mut() {
            // Box-Muller
            let u1: f64 = rng.gen_range(1e-12..1.0);
            let u2: f64 = rng.gen_range(0.0..1.0);
            let gaussian = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            intensity += *sigma * gaussian;
        }
        intensity
    })
}

#[derive(Clone)]
pub struct SceneConfig {
    /// True affine transform of the second keyframe's image
    pub target_light: AffineLight,
    /// Gaussian noise on the second keyframe's image, gray levels
    pub noise_sigma: f64,
    pub noise_seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            target_light: AffineLight::identity(),
            noise_sigma: 0.0,
            noise_seed: 7,
        }
    }
}

pub struct Scene {
    pub bundle: CameraBundle<KannalaBrandt>,
    pub key_frames: Vec<KeyFrame>,
    pub true_second_pose: Isometry3<f64>,
    pub true_depths: Vec<f64>,
}

/// Build the two-frame scene at ground truth: keyframe 0 at the origin
/// hosting all twelve points at their true depths, keyframe 1 at
/// [`true_second_pose`]. Tests perturb from here.
pub fn build_scene(config: &SceneConfig) -> Scene {
    let cam = scene_camera();
    let bundle = CameraBundle::single(cam);
    let first_pose = Isometry3::identity();
    let second_pose = true_second_pose();

    let host_image = render_image(&cam, &first_pose, AffineLight::identity(), None);
    let noise = (config.noise_sigma > 0.0).then_some((config.noise_seed, config.noise_sigma));
    let target_image = render_image(&cam, &second_pose, config.target_light, noise);

    let mut host_entry = KeyFrameEntry::new(host_image, 1);
    let mut true_depths = Vec::new();
    for pixel in point_pixels() {
        let dir = cam.unmap(&pixel);
        let depth = PLANE_Z / dir.z;
        true_depths.push(depth);
        host_entry
            .optimized_points
            .push(OptimizedPoint::new(pixel, dir, depth));
    }

    let key_frames = vec![
        KeyFrame::new(first_pose, vec![host_entry]),
        KeyFrame::new(second_pose, vec![KeyFrameEntry::new(target_image, 1)]),
    ];

    Scene {
        bundle,
        key_frames,
        true_second_pose: second_pose,
        true_depths,
    }
}

/// Rotate a pose's translation about an anchor point, leaving the distance
/// to the anchor unchanged.
pub fn rotate_translation_about(
    pose: &Isometry3<f64>,
    anchor: &Vector3<f64>,
    axis_angle: Vector3<f64>,
) -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_scaled_axis(axis_angle);
    let mut perturbed = *pose;
    perturbed.translation.vector = anchor + rotation * (pose.translation.vector - anchor);
    perturbed
}

/// Right-multiply a pose's rotation by a small so(3) perturbation.
pub fn perturb_rotation(pose: &Isometry3<f64>, axis_angle: Vector3<f64>) -> Isometry3<f64> {
    let mut perturbed = *pose;
    perturbed.rotation = pose.rotation * UnitQuaternion::from_scaled_axis(axis_angle);
    perturbed
}

pub fn rotation_error(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    a.rotation.angle_to(&b.rotation)
}

pub fn translation_error(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    (a.translation.vector - b.translation.vector).norm()
}
