//! Keyframes, per-camera entries, and their sparse point sets.
//!
//! A [`KeyFrame`] is the logical unit of the sliding window: one body-to-world
//! pose plus one [`KeyFrameEntry`] per rig camera. Entries carry the image
//! pyramid, the affine brightness pair mapping world-canonical intensity into
//! the entry, and the point sets. Only optimized points in the ACTIVE state
//! participate in bundle adjustment.

use crate::image::{ImageGrid, ImagePyramid};
use nalgebra::{Isometry3, Vector2, Vector3};
use std::ops::Mul;

/// Affine brightness transform `I ↦ exp(a) · I + b`.
///
/// Models per-frame exposure and bias drift. Stored per keyframe entry as the
/// map from world-canonical intensity to the entry's intensity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineLight {
    pub a: f64,
    pub b: f64,
}

impl AffineLight {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    pub fn identity() -> Self {
        Self { a: 0.0, b: 0.0 }
    }

    /// `exp(a)`, the multiplicative gain.
    #[inline]
    pub fn ea(&self) -> f64 {
        self.a.exp()
    }

    /// Apply the transform to an intensity.
    #[inline]
    pub fn apply(&self, intensity: f64) -> f64 {
        self.ea() * intensity + self.b
    }

    /// The transform mapping this entry's intensity back to canonical.
    pub fn inverse(&self) -> AffineLight {
        // (I - b) / exp(a) = exp(-a) I - b exp(-a)
        AffineLight {
            a: -self.a,
            b: -self.b * (-self.a).exp(),
        }
    }
}

impl Mul for AffineLight {
    type Output = AffineLight;

    /// Composition: `(self ∘ rhs)(I) = self(rhs(I))`.
    fn mul(self, rhs: AffineLight) -> AffineLight {
        AffineLight {
            a: self.a + rhs.a,
            b: self.ea() * rhs.b + self.b,
        }
    }
}

/// Lifecycle state of an optimized point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    /// Participates in bundle adjustment
    Active,
    /// Photometrically inconsistent, excluded
    Outlier,
    /// Left the visible image region, excluded
    Oob,
}

/// A point whose inverse depth has converged enough to be optimized.
#[derive(Debug, Clone)]
pub struct OptimizedPoint {
    /// Pixel location in the host entry (fixed during optimization)
    pub p: Vector2<f64>,
    /// Unit ray through `p` in host-camera coordinates (fixed)
    pub dir: Vector3<f64>,
    /// Depth along `dir` is `exp(log_depth)`
    pub log_depth: f64,
    pub state: PointState,
}

impl OptimizedPoint {
    pub fn new(p: Vector2<f64>, dir: Vector3<f64>, depth: f64) -> Self {
        Self {
            p,
            dir,
            log_depth: depth.ln(),
            state: PointState::Active,
        }
    }

    #[inline]
    pub fn depth(&self) -> f64 {
        self.log_depth.exp()
    }
}

/// A candidate point still being tracked along its epipolar curve.
#[derive(Debug, Clone)]
pub struct ImmaturePoint {
    pub p: Vector2<f64>,
    pub dir: Vector3<f64>,
    /// Current depth estimate, midpoint of the search interval
    pub depth: f64,
    /// Search interval from stereo matching
    pub min_depth: f64,
    pub max_depth: f64,
}

/// Either kind of tracked point; reprojection treats them identically.
#[derive(Debug, Clone)]
pub enum TrackedPoint<'a> {
    Immature(&'a ImmaturePoint),
    Optimized(&'a OptimizedPoint),
}

impl TrackedPoint<'_> {
    pub fn p(&self) -> Vector2<f64> {
        match self {
            TrackedPoint::Immature(point) => point.p,
            TrackedPoint::Optimized(point) => point.p,
        }
    }

    pub fn dir(&self) -> Vector3<f64> {
        match self {
            TrackedPoint::Immature(point) => point.dir,
            TrackedPoint::Optimized(point) => point.dir,
        }
    }

    pub fn depth(&self) -> f64 {
        match self {
            TrackedPoint::Immature(point) => point.depth,
            TrackedPoint::Optimized(point) => point.depth(),
        }
    }
}

/// One camera's view within a keyframe.
#[derive(Debug, Clone)]
pub struct KeyFrameEntry {
    pub pyramid: ImagePyramid,
    /// World-canonical intensity to this entry's intensity
    pub light_world_to_frame: AffineLight,
    pub immature_points: Vec<ImmaturePoint>,
    pub optimized_points: Vec<OptimizedPoint>,
}

impl KeyFrameEntry {
    pub fn new(image: ImageGrid, num_pyramid_levels: usize) -> Self {
        Self {
            pyramid: ImagePyramid::new(image, num_pyramid_levels),
            light_world_to_frame: AffineLight::identity(),
            immature_points: Vec::new(),
            optimized_points: Vec::new(),
        }
    }

    /// The finest pyramid level, the only one the adjuster samples.
    #[inline]
    pub fn image(&self) -> &ImageGrid {
        self.pyramid.level(0)
    }
}

/// Logical unit of the sliding window.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub body_to_world: Isometry3<f64>,
    /// One entry per bundle camera, same order as the rig
    pub frames: Vec<KeyFrameEntry>,
}

impl KeyFrame {
    pub fn new(body_to_world: Isometry3<f64>, frames: Vec<KeyFrameEntry>) -> Self {
        Self {
            body_to_world,
            frames,
        }
    }
}
