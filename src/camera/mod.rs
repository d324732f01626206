//! Camera projection models and the fixed multi-camera rig.

use nalgebra::{Isometry3, Matrix2x3, Vector2, Vector3};

pub mod kannala_brandt;

pub use kannala_brandt::KannalaBrandt;

/// Trait for camera projection models.
///
/// All methods take points and rays in the camera coordinate frame
/// (right-handed, Z forward). Implementations must be `Send + Sync` so
/// residual evaluation can fan out across threads, and are monomorphized
/// into the adjuster rather than dispatched dynamically.
pub trait CameraModel: Send + Sync + Clone + std::fmt::Debug + 'static {
    /// Project a 3D point in camera frame to pixel coordinates.
    ///
    /// The direction must be mappable (see [`CameraModel::is_mappable`]);
    /// the projection of an unmappable direction is unspecified but finite.
    fn map(&self, v: &Vector3<f64>) -> Vector2<f64>;

    /// Back-project a pixel to the unit ray through it.
    fn unmap(&self, p: &Vector2<f64>) -> Vector3<f64>;

    /// Whether the direction lies inside the modeled field of view.
    fn is_mappable(&self, v: &Vector3<f64>) -> bool;

    /// Whether a pixel lies on the image, keeping `border` pixels of margin.
    fn is_on_image(&self, p: &Vector2<f64>, border: f64) -> bool;

    /// Projection together with its 2×3 Jacobian with respect to the point.
    fn diff_map(&self, v: &Vector3<f64>) -> (Vector2<f64>, Matrix2x3<f64>);
}

/// One camera of the rig: the projection model plus its mounting pose.
#[derive(Debug, Clone)]
pub struct BundleCamera<C: CameraModel> {
    pub cam: C,
    /// Camera frame to body frame
    pub this_to_body: Isometry3<f64>,
    /// Body frame to camera frame (cached inverse of `this_to_body`)
    pub body_to_this: Isometry3<f64>,
}

impl<C: CameraModel> BundleCamera<C> {
    pub fn new(cam: C, this_to_body: Isometry3<f64>) -> Self {
        let body_to_this = this_to_body.inverse();
        Self {
            cam,
            this_to_body,
            body_to_this,
        }
    }
}

/// Fixed rigid multi-camera rig.
#[derive(Debug, Clone)]
pub struct CameraBundle<C: CameraModel> {
    pub bundle: Vec<BundleCamera<C>>,
}

impl<C: CameraModel> CameraBundle<C> {
    pub fn new(bundle: Vec<BundleCamera<C>>) -> Self {
        Self { bundle }
    }

    /// A single body-centered camera (identity extrinsics).
    pub fn single(cam: C) -> Self {
        Self::new(vec![BundleCamera::new(cam, Isometry3::identity())])
    }

    pub fn size(&self) -> usize {
        self.bundle.len()
    }
}
