//! Kannala-Brandt fisheye camera model.
//!
//! The projection maps the angle `θ` between a ray and the optical axis
//! through an odd polynomial `θ_d = θ + k1 θ³ + k2 θ⁵ + k3 θ⁷ + k4 θ⁹`
//! and places the pixel at distance `f·θ_d` from the principal point along
//! the ray's image-plane direction. Unprojection inverts the polynomial by
//! Newton iteration.

use super::CameraModel;
use nalgebra::{Matrix2x3, Vector2, Vector3};

const UNMAP_NEWTON_ITERATIONS: usize = 8;

/// Kannala-Brandt fisheye camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KannalaBrandt {
    /// Focal lengths in pixels
    pub fx: f64,
    pub fy: f64,
    /// Principal point in pixels
    pub cx: f64,
    pub cy: f64,
    /// Distortion coefficients
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
    /// Image size in pixels
    pub width: f64,
    pub height: f64,
    /// Largest mappable angle from the optical axis, radians
    pub max_angle: f64,
}

impl KannalaBrandt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        distortion: [f64; 4],
        width: f64,
        height: f64,
        max_angle: f64,
    ) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: distortion[0],
            k2: distortion[1],
            k3: distortion[2],
            k4: distortion[3],
            width,
            height,
            max_angle,
        }
    }

    /// Distortion polynomial `θ_d(θ)`.
    #[inline]
    fn theta_d(&self, theta: f64) -> f64 {
        let theta2 = theta * theta;
        let theta3 = theta2 * theta;
        let theta5 = theta3 * theta2;
        let theta7 = theta5 * theta2;
        let theta9 = theta7 * theta2;
        theta + self.k1 * theta3 + self.k2 * theta5 + self.k3 * theta7 + self.k4 * theta9
    }

    /// Derivative `dθ_d/dθ = 1 + 3k1 θ² + 5k2 θ⁴ + 7k3 θ⁶ + 9k4 θ⁸`.
    #[inline]
    fn dtheta_d(&self, theta: f64) -> f64 {
        let theta2 = theta * theta;
        let mut d = 9.0 * self.k4 * theta2;
        d += 7.0 * self.k3;
        d *= theta2;
        d += 5.0 * self.k2;
        d *= theta2;
        d += 3.0 * self.k1;
        d *= theta2;
        d + 1.0
    }
}

impl CameraModel for KannalaBrandt {
    fn map(&self, v: &Vector3<f64>) -> Vector2<f64> {
        let (x, y, z) = (v.x, v.y, v.z);
        let r = (x * x + y * y).sqrt();
        let theta = r.atan2(z);
        let theta_d = self.theta_d(theta);

        let (x_r, y_r) = if r < f64::EPSILON {
            (0.0, 0.0)
        } else {
            (x / r, y / r)
        };

        Vector2::new(
            self.fx * theta_d * x_r + self.cx,
            self.fy * theta_d * y_r + self.cy,
        )
    }

    fn unmap(&self, p: &Vector2<f64>) -> Vector3<f64> {
        let mx = (p.x - self.cx) / self.fx;
        let my = (p.y - self.cy) / self.fy;
        let r_d = (mx * mx + my * my).sqrt();

        if r_d < f64::EPSILON {
            return Vector3::new(0.0, 0.0, 1.0);
        }

        // Invert θ_d(θ) = r_d by Newton iteration; θ = r_d is a good seed
        // for mild fisheye distortion.
        let mut theta = r_d.min(self.max_angle);
        for _ in 0..UNMAP_NEWTON_ITERATIONS {
            let f = self.theta_d(theta) - r_d;
            let df = self.dtheta_d(theta);
            if df.abs() < f64::EPSILON {
                break;
            }
            theta -= f / df;
        }

        let (sin_t, cos_t) = theta.sin_cos();
        Vector3::new(sin_t * mx / r_d, sin_t * my / r_d, cos_t)
    }

    fn is_mappable(&self, v: &Vector3<f64>) -> bool {
        let r = (v.x * v.x + v.y * v.y).sqrt();
        let norm = (r * r + v.z * v.z).sqrt();
        if norm < f64::EPSILON {
            return false;
        }
        r.atan2(v.z) < self.max_angle
    }

    fn is_on_image(&self, p: &Vector2<f64>, border: f64) -> bool {
        p.x >= border
            && p.x < self.width - border
            && p.y >= border
            && p.y < self.height - border
    }

    fn diff_map(&self, v: &Vector3<f64>) -> (Vector2<f64>, Matrix2x3<f64>) {
        let (x, y, z) = (v.x, v.y, v.z);
        let r2 = x * x + y * y;
        let r = r2.sqrt();

        if r < f64::EPSILON {
            // On the optical axis the model degenerates to a pinhole.
            let jac = Matrix2x3::new(
                self.fx / z,
                0.0,
                -self.fx * x / (z * z),
                0.0,
                self.fy / z,
                -self.fy * y / (z * z),
            );
            return (self.map(v), jac);
        }

        let theta = r.atan2(z);
        let theta_d = self.theta_d(theta);
        let dtheta_d = self.dtheta_d(theta);

        let dr_dx = x / r;
        let dr_dy = y / r;
        let norm2 = z * z + r2;
        let dtheta_dx = dr_dx * z / norm2;
        let dtheta_dy = dr_dy * z / norm2;
        let dtheta_dz = -r / norm2;

        let jac = Matrix2x3::new(
            self.fx * (theta_d * r + x * r * dtheta_d * dtheta_dx - x * x * theta_d / r) / r2,
            self.fx * x * (dtheta_d * dtheta_dy * r - y * theta_d / r) / r2,
            self.fx * x * dtheta_d * dtheta_dz / r,
            self.fy * y * (dtheta_d * dtheta_dx * r - x * theta_d / r) / r2,
            self.fy * (theta_d * r + y * r * dtheta_d * dtheta_dy - y * y * theta_d / r) / r2,
            self.fy * y * dtheta_d * dtheta_dz / r,
        );

        let projected = Vector2::new(
            self.fx * theta_d * x / r + self.cx,
            self.fy * theta_d * y / r + self.cy,
        );
        (projected, jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> KannalaBrandt {
        KannalaBrandt::new(
            460.0,
            460.0,
            320.0,
            240.0,
            [-0.01, 0.05, -0.08, 0.04],
            640.0,
            480.0,
            100.0_f64.to_radians(),
        )
    }

    #[test]
    fn test_projection_at_optical_axis() {
        let camera = test_camera();
        let uv = camera.map(&Vector3::new(0.0, 0.0, 1.0));
        assert!((uv.x - 320.0).abs() < 1e-10);
        assert!((uv.y - 240.0).abs() < 1e-10);
    }

    #[test]
    fn test_map_unmap_round_trip() {
        let camera = test_camera();
        for &(x, y, z) in &[
            (0.1, 0.2, 1.0),
            (-0.4, 0.3, 0.9),
            (0.8, -0.6, 1.3),
            (0.05, -0.02, 2.0),
        ] {
            let dir = Vector3::new(x, y, z).normalize();
            assert!(camera.is_mappable(&dir));
            let uv = camera.map(&dir);
            let ray = camera.unmap(&uv);
            assert!((ray.norm() - 1.0).abs() < 1e-9);
            assert!((ray - dir).norm() < 1e-7, "round trip for ({x}, {y}, {z})");
        }
    }

    #[test]
    fn test_diff_map_matches_map() {
        let camera = test_camera();
        let v = Vector3::new(0.2, -0.1, 1.1);
        let (projected, _) = camera.diff_map(&v);
        assert!((projected - camera.map(&v)).norm() < 1e-12);
    }

    #[test]
    fn test_diff_map_matches_finite_differences() {
        let camera = test_camera();
        let v = Vector3::new(0.1, 0.2, 1.0);
        let (_, jac) = camera.diff_map(&v);
        let eps = 1e-7;

        for i in 0..3 {
            let mut plus = v;
            let mut minus = v;
            plus[i] += eps;
            minus[i] -= eps;
            let num = (camera.map(&plus) - camera.map(&minus)) / (2.0 * eps);
            for r in 0..2 {
                assert!(
                    (jac[(r, i)] - num[r]).abs() < 1e-5,
                    "mismatch at ({r}, {i}): {} vs {}",
                    jac[(r, i)],
                    num[r]
                );
            }
        }
    }

    #[test]
    fn test_mappability_respects_field_of_view() {
        let camera = test_camera();
        assert!(camera.is_mappable(&Vector3::new(0.0, 0.0, 1.0)));
        // Straight backwards is well outside a 100 degree half-angle.
        assert!(!camera.is_mappable(&Vector3::new(0.0, 0.0, -1.0)));
        assert!(!camera.is_mappable(&Vector3::zeros()));
    }

    #[test]
    fn test_on_image_border() {
        let camera = test_camera();
        assert!(camera.is_on_image(&Vector2::new(320.0, 240.0), 4.0));
        assert!(!camera.is_on_image(&Vector2::new(2.0, 240.0), 4.0));
        assert!(!camera.is_on_image(&Vector2::new(320.0, 478.0), 4.0));
    }
}
