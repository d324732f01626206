//! Quaternion and SO(3) calculus for the analytic Jacobians.
//!
//! Poses are stored as unit quaternions plus translations, while updates live
//! in the so(3) tangent space. The residual Jacobians are first taken with
//! respect to the four quaternion coefficients (the smooth homogeneous
//! extension of the rotation action) and later contracted with the tangent
//! map of `q ↦ q ⊗ exp(ξ/2)`, so both sides of that contraction live here.
//!
//! Quaternion coefficient order throughout this crate is `(w, x, y, z)`.

use nalgebra::{Matrix3, Matrix3x4, Matrix4x3, UnitQuaternion, Vector3};

/// Compute the skew-symmetric matrix of a 3D vector.
///
/// For `v = [x, y, z]`, returns the matrix of the cross product `[v]× w = v × w`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Derivative of the rotation action `R(q) v` with respect to the quaternion
/// coefficients `(w, x, y, z)`.
///
/// Uses the homogeneous extension `R(q) v = (w² - uᵀu) v + 2 (uᵀv) u + 2 w (u × v)`
/// which agrees with the unit-sphere rotation along tangent directions, so the
/// contraction with [`quat_exp_tangent`] yields the exact so(3) derivative.
pub fn drotate_dq(q: &UnitQuaternion<f64>, v: &Vector3<f64>) -> Matrix3x4<f64> {
    let w = q.scalar();
    let u = q.imag();

    let mut jac = Matrix3x4::zeros();
    // d/dw = 2 w v + 2 (u × v)
    jac.set_column(0, &(v * (2.0 * w) + u.cross(v) * 2.0));
    // d/du = -2 v uᵀ + 2 (uᵀv) I + 2 u vᵀ - 2 w [v]×
    let du = v * u.transpose() * -2.0
        + Matrix3::identity() * (2.0 * u.dot(v))
        + u * v.transpose() * 2.0
        - skew(v) * (2.0 * w);
    jac.fixed_view_mut::<3, 3>(0, 1).copy_from(&du);
    jac
}

/// Derivative of the inverse rotation action `R(q)ᵀ v` with respect to the
/// quaternion coefficients `(w, x, y, z)`.
pub fn drotate_inv_dq(q: &UnitQuaternion<f64>, v: &Vector3<f64>) -> Matrix3x4<f64> {
    let w = q.scalar();
    let u = q.imag();

    let mut jac = Matrix3x4::zeros();
    // Chain rule through conjugation: R(q)ᵀ = R(q̄) with q̄ = (w, -u).
    jac.set_column(0, &(v * (2.0 * w) - u.cross(v) * 2.0));
    let du = v * u.transpose() * -2.0
        + Matrix3::identity() * (2.0 * u.dot(v))
        + u * v.transpose() * 2.0
        + skew(v) * (2.0 * w);
    jac.fixed_view_mut::<3, 3>(0, 1).copy_from(&du);
    jac
}

/// Tangent map of the right-multiplicative update `q ↦ q ⊗ exp(ξ/2)` at ξ = 0,
/// as a 4×3 matrix over quaternion coefficients `(w, x, y, z)`.
///
/// Column i is `½ q ⊗ (0, eᵢ)`.
pub fn quat_exp_tangent(q: &UnitQuaternion<f64>) -> Matrix4x3<f64> {
    let w = q.scalar();
    let u = q.imag();
    let (x, y, z) = (u.x, u.y, u.z);

    0.5 * Matrix4x3::new(
        -x, -y, -z, //
        w, -z, y, //
        z, w, -x, //
        -y, x, w,
    )
}

/// Apply the right-multiplicative so(3) update `q ← normalize(q ⊗ exp(ξ/2))`.
pub fn quat_update(q: &UnitQuaternion<f64>, xi: &Vector3<f64>) -> UnitQuaternion<f64> {
    // from_scaled_axis is exp(ξ/2) in quaternion form; renormalize to keep
    // the storage on the unit sphere under accumulated rounding.
    let mut updated = (q * UnitQuaternion::from_scaled_axis(*xi)).into_inner();
    updated.normalize_mut();
    UnitQuaternion::from_quaternion(updated)
}

/// Project a delta onto the tangent plane of a sphere at the point with unit
/// outward normal `normal`.
#[inline]
pub fn project_to_sphere_tangent(delta: &Vector3<f64>, normal: &Vector3<f64>) -> Vector3<f64> {
    delta - normal * normal.dot(delta)
}
