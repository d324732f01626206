//! Analytic residual Jacobians against symmetric finite differences, per
//! parameter group, at generic points away from projection boundaries.

mod common;

use common::{build_scene, SceneConfig};
use direct_ba::camera::{CameraBundle, KannalaBrandt};
use direct_ba::geometry::quat_exp_tangent;
use direct_ba::keyframe::{AffineLight, KeyFrame};
use direct_ba::optimize::{
    MotionDerivatives, Parameters, PrecomputedHostToTarget, Residual,
};
use direct_ba::settings::Settings;
use nalgebra::{DVector, Isometry3, UnitQuaternion, Vector3};

const FD_EPS: f64 = 1e-6;
const REL_TOL: f64 = 1e-4;

struct Fixture {
    bundle: CameraBundle<KannalaBrandt>,
    key_frames: Vec<KeyFrame>,
    residuals: Vec<Residual>,
    log_depths: Vec<f64>,
    host_light: AffineLight,
    target_light: AffineLight,
    settings: Settings,
}

impl Fixture {
    fn new() -> Self {
        let scene = build_scene(&SceneConfig::default());
        let settings = Settings::default();
        // Evaluate at parameters slightly off ground truth so the residuals
        // and all coupling terms are nonzero.
        let mut key_frames = scene.key_frames;
        key_frames[1].body_to_world = common::perturb_rotation(
            &key_frames[1].body_to_world,
            Vector3::new(0.004, -0.003, 0.002),
        );
        let host_light = AffineLight::identity();
        let target_light = AffineLight::new(0.05, 2.0);
        key_frames[1].frames[0].light_world_to_frame = target_light;

        let parameters = Parameters::new(1, &key_frames, &settings);
        let host_to_target = PrecomputedHostToTarget::new(&scene.bundle, &parameters);

        let mut residuals = Vec::new();
        let mut log_depths = Vec::new();
        for (local_ind, point) in key_frames[0].frames[0].optimized_points.iter().enumerate() {
            residuals.push(Residual::new(
                0,
                0,
                1,
                0,
                local_ind,
                &scene.bundle.bundle[0].cam,
                &scene.bundle.bundle[0].cam,
                &key_frames[0].frames[0],
                point,
                point.log_depth,
                host_to_target.get(0, 0, 1, 0),
                &settings,
            ));
            log_depths.push(point.log_depth);
        }

        Self {
            bundle: scene.bundle,
            key_frames,
            residuals,
            log_depths,
            host_light,
            target_light,
            settings,
        }
    }

    fn host_pose(&self) -> Isometry3<f64> {
        self.key_frames[0].body_to_world
    }

    fn target_pose(&self) -> Isometry3<f64> {
        self.key_frames[1].body_to_world
    }

    fn host_to_target(&self, host: &Isometry3<f64>, target: &Isometry3<f64>) -> Isometry3<f64> {
        target.inverse() * host
    }

    fn light_host_to_target(&self, host: &AffineLight, target: &AffineLight) -> AffineLight {
        *target * host.inverse()
    }

    /// Residual vector at explicitly given parameters.
    fn eval(
        &self,
        residual_ind: usize,
        host: &Isometry3<f64>,
        target: &Isometry3<f64>,
        host_light: &AffineLight,
        target_light: &AffineLight,
        log_depth: f64,
    ) -> DVector<f64> {
        self.residuals[residual_ind].values(
            &self.bundle.bundle[0].cam,
            &self.key_frames[1].frames[0],
            &self.host_to_target(host, target),
            &self.light_host_to_target(host_light, target_light),
            log_depth,
            None,
        )
    }

    fn analytic(&self, residual_ind: usize) -> direct_ba::optimize::residual::ResidualJacobian {
        let host = self.host_pose();
        let target = self.target_pose();
        let motion = MotionDerivatives::new(
            &Isometry3::identity(),
            &host,
            &target,
            &Isometry3::identity(),
        );
        self.residuals[residual_ind].jacobian(
            &self.bundle.bundle[0].cam,
            &self.key_frames[1].frames[0],
            &self.host_to_target(&host, &target),
            &motion,
            &self.host_light,
            &self.light_host_to_target(&self.host_light, &self.target_light),
            self.log_depths[residual_ind],
            self.settings.depth.max,
        )
    }
}

fn assert_column_close(analytic: &DVector<f64>, numeric: &DVector<f64>, label: &str) {
    let scale = analytic.amax().max(1.0);
    for i in 0..analytic.len() {
        let diff = (analytic[i] - numeric[i]).abs();
        assert!(
            diff <= REL_TOL * scale,
            "{label}[{i}]: analytic {} vs numeric {} (scale {scale})",
            analytic[i],
            numeric[i]
        );
    }
}

#[test]
fn log_depth_jacobian_matches_finite_differences() {
    let fixture = Fixture::new();
    for ri in 0..fixture.residuals.len() {
        let jacobian = fixture.analytic(ri);
        let analytic = jacobian.dr_dlogd();

        let host = fixture.host_pose();
        let target = fixture.target_pose();
        let d = fixture.log_depths[ri];
        let plus = fixture.eval(ri, &host, &target, &fixture.host_light, &fixture.target_light, d + FD_EPS);
        let minus = fixture.eval(ri, &host, &target, &fixture.host_light, &fixture.target_light, d - FD_EPS);
        let numeric = (plus - minus) / (2.0 * FD_EPS);
        assert_column_close(&analytic, &numeric, "dr_dlogd");
    }
}

#[test]
fn pose_jacobians_match_tangent_finite_differences() {
    let fixture = Fixture::new();
    for ri in 0..fixture.residuals.len() {
        let jacobian = fixture.analytic(ri);
        let host = fixture.host_pose();
        let target = fixture.target_pose();
        let d = fixture.log_depths[ri];

        // Rotations, through the so(3) tangent contraction.
        let dr_drot_host =
            &jacobian.grad_i_target * (jacobian.dhost.dp_dq * quat_exp_tangent(&host.rotation));
        let dr_drot_target = &jacobian.grad_i_target
            * (jacobian.dtarget.dp_dq * quat_exp_tangent(&target.rotation));
        let dr_dt_host = &jacobian.grad_i_target * jacobian.dhost.dp_dt;
        let dr_dt_target = &jacobian.grad_i_target * jacobian.dtarget.dp_dt;

        for axis in 0..3 {
            let mut xi = Vector3::zeros();
            xi[axis] = FD_EPS;

            let rot_plus = common::perturb_rotation(&host, xi);
            let rot_minus = common::perturb_rotation(&host, -xi);
            let numeric = (fixture.eval(ri, &rot_plus, &target, &fixture.host_light, &fixture.target_light, d)
                - fixture.eval(ri, &rot_minus, &target, &fixture.host_light, &fixture.target_light, d))
                / (2.0 * FD_EPS);
            assert_column_close(&dr_drot_host.column(axis).into_owned(), &numeric, "host rot");

            let rot_plus = common::perturb_rotation(&target, xi);
            let rot_minus = common::perturb_rotation(&target, -xi);
            let numeric = (fixture.eval(ri, &host, &rot_plus, &fixture.host_light, &fixture.target_light, d)
                - fixture.eval(ri, &host, &rot_minus, &fixture.host_light, &fixture.target_light, d))
                / (2.0 * FD_EPS);
            assert_column_close(
                &dr_drot_target.column(axis).into_owned(),
                &numeric,
                "target rot",
            );

            let mut trans_plus = host;
            trans_plus.translation.vector[axis] += FD_EPS;
            let mut trans_minus = host;
            trans_minus.translation.vector[axis] -= FD_EPS;
            let numeric = (fixture.eval(ri, &trans_plus, &target, &fixture.host_light, &fixture.target_light, d)
                - fixture.eval(ri, &trans_minus, &target, &fixture.host_light, &fixture.target_light, d))
                / (2.0 * FD_EPS);
            assert_column_close(&dr_dt_host.column(axis).into_owned(), &numeric, "host trans");

            let mut trans_plus = target;
            trans_plus.translation.vector[axis] += FD_EPS;
            let mut trans_minus = target;
            trans_minus.translation.vector[axis] -= FD_EPS;
            let numeric = (fixture.eval(ri, &host, &trans_plus, &fixture.host_light, &fixture.target_light, d)
                - fixture.eval(ri, &host, &trans_minus, &fixture.host_light, &fixture.target_light, d))
                / (2.0 * FD_EPS);
            assert_column_close(
                &dr_dt_target.column(axis).into_owned(),
                &numeric,
                "target trans",
            );
        }
    }
}

#[test]
fn affine_jacobians_match_finite_differences() {
    let fixture = Fixture::new();
    for ri in 0..fixture.residuals.len() {
        let jacobian = fixture.analytic(ri);
        let host = fixture.host_pose();
        let target = fixture.target_pose();
        let d = fixture.log_depths[ri];
        let pattern = jacobian.grad_i_target.nrows();

        // (group, parameter index within the pair)
        for (label, is_host, param) in [
            ("host a", true, 0usize),
            ("host b", true, 1),
            ("target a", false, 0),
            ("target b", false, 1),
        ] {
            let perturb = |sign: f64| -> (AffineLight, AffineLight) {
                let mut host_light = fixture.host_light;
                let mut target_light = fixture.target_light;
                let light = if is_host {
                    &mut host_light
                } else {
                    &mut target_light
                };
                if param == 0 {
                    light.a += sign * FD_EPS;
                } else {
                    light.b += sign * FD_EPS;
                }
                (host_light, target_light)
            };
            let (host_plus, target_plus) = perturb(1.0);
            let (host_minus, target_minus) = perturb(-1.0);
            let numeric = (fixture.eval(ri, &host, &target, &host_plus, &target_plus, d)
                - fixture.eval(ri, &host, &target, &host_minus, &target_minus, d))
                / (2.0 * FD_EPS);

            let analytic = DVector::from_fn(pattern, |i, _| {
                if is_host {
                    jacobian.dhost.dr_dab[(i, param)]
                } else {
                    jacobian.dtarget.dr_dab[(i, param)]
                }
            });
            assert_column_close(&analytic, &numeric, label);
        }
    }
}

#[test]
fn quaternion_update_direction_is_consistent() {
    // The contraction direction used above must match Parameters::update,
    // which right-multiplies by exp(ξ/2).
    let q = UnitQuaternion::from_scaled_axis(Vector3::new(0.3, -0.1, 0.2));
    let xi = Vector3::new(0.0, 1e-6, 0.0);
    let via_update = q * UnitQuaternion::from_scaled_axis(xi);
    let tangent = quat_exp_tangent(&q);
    let linear = tangent * xi;
    let diff_w = via_update.scalar() - q.scalar();
    assert!((linear[0] - diff_w).abs() < 1e-11);
}
