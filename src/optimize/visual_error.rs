//! Visual reprojection residuals.
//!
//! Both costs measure `weight * (observation - projection)` in pixels.
//! Pose blocks are `[qx, qy, qz, qw, t]` (T_wc of the body); Jacobians are
//! produced in the 6-D tangent of the pose manifold, rotation first.

use nalgebra::{DMatrix, Matrix2x3, Matrix3, Vector2, Vector3};

use crate::camera::Camera;
use crate::geometry::{skew, SE3};

use super::problem::CostFunction;

/// ∂π/∂X at a sensor-frame point.
fn projection_jacobian(camera: &Camera, p: &Vector3<f64>) -> Matrix2x3<f64> {
    let iz = 1.0 / p.z;
    Matrix2x3::new(
        camera.fx * iz, 0.0, -camera.fx * p.x * iz * iz,
        0.0, camera.fy * iz, -camera.fy * p.y * iz * iz,
    )
}

/// Reprojection of a fixed world point into one pose; used for landmarks
/// whose reference frame has already slid out of the window.
pub struct PoseOnlyReprojectionError {
    observation: Vector2<f64>,
    point_world: Vector3<f64>,
    camera: Camera,
    weight: f64,
}

impl PoseOnlyReprojectionError {
    pub fn new(
        observation: Vector2<f64>,
        point_world: Vector3<f64>,
        camera: Camera,
        weight: f64,
    ) -> Self {
        Self {
            observation,
            point_world,
            camera,
            weight,
        }
    }
}

impl CostFunction for PoseOnlyReprojectionError {
    fn num_residuals(&self) -> usize {
        2
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![6]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let pose = SE3::from_params(params[0]);
        let r_wc_t = pose.rotation_matrix().transpose();
        let p_body = r_wc_t * (self.point_world - pose.translation);
        let p_sensor = self.camera.extrinsic.transform_point(&p_body);
        if p_sensor.z <= 1e-6 {
            return false;
        }

        let uv = Vector2::new(
            self.camera.fx * p_sensor.x / p_sensor.z + self.camera.cx,
            self.camera.fy * p_sensor.y / p_sensor.z + self.camera.cy,
        );
        let r = self.weight * (self.observation - uv);
        residuals[0] = r.x;
        residuals[1] = r.y;

        if let Some(jacs) = jacobians {
            let j_proj = projection_jacobian(&self.camera, &p_sensor);
            let r_ext = self.camera.extrinsic.rotation_matrix();
            // ∂p_body/∂δθ = [p_body]×, ∂p_body/∂δt = -Rᵀ.
            let mut d_body = nalgebra::Matrix3x6::zeros();
            d_body.fixed_view_mut::<3, 3>(0, 0).copy_from(&skew(&p_body));
            d_body.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-r_wc_t));
            let j = -self.weight * j_proj * r_ext * d_body;
            jacs[0].copy_from(&j);
        }
        true
    }
}

/// Reprojection of a landmark kept in its reference frame's camera
/// coordinates, linking the reference pose and the observing pose.
pub struct TwoFrameReprojectionError {
    point_ref: Vector3<f64>,
    observation: Vector2<f64>,
    camera: Camera,
    weight: f64,
}

impl TwoFrameReprojectionError {
    pub fn new(
        point_ref: Vector3<f64>,
        observation: Vector2<f64>,
        camera: Camera,
        weight: f64,
    ) -> Self {
        Self {
            point_ref,
            observation,
            camera,
            weight,
        }
    }
}

impl CostFunction for TwoFrameReprojectionError {
    fn num_residuals(&self) -> usize {
        2
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![6, 6]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let pose_ref = SE3::from_params(params[0]);
        let pose_cur = SE3::from_params(params[1]);

        let p_world = pose_ref.transform_point(&self.point_ref);
        let r_cur_t = pose_cur.rotation_matrix().transpose();
        let p_body = r_cur_t * (p_world - pose_cur.translation);
        let p_sensor = self.camera.extrinsic.transform_point(&p_body);
        if p_sensor.z <= 1e-6 {
            return false;
        }

        let uv = Vector2::new(
            self.camera.fx * p_sensor.x / p_sensor.z + self.camera.cx,
            self.camera.fy * p_sensor.y / p_sensor.z + self.camera.cy,
        );
        let r = self.weight * (self.observation - uv);
        residuals[0] = r.x;
        residuals[1] = r.y;

        if let Some(jacs) = jacobians {
            let j_proj = projection_jacobian(&self.camera, &p_sensor);
            let r_ext = self.camera.extrinsic.rotation_matrix();
            let r_ref = pose_ref.rotation_matrix();
            let front = -self.weight * j_proj * r_ext;

            // Reference pose: p_world = R₁ p_ref + t₁.
            let mut d_ref = nalgebra::Matrix3x6::zeros();
            d_ref
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(-r_ref * skew(&self.point_ref)));
            d_ref
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&Matrix3::identity());
            jacs[0].copy_from(&(front * r_cur_t * d_ref));

            // Current pose, same shape as the pose-only term.
            let mut d_cur = nalgebra::Matrix3x6::zeros();
            d_cur.fixed_view_mut::<3, 3>(0, 0).copy_from(&skew(&p_body));
            d_cur.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-r_cur_t));
            jacs[1].copy_from(&(front * d_cur));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::problem::{Loss, Manifold, Problem};
    use crate::optimize::solver::SolverOptions;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn test_camera() -> Camera {
        Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity())
    }

    #[test]
    fn test_zero_residual_at_true_pose() {
        let camera = test_camera();
        let pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.1, 0.0, 0.0),
        );
        let p_world = Vector3::new(0.5, -0.3, 4.0);
        let obs = camera.world_to_pixel(&p_world, &pose).unwrap();

        let cost = PoseOnlyReprojectionError::new(obs, p_world, camera, 1.0);
        let params = pose.to_params();
        let mut r = [0.0; 2];
        assert!(cost.evaluate(&[&params], &mut r, None));
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_point_behind_camera_skipped() {
        let camera = test_camera();
        let cost = PoseOnlyReprojectionError::new(
            Vector2::new(320.0, 240.0),
            Vector3::new(0.0, 0.0, -2.0),
            camera,
            1.0,
        );
        let params = SE3::identity().to_params();
        let mut r = [0.0; 2];
        assert!(!cost.evaluate(&[&params], &mut r, None));
    }

    #[test]
    fn test_pose_only_recovers_translation_offset() {
        let camera = test_camera();
        let truth = SE3::new(UnitQuaternion::identity(), Vector3::new(0.2, -0.1, 0.0));

        let mut problem: Problem<u32> = Problem::new();
        let guess = SE3::identity().to_params();
        problem.add_parameter_block(0, &guess, Manifold::Se3);

        // A spread of world points observed from the true pose.
        for p in [
            Vector3::new(1.0, 0.5, 5.0),
            Vector3::new(-1.0, 0.2, 4.0),
            Vector3::new(0.3, -0.8, 6.0),
            Vector3::new(-0.5, -0.5, 3.0),
            Vector3::new(0.8, 0.9, 7.0),
        ] {
            let obs = camera.world_to_pixel(&p, &truth).unwrap();
            problem.add_residual_block(
                Box::new(PoseOnlyReprojectionError::new(obs, p, camera.clone(), 1.0)),
                Some(Loss::Huber(1.0)),
                &[0],
            );
        }

        let summary = problem.solve(&SolverOptions {
            max_iterations: 50,
            ..Default::default()
        });
        assert!(summary.final_cost < 1e-8, "cost {}", summary.final_cost);
        let solved = SE3::from_params(problem.get(0).unwrap());
        assert_relative_eq!(solved.translation, truth.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_two_frame_zero_residual_at_consistent_geometry() {
        let camera = test_camera();
        let pose_ref = SE3::identity();
        let pose_cur = SE3::new(UnitQuaternion::identity(), Vector3::new(0.1, 0.0, 0.0));
        let p_ref = Vector3::new(0.4, 0.2, 3.0);
        let p_world = pose_ref.transform_point(&p_ref);
        let obs = camera.world_to_pixel(&p_world, &pose_cur).unwrap();

        let cost = TwoFrameReprojectionError::new(p_ref, obs, camera, 1.0);
        let pr = pose_ref.to_params();
        let pc = pose_cur.to_params();
        let mut r = [0.0; 2];
        assert!(cost.evaluate(&[&pr, &pc], &mut r, None));
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(r[1], 0.0, epsilon = 1e-9);
    }
}
