//! IMU preintegration residuals for the backend window and the initializer.

use nalgebra::{DMatrix, Matrix3, Quaternion, SMatrix, UnitQuaternion, Vector3};

use crate::geometry::{right_jacobian_inv, skew, SE3};
use crate::imu::preintegration::{Matrix15, Preintegration};
use crate::imu::{ImuBias, GRAVITY};

use super::problem::CostFunction;

const O_P: usize = 0;
const O_R: usize = 3;
const O_V: usize = 6;
const O_BA: usize = 9;
const O_BG: usize = 12;

fn quat_from_params(p: &[f64]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(p[3], p[0], p[1], p[2]))
}

fn vec3(p: &[f64]) -> Vector3<f64> {
    Vector3::new(p[0], p[1], p[2])
}

/// 15-D preintegration constraint between consecutive keyframes over
/// `{pose_i, v_i, ba_i, bg_i, pose_j, v_j, ba_j, bg_j}`, whitened by the
/// square-root information of the accumulated covariance.
pub struct ImuError {
    preint: Preintegration,
    sqrt_info: Matrix15,
}

impl ImuError {
    pub fn new(preint: Preintegration) -> Self {
        let sqrt_info = preint.sqrt_information();
        Self { preint, sqrt_info }
    }
}

impl CostFunction for ImuError {
    fn num_residuals(&self) -> usize {
        15
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![6, 3, 3, 3, 6, 3, 3, 3]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let q_i = quat_from_params(params[0]);
        let p_i = Vector3::new(params[0][4], params[0][5], params[0][6]);
        let v_i = vec3(params[1]);
        let ba_i = vec3(params[2]);
        let bg_i = vec3(params[3]);
        let q_j = quat_from_params(params[4]);
        let p_j = Vector3::new(params[4][4], params[4][5], params[4][6]);
        let v_j = vec3(params[5]);
        let ba_j = vec3(params[6]);
        let bg_j = vec3(params[7]);

        let raw = self.preint.evaluate(
            &p_i, &q_i, &v_i, &ba_i, &bg_i, &p_j, &q_j, &v_j, &ba_j, &bg_j,
        );
        let whitened = self.sqrt_info * raw;
        for (out, v) in residuals.iter_mut().zip(whitened.iter()) {
            *out = *v;
        }

        if let Some(jacs) = jacobians {
            let dt = self.preint.sum_dt;
            let r_i_t = q_i.to_rotation_matrix().into_inner().transpose();
            let r_theta = Vector3::new(raw[O_R], raw[O_R + 1], raw[O_R + 2]);
            let jr_inv = right_jacobian_inv(&r_theta);
            let eye = Matrix3::identity();

            let dp_dba: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_P, O_BA).into_owned();
            let dp_dbg: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_P, O_BG).into_owned();
            let dv_dba: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_V, O_BA).into_owned();
            let dv_dbg: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_V, O_BG).into_owned();
            let dq_dbg: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_R, O_BG).into_owned();

            // pose_i (rotation, translation).
            let mut j = SMatrix::<f64, 15, 6>::zeros();
            j.fixed_view_mut::<3, 3>(O_P, 0)
                .copy_from(&skew(&(r_i_t * (p_j - p_i - v_i * dt - 0.5 * GRAVITY * dt * dt))));
            j.fixed_view_mut::<3, 3>(O_P, 3).copy_from(&(-r_i_t));
            j.fixed_view_mut::<3, 3>(O_R, 0)
                .copy_from(&(-jr_inv * (q_j.inverse() * q_i).to_rotation_matrix().into_inner()));
            j.fixed_view_mut::<3, 3>(O_V, 0)
                .copy_from(&skew(&(r_i_t * (v_j - v_i - GRAVITY * dt))));
            jacs[0].copy_from(&(self.sqrt_info * j));

            // v_i.
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(O_P, 0).copy_from(&(-r_i_t * dt));
            j.fixed_view_mut::<3, 3>(O_V, 0).copy_from(&(-r_i_t));
            jacs[1].copy_from(&(self.sqrt_info * j));

            // ba_i.
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(O_P, 0).copy_from(&(-dp_dba));
            j.fixed_view_mut::<3, 3>(O_V, 0).copy_from(&(-dv_dba));
            j.fixed_view_mut::<3, 3>(O_BA, 0).copy_from(&(-eye));
            jacs[2].copy_from(&(self.sqrt_info * j));

            // bg_i.
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(O_P, 0).copy_from(&(-dp_dbg));
            j.fixed_view_mut::<3, 3>(O_R, 0).copy_from(&(-jr_inv * dq_dbg));
            j.fixed_view_mut::<3, 3>(O_V, 0).copy_from(&(-dv_dbg));
            j.fixed_view_mut::<3, 3>(O_BG, 0).copy_from(&(-eye));
            jacs[3].copy_from(&(self.sqrt_info * j));

            // pose_j.
            let mut j = SMatrix::<f64, 15, 6>::zeros();
            j.fixed_view_mut::<3, 3>(O_P, 3).copy_from(&r_i_t);
            j.fixed_view_mut::<3, 3>(O_R, 0).copy_from(&jr_inv);
            jacs[4].copy_from(&(self.sqrt_info * j));

            // v_j.
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(O_V, 0).copy_from(&r_i_t);
            jacs[5].copy_from(&(self.sqrt_info * j));

            // ba_j.
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(O_BA, 0).copy_from(&eye);
            jacs[6].copy_from(&(self.sqrt_info * j));

            // bg_j.
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(O_BG, 0).copy_from(&eye);
            jacs[7].copy_from(&(self.sqrt_info * j));
        }
        true
    }
}

/// Initializer constraint over `{v_i, ba, bg, v_j, Rwg}` with the keyframe
/// poses held fixed and Gaussian priors on the biases.
///
/// Rows 0..9 are the whitened [r_p, r_θ, r_v] of the preintegration with
/// gravity rotated by Rwg; rows 9..15 are the bias priors.
pub struct ImuErrorG {
    preint: Preintegration,
    pose_i: SE3,
    pose_j: SE3,
    prior_a: f64,
    prior_g: f64,
    sqrt_info: SMatrix<f64, 9, 9>,
}

impl ImuErrorG {
    pub fn new(
        preint: Preintegration,
        pose_i: SE3,
        pose_j: SE3,
        prior_a: f64,
        prior_g: f64,
    ) -> Self {
        let cov9: SMatrix<f64, 9, 9> = preint.covariance.fixed_view::<9, 9>(0, 0).into_owned();
        let regularized = cov9 + SMatrix::<f64, 9, 9>::identity() * 1e-10;
        let sqrt_info = regularized
            .try_inverse()
            .and_then(|info| nalgebra::Cholesky::new(info).map(|c| c.l().transpose()))
            .unwrap_or_else(SMatrix::<f64, 9, 9>::identity);
        Self {
            preint,
            pose_i,
            pose_j,
            prior_a,
            prior_g,
            sqrt_info,
        }
    }
}

impl CostFunction for ImuErrorG {
    fn num_residuals(&self) -> usize {
        15
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![3, 3, 3, 3, 3]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let v_i = vec3(params[0]);
        let ba = vec3(params[1]);
        let bg = vec3(params[2]);
        let v_j = vec3(params[3]);
        let rwg = quat_from_params(params[4]);

        let bias = ImuBias {
            accel: ba,
            gyro: bg,
        };
        let dt = self.preint.sum_dt;
        let g_w = rwg * GRAVITY;

        let q_i = self.pose_i.rotation;
        let p_i = self.pose_i.translation;
        let q_j = self.pose_j.rotation;
        let p_j = self.pose_j.translation;
        let r_i_t = q_i.to_rotation_matrix().into_inner().transpose();

        let r_p = r_i_t * (p_j - p_i - v_i * dt - 0.5 * g_w * dt * dt)
            - self.preint.delta_position(&bias);
        let r_theta = (self.preint.delta_rotation(&bias).inverse() * (q_i.inverse() * q_j))
            .scaled_axis();
        let r_v = r_i_t * (v_j - v_i - g_w * dt) - self.preint.delta_velocity(&bias);

        let mut r9 = SMatrix::<f64, 9, 1>::zeros();
        r9.fixed_rows_mut::<3>(0).copy_from(&r_p);
        r9.fixed_rows_mut::<3>(3).copy_from(&r_theta);
        r9.fixed_rows_mut::<3>(6).copy_from(&r_v);
        let whitened = self.sqrt_info * r9;

        let wa = self.prior_a.sqrt();
        let wg = self.prior_g.sqrt();
        for (out, v) in residuals.iter_mut().take(9).zip(whitened.iter()) {
            *out = *v;
        }
        for k in 0..3 {
            residuals[9 + k] = wa * ba[k];
            residuals[12 + k] = wg * bg[k];
        }

        if let Some(jacs) = jacobians {
            let dp_dba: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_P, O_BA).into_owned();
            let dp_dbg: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_P, O_BG).into_owned();
            let dv_dba: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_V, O_BA).into_owned();
            let dv_dbg: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_V, O_BG).into_owned();
            let dq_dbg: Matrix3<f64> =
                self.preint.jacobian.fixed_view::<3, 3>(O_R, O_BG).into_owned();
            let jr_inv = right_jacobian_inv(&r_theta);

            // v_i.
            let mut j = SMatrix::<f64, 9, 3>::zeros();
            j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-r_i_t * dt));
            j.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-r_i_t));
            let mut out = DMatrix::zeros(15, 3);
            out.view_mut((0, 0), (9, 3)).copy_from(&(self.sqrt_info * j));
            jacs[0].copy_from(&out);

            // ba (with prior row).
            let mut j = SMatrix::<f64, 9, 3>::zeros();
            j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-dp_dba));
            j.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-dv_dba));
            let mut out = DMatrix::zeros(15, 3);
            out.view_mut((0, 0), (9, 3)).copy_from(&(self.sqrt_info * j));
            out.view_mut((9, 0), (3, 3))
                .copy_from(&(Matrix3::identity() * wa));
            jacs[1].copy_from(&out);

            // bg (with prior row).
            let mut j = SMatrix::<f64, 9, 3>::zeros();
            j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-dp_dbg));
            j.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-jr_inv * dq_dbg));
            j.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-dv_dbg));
            let mut out = DMatrix::zeros(15, 3);
            out.view_mut((0, 0), (9, 3)).copy_from(&(self.sqrt_info * j));
            out.view_mut((12, 0), (3, 3))
                .copy_from(&(Matrix3::identity() * wg));
            jacs[2].copy_from(&out);

            // v_j.
            let mut j = SMatrix::<f64, 9, 3>::zeros();
            j.fixed_view_mut::<3, 3>(6, 0).copy_from(&r_i_t);
            let mut out = DMatrix::zeros(15, 3);
            out.view_mut((0, 0), (9, 3)).copy_from(&(self.sqrt_info * j));
            jacs[3].copy_from(&out);

            // Rwg tangent: ∂g_w/∂δ = -Rwg [G]×.
            let dg = -rwg.to_rotation_matrix().into_inner() * skew(&GRAVITY);
            let mut j = SMatrix::<f64, 9, 3>::zeros();
            j.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(-0.5 * dt * dt * r_i_t * dg));
            j.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-dt * r_i_t * dg));
            let mut out = DMatrix::zeros(15, 3);
            out.view_mut((0, 0), (9, 3)).copy_from(&(self.sqrt_info * j));
            jacs[4].copy_from(&out);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{ImuCalib, Preintegration};
    use approx::assert_relative_eq;

    fn resting_preint(duration: f64) -> Preintegration {
        let mut preint = Preintegration::new(ImuBias::zero(), ImuCalib::default());
        let dt = 0.005;
        let mut t = 0.0;
        while t < duration {
            preint.append(dt, -GRAVITY, Vector3::zeros()).unwrap();
            t += dt;
        }
        preint
    }

    #[test]
    fn test_imu_error_zero_at_consistent_states() {
        let preint = resting_preint(0.3);
        let dt = preint.sum_dt;
        let cost = ImuError::new(preint.clone());

        let q_i = UnitQuaternion::identity();
        let p_i = Vector3::zeros();
        let v_i = Vector3::zeros();
        let q_j = q_i * preint.delta_q;
        let v_j = v_i + GRAVITY * dt + q_i * preint.delta_v;
        let p_j = p_i + v_i * dt + 0.5 * GRAVITY * dt * dt + q_i * preint.delta_p;

        let pose_i = SE3::new(q_i, p_i).to_params();
        let pose_j = SE3::new(q_j, p_j).to_params();
        let zero = [0.0; 3];
        let v_i_p = [v_i.x, v_i.y, v_i.z];
        let v_j_p = [v_j.x, v_j.y, v_j.z];

        let mut r = [0.0; 15];
        assert!(cost.evaluate(
            &[&pose_i, &v_i_p, &zero, &zero, &pose_j, &v_j_p, &zero, &zero],
            &mut r,
            None
        ));
        let norm: f64 = r.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert_relative_eq!(norm, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_imu_error_g_zero_for_stationary_body() {
        // A resting body: identical poses, zero velocities, gravity aligned.
        let preint = resting_preint(0.3);
        let pose = SE3::identity();
        let cost = ImuErrorG::new(preint, pose, pose, 0.0, 0.0);

        let v = [0.0; 3];
        let ba = [0.0; 3];
        let bg = [0.0; 3];
        let rwg = [0.0, 0.0, 0.0, 1.0];
        let mut r = [0.0; 15];
        assert!(cost.evaluate(&[&v, &ba, &bg, &v, &rwg], &mut r, None));
        let norm: f64 = r.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert_relative_eq!(norm, 0.0, epsilon = 1e-4);
    }
}
