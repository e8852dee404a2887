//! IMU preintegration between two keyframes.
//!
//! Raw samples are folded into a relative-motion summary (ΔR, Δv, Δp) with a
//! 15×15 covariance over [δp, δθ, δv, δba, δbg] and first-order bias
//! Jacobians, so the backend can relinearize around new bias estimates
//! without touching the raw stream. Integration uses the midpoint rule.

use nalgebra::{Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

use crate::geometry::skew;
use crate::CoreError;

use super::sample::{ImuBias, ImuCalib, GRAVITY};

pub type Matrix15 = SMatrix<f64, 15, 15>;
pub type Vector15 = SVector<f64, 15>;

// State block offsets inside the 15-vector.
const O_P: usize = 0;
const O_R: usize = 3;
const O_V: usize = 6;
const O_BA: usize = 9;
const O_BG: usize = 12;

/// Bias drift beyond which `set_new_bias` re-integrates instead of relying
/// on the first-order Jacobian correction.
#[derive(Debug, Clone, Copy)]
pub struct RelinThreshold {
    pub accel: f64,
    pub gyro: f64,
}

impl Default for RelinThreshold {
    fn default() -> Self {
        Self {
            accel: 1e-1,
            gyro: 1e-2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preintegration {
    pub sum_dt: f64,
    pub delta_q: UnitQuaternion<f64>,
    pub delta_v: Vector3<f64>,
    pub delta_p: Vector3<f64>,
    /// Covariance of [δp, δθ, δv, δba, δbg].
    pub covariance: Matrix15,
    /// Accumulated state Jacobian; bias blocks feed the first-order
    /// corrections.
    pub jacobian: Matrix15,
    /// Bias the deltas and Jacobians are linearized about.
    pub linearized_bias: ImuBias,
    /// Latest bias estimate (may drift from `linearized_bias`).
    pub bias: ImuBias,
    pub calib: ImuCalib,
    relin: RelinThreshold,

    // Raw stream kept for re-integration.
    samples: Vec<(f64, Vector3<f64>, Vector3<f64>)>,
    last_accel: Option<Vector3<f64>>,
    last_gyro: Option<Vector3<f64>>,
}

impl Preintegration {
    pub fn new(bias: ImuBias, calib: ImuCalib) -> Self {
        Self {
            sum_dt: 0.0,
            delta_q: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            covariance: Matrix15::zeros(),
            jacobian: Matrix15::identity(),
            linearized_bias: bias,
            bias,
            calib,
            relin: RelinThreshold::default(),
            samples: Vec::new(),
            last_accel: None,
            last_gyro: None,
        }
    }

    pub fn with_relin_threshold(mut self, relin: RelinThreshold) -> Self {
        self.relin = relin;
        self
    }

    /// Incorporate one sample taken `dt` seconds after the previous one.
    pub fn append(
        &mut self,
        dt: f64,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
    ) -> Result<(), CoreError> {
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(CoreError::InvalidInput("non-monotonic IMU timestamps"));
        }
        if !accel.iter().all(|v| v.is_finite()) || !gyro.iter().all(|v| v.is_finite()) {
            return Err(CoreError::InvalidInput("non-finite IMU sample"));
        }
        self.samples.push((dt, accel, gyro));
        self.propagate(dt, accel, gyro);
        Ok(())
    }

    /// Midpoint propagation of the mean, Jacobian, and covariance.
    fn propagate(&mut self, dt: f64, accel_1: Vector3<f64>, gyro_1: Vector3<f64>) {
        let accel_0 = self.last_accel.unwrap_or(accel_1);
        let gyro_0 = self.last_gyro.unwrap_or(gyro_1);

        let ba = self.linearized_bias.accel;
        let bg = self.linearized_bias.gyro;

        let un_gyro = 0.5 * (gyro_0 + gyro_1) - bg;
        let delta_q_new = self.delta_q * UnitQuaternion::from_scaled_axis(un_gyro * dt);

        let un_accel_0 = self.delta_q * (accel_0 - ba);
        let un_accel_1 = delta_q_new * (accel_1 - ba);
        let un_accel = 0.5 * (un_accel_0 + un_accel_1);

        let delta_p_new = self.delta_p + self.delta_v * dt + 0.5 * un_accel * dt * dt;
        let delta_v_new = self.delta_v + un_accel * dt;

        // Discrete error-state transition.
        let r_0 = self.delta_q.to_rotation_matrix().into_inner();
        let r_1 = delta_q_new.to_rotation_matrix().into_inner();
        let a_0x = skew(&(accel_0 - ba));
        let a_1x = skew(&(accel_1 - ba));
        let w_x = skew(&un_gyro);
        let eye = Matrix3::identity();

        let mut f = Matrix15::identity();
        let f_pq = -0.25 * r_0 * a_0x * dt * dt
            - 0.25 * r_1 * a_1x * (eye - w_x * dt) * dt * dt;
        f.fixed_view_mut::<3, 3>(O_P, O_R).copy_from(&f_pq);
        f.fixed_view_mut::<3, 3>(O_P, O_V).copy_from(&(eye * dt));
        f.fixed_view_mut::<3, 3>(O_P, O_BA)
            .copy_from(&(-0.25 * (r_0 + r_1) * dt * dt));
        f.fixed_view_mut::<3, 3>(O_P, O_BG)
            .copy_from(&(0.25 * r_1 * a_1x * dt * dt * dt));
        f.fixed_view_mut::<3, 3>(O_R, O_R).copy_from(&(eye - w_x * dt));
        f.fixed_view_mut::<3, 3>(O_R, O_BG).copy_from(&(-eye * dt));
        let f_vq = -0.5 * r_0 * a_0x * dt - 0.5 * r_1 * a_1x * (eye - w_x * dt) * dt;
        f.fixed_view_mut::<3, 3>(O_V, O_R).copy_from(&f_vq);
        f.fixed_view_mut::<3, 3>(O_V, O_BA)
            .copy_from(&(-0.5 * (r_0 + r_1) * dt));
        f.fixed_view_mut::<3, 3>(O_V, O_BG)
            .copy_from(&(0.5 * r_1 * a_1x * dt * dt));

        // Noise input: [n_a0, n_g0, n_a1, n_g1, n_ba, n_bg].
        let mut v = SMatrix::<f64, 15, 18>::zeros();
        v.fixed_view_mut::<3, 3>(O_P, 0)
            .copy_from(&(0.25 * r_0 * dt * dt));
        v.fixed_view_mut::<3, 3>(O_P, 3)
            .copy_from(&(-0.125 * r_1 * a_1x * dt * dt * dt));
        v.fixed_view_mut::<3, 3>(O_P, 6)
            .copy_from(&(0.25 * r_1 * dt * dt));
        v.fixed_view_mut::<3, 3>(O_P, 9)
            .copy_from(&(-0.125 * r_1 * a_1x * dt * dt * dt));
        v.fixed_view_mut::<3, 3>(O_R, 3).copy_from(&(0.5 * eye * dt));
        v.fixed_view_mut::<3, 3>(O_R, 9).copy_from(&(0.5 * eye * dt));
        v.fixed_view_mut::<3, 3>(O_V, 0).copy_from(&(0.5 * r_0 * dt));
        v.fixed_view_mut::<3, 3>(O_V, 3)
            .copy_from(&(-0.25 * r_1 * a_1x * dt * dt));
        v.fixed_view_mut::<3, 3>(O_V, 6).copy_from(&(0.5 * r_1 * dt));
        v.fixed_view_mut::<3, 3>(O_V, 9)
            .copy_from(&(-0.25 * r_1 * a_1x * dt * dt));
        v.fixed_view_mut::<3, 3>(O_BA, 12).copy_from(&(eye * dt));
        v.fixed_view_mut::<3, 3>(O_BG, 15).copy_from(&(eye * dt));

        let noise = self.noise_covariance();

        self.jacobian = f * self.jacobian;
        self.covariance = f * self.covariance * f.transpose() + v * noise * v.transpose();

        self.delta_q = delta_q_new;
        self.delta_v = delta_v_new;
        self.delta_p = delta_p_new;
        self.sum_dt += dt;
        self.last_accel = Some(accel_1);
        self.last_gyro = Some(gyro_1);
    }

    fn noise_covariance(&self) -> SMatrix<f64, 18, 18> {
        let n = &self.calib.noise;
        let mut q = SMatrix::<f64, 18, 18>::zeros();
        let acc = n.sigma_accel * n.sigma_accel;
        let gyr = n.sigma_gyro * n.sigma_gyro;
        let acc_w = n.sigma_accel_walk * n.sigma_accel_walk;
        let gyr_w = n.sigma_gyro_walk * n.sigma_gyro_walk;
        for i in 0..3 {
            q[(i, i)] = acc;
            q[(3 + i, 3 + i)] = gyr;
            q[(6 + i, 6 + i)] = acc;
            q[(9 + i, 9 + i)] = gyr;
            q[(12 + i, 12 + i)] = acc_w;
            q[(15 + i, 15 + i)] = gyr_w;
        }
        q
    }

    /// Bias-corrected ΔR about bias `b`.
    pub fn delta_rotation(&self, b: &ImuBias) -> UnitQuaternion<f64> {
        let dbg = b.gyro - self.linearized_bias.gyro;
        let dq_dbg: Matrix3<f64> = self.jacobian.fixed_view::<3, 3>(O_R, O_BG).into_owned();
        self.delta_q * UnitQuaternion::from_scaled_axis(dq_dbg * dbg)
    }

    /// Bias-corrected Δv about bias `b`.
    pub fn delta_velocity(&self, b: &ImuBias) -> Vector3<f64> {
        let dba = b.accel - self.linearized_bias.accel;
        let dbg = b.gyro - self.linearized_bias.gyro;
        let dv_dba: Matrix3<f64> = self.jacobian.fixed_view::<3, 3>(O_V, O_BA).into_owned();
        let dv_dbg: Matrix3<f64> = self.jacobian.fixed_view::<3, 3>(O_V, O_BG).into_owned();
        self.delta_v + dv_dba * dba + dv_dbg * dbg
    }

    /// Bias-corrected Δp about bias `b`.
    pub fn delta_position(&self, b: &ImuBias) -> Vector3<f64> {
        let dba = b.accel - self.linearized_bias.accel;
        let dbg = b.gyro - self.linearized_bias.gyro;
        let dp_dba: Matrix3<f64> = self.jacobian.fixed_view::<3, 3>(O_P, O_BA).into_owned();
        let dp_dbg: Matrix3<f64> = self.jacobian.fixed_view::<3, 3>(O_P, O_BG).into_owned();
        self.delta_p + dp_dba * dba + dp_dbg * dbg
    }

    /// Adopt a new bias estimate. Re-integrates the buffered stream when the
    /// drift from the linearization point exceeds the configured threshold.
    pub fn set_new_bias(&mut self, b: ImuBias) {
        self.bias = b;
        let dba = (b.accel - self.linearized_bias.accel).norm();
        let dbg = (b.gyro - self.linearized_bias.gyro).norm();
        if dba > self.relin.accel || dbg > self.relin.gyro {
            self.reintegrate();
        }
    }

    fn reintegrate(&mut self) {
        self.linearized_bias = self.bias;
        self.sum_dt = 0.0;
        self.delta_q = UnitQuaternion::identity();
        self.delta_v = Vector3::zeros();
        self.delta_p = Vector3::zeros();
        self.covariance = Matrix15::zeros();
        self.jacobian = Matrix15::identity();
        self.last_accel = None;
        self.last_gyro = None;
        let samples = std::mem::take(&mut self.samples);
        for &(dt, accel, gyro) in &samples {
            self.propagate(dt, accel, gyro);
        }
        self.samples = samples;
    }

    /// 15-D residual of the preintegrated constraint between body states i
    /// and j, in the order [r_p, r_θ, r_v, r_ba, r_bg].
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        p_i: &Vector3<f64>,
        q_i: &UnitQuaternion<f64>,
        v_i: &Vector3<f64>,
        ba_i: &Vector3<f64>,
        bg_i: &Vector3<f64>,
        p_j: &Vector3<f64>,
        q_j: &UnitQuaternion<f64>,
        v_j: &Vector3<f64>,
        ba_j: &Vector3<f64>,
        bg_j: &Vector3<f64>,
    ) -> Vector15 {
        let dt = self.sum_dt;
        let bias_i = ImuBias {
            accel: *ba_i,
            gyro: *bg_i,
        };
        let corrected_q = self.delta_rotation(&bias_i);
        let corrected_v = self.delta_velocity(&bias_i);
        let corrected_p = self.delta_position(&bias_i);

        let q_i_inv = q_i.inverse();
        let r_p = q_i_inv * (p_j - p_i - v_i * dt - 0.5 * GRAVITY * dt * dt) - corrected_p;
        let r_theta = (corrected_q.inverse() * (q_i_inv * q_j)).scaled_axis();
        let r_v = q_i_inv * (v_j - v_i - GRAVITY * dt) - corrected_v;
        let r_ba = ba_j - ba_i;
        let r_bg = bg_j - bg_i;

        let mut r = Vector15::zeros();
        r.fixed_rows_mut::<3>(O_P).copy_from(&r_p);
        r.fixed_rows_mut::<3>(O_R).copy_from(&r_theta);
        r.fixed_rows_mut::<3>(O_V).copy_from(&r_v);
        r.fixed_rows_mut::<3>(O_BA).copy_from(&r_ba);
        r.fixed_rows_mut::<3>(O_BG).copy_from(&r_bg);
        r
    }

    /// Square-root information of the constraint (upper-triangular factor of
    /// the inverse covariance), regularized for invertibility.
    pub fn sqrt_information(&self) -> Matrix15 {
        let regularized = self.covariance + Matrix15::identity() * 1e-10;
        match regularized.try_inverse() {
            Some(info) => match nalgebra::Cholesky::new(info) {
                Some(chol) => chol.l().transpose(),
                None => Matrix15::identity(),
            },
            None => Matrix15::identity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::sample::ImuNoise;
    use approx::assert_relative_eq;

    fn stationary_preintegration(duration: f64) -> Preintegration {
        // Device at rest: accelerometer reads -g in the body frame.
        let mut preint = Preintegration::new(ImuBias::zero(), ImuCalib::default());
        let dt = 0.005;
        let mut t = 0.0;
        while t < duration {
            preint
                .append(dt, -GRAVITY, Vector3::zeros())
                .unwrap();
            t += dt;
        }
        preint
    }

    #[test]
    fn test_append_rejects_bad_input() {
        let mut preint = Preintegration::new(ImuBias::zero(), ImuCalib::default());
        assert!(preint.append(0.0, Vector3::zeros(), Vector3::zeros()).is_err());
        assert!(preint.append(-0.01, Vector3::zeros(), Vector3::zeros()).is_err());
        assert!(preint
            .append(0.01, Vector3::new(f64::NAN, 0.0, 0.0), Vector3::zeros())
            .is_err());
        assert_eq!(preint.sum_dt, 0.0);
    }

    #[test]
    fn test_stationary_deltas_cancel_gravity() {
        let preint = stationary_preintegration(0.5);
        let dt = preint.sum_dt;
        // Δv integrates -g in the body frame, so prediction with gravity
        // added back yields zero world velocity.
        assert_relative_eq!(
            preint.delta_v + GRAVITY * dt,
            Vector3::zeros(),
            epsilon = 1e-9
        );
        assert_relative_eq!(preint.delta_q.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_evaluate_zero_at_analytic_propagation() {
        let preint = stationary_preintegration(0.4);
        let dt = preint.sum_dt;

        let p_i = Vector3::new(1.0, 2.0, 3.0);
        let q_i = UnitQuaternion::from_euler_angles(0.1, 0.0, 0.2);
        let v_i = Vector3::new(0.2, -0.1, 0.05);

        // Propagate analytically with the standard IMU factor equations.
        let q_j = q_i * preint.delta_q;
        let v_j = v_i + GRAVITY * dt + q_i * preint.delta_v;
        let p_j = p_i + v_i * dt + 0.5 * GRAVITY * dt * dt + q_i * preint.delta_p;

        let zero = Vector3::zeros();
        let r = preint.evaluate(&p_i, &q_i, &v_i, &zero, &zero, &p_j, &q_j, &v_j, &zero, &zero);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_covariance_grows_and_stays_symmetric() {
        let preint = stationary_preintegration(1.0);
        for i in 0..9 {
            assert!(preint.covariance[(i, i)] > 0.0);
        }
        for i in 0..15 {
            for j in 0..15 {
                assert_relative_eq!(
                    preint.covariance[(i, j)],
                    preint.covariance[(j, i)],
                    epsilon = 1e-15
                );
            }
        }
    }

    #[test]
    fn test_small_bias_change_uses_jacobian_correction() {
        let mut preint = stationary_preintegration(0.5);
        let linearized = preint.linearized_bias;
        preint.set_new_bias(ImuBias {
            accel: Vector3::new(1e-3, 0.0, 0.0),
            gyro: Vector3::new(1e-4, 0.0, 0.0),
        });
        // Below threshold: linearization point unchanged.
        assert_eq!(preint.linearized_bias, linearized);

        // Corrected accessors move in the expected direction.
        let corrected = preint.delta_position(&preint.bias);
        assert!((corrected - preint.delta_p).norm() > 0.0);
    }

    #[test]
    fn test_large_bias_change_reintegrates() {
        let mut preint = stationary_preintegration(0.5);
        let big = ImuBias {
            accel: Vector3::new(0.5, 0.0, 0.0),
            gyro: Vector3::zeros(),
        };
        preint.set_new_bias(big);
        assert_eq!(preint.linearized_bias, big);
        // Re-integrated deltas now subtract the bias directly.
        let dt = preint.sum_dt;
        let expected = (-GRAVITY - big.accel) * dt;
        assert_relative_eq!(preint.delta_v, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_noise_scales_covariance() {
        let calib_noisy = ImuCalib {
            tcb: crate::geometry::SE3::identity(),
            noise: ImuNoise {
                sigma_accel: 2.0e-2,
                ..ImuNoise::default()
            },
        };
        let mut quiet = Preintegration::new(ImuBias::zero(), ImuCalib::default());
        let mut noisy = Preintegration::new(ImuBias::zero(), calib_noisy);
        for _ in 0..100 {
            quiet.append(0.005, -GRAVITY, Vector3::zeros()).unwrap();
            noisy.append(0.005, -GRAVITY, Vector3::zeros()).unwrap();
        }
        assert!(noisy.covariance[(O_V, O_V)] > quiet.covariance[(O_V, O_V)]);
    }
}
