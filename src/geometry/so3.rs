//! SO(3) tangent-space helpers used by preintegration and the IMU factors.

use nalgebra::{Matrix3, Vector3};

const SMALL_ANGLE: f64 = 1e-6;

/// Skew-symmetric matrix [v]× with [v]× u = v × u.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Right Jacobian Jr(φ) of SO(3).
///
/// Relates additive perturbations of the rotation vector to multiplicative
/// perturbations of the exponential: Exp(φ + δ) ≈ Exp(φ) Exp(Jr(φ) δ).
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let s = skew(phi);
    let s2 = s * s;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * s
        + ((theta - theta.sin()) / (theta_sq * theta)) * s2
}

/// Inverse of the right Jacobian Jr⁻¹(φ).
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * s + (1.0 / 12.0) * s * s;
    }

    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * s + coeff * (s * s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_matches_cross_product() {
        let v = Vector3::new(0.5, -1.0, 2.0);
        let u = Vector3::new(3.0, 0.2, -0.7);
        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_at_zero() {
        let jr = right_jacobian(&Vector3::zeros());
        assert_relative_eq!(jr, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_times_inverse() {
        let phi = Vector3::new(0.2, -0.1, 0.4);
        let prod = right_jacobian(&phi) * right_jacobian_inv(&phi);
        assert_relative_eq!(prod, Matrix3::identity(), epsilon = 1e-10);
    }
}
