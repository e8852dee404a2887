//! SE(3) rigid transforms.
//!
//! Poses are stored as a unit quaternion plus a translation. Throughout the
//! crate a frame's `pose` is T_wc: it maps points from the left-camera frame
//! into the world frame. The parameter layout used by the optimizer is
//! `[qx, qy, qz, qw, tx, ty, tz]` (quaternion first, Hamilton convention).

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Rigid transform in SE(3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let q = UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(
            rotation,
        ));
        Self {
            rotation: q,
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Composition: `self ∘ other` (apply `other` first).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Serialize to the 7-element optimizer layout `[qx, qy, qz, qw, t]`.
    pub fn to_params(&self) -> [f64; 7] {
        let q = self.rotation.quaternion();
        [
            q.i,
            q.j,
            q.k,
            q.w,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Rebuild from the 7-element optimizer layout. The quaternion is
    /// renormalized since solver steps leave the manifold slightly.
    pub fn from_params(p: &[f64]) -> Self {
        debug_assert!(p.len() >= 7);
        let q = UnitQuaternion::from_quaternion(Quaternion::new(p[3], p[0], p[1], p[2]));
        Self {
            rotation: q,
            translation: Vector3::new(p[4], p[5], p[6]),
        }
    }
}

/// Decompose a rotation matrix into yaw-pitch-roll (Z-Y-X order, degrees).
pub fn rotation_to_ypr(r: &Matrix3<f64>) -> Vector3<f64> {
    let n = r.column(0);
    let o = r.column(1);
    let a = r.column(2);

    let yaw = n[1].atan2(n[0]);
    let pitch = (-n[2]).atan2(n[0] * yaw.cos() + n[1] * yaw.sin());
    let roll = (a[0] * yaw.sin() - a[1] * yaw.cos())
        .atan2(-o[0] * yaw.sin() + o[1] * yaw.cos());

    Vector3::new(yaw, pitch, roll) * (180.0 / std::f64::consts::PI)
}

/// Compose a rotation matrix from yaw-pitch-roll (degrees).
pub fn ypr_to_rotation(ypr: &Vector3<f64>) -> Matrix3<f64> {
    let y = ypr.x.to_radians();
    let p = ypr.y.to_radians();
    let r = ypr.z.to_radians();

    let rz = Matrix3::new(
        y.cos(), -y.sin(), 0.0,
        y.sin(), y.cos(), 0.0,
        0.0, 0.0, 1.0,
    );
    let ry = Matrix3::new(
        p.cos(), 0.0, p.sin(),
        0.0, 1.0, 0.0,
        -p.sin(), 0.0, p.cos(),
    );
    let rx = Matrix3::new(
        1.0, 0.0, 0.0,
        0.0, r.cos(), -r.sin(),
        0.0, r.sin(), r.cos(),
    );

    rz * ry * rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_inverse_roundtrip() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, 2.0, -3.0),
        );
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_point_matches_compose() {
        let a = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let p = Vector3::new(0.3, -0.4, 2.0);
        let via_compose = a.compose(&b).transform_point(&p);
        let via_chain = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(via_compose, via_chain, epsilon = 1e-12);
    }

    #[test]
    fn test_params_roundtrip() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(-0.3, 0.1, 0.7),
            Vector3::new(0.5, -1.5, 2.5),
        );
        let p = t.to_params();
        let back = SE3::from_params(&p);
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-12);
        assert_relative_eq!(
            back.rotation.angle_to(&t.rotation),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_ypr_roundtrip() {
        let ypr = Vector3::new(30.0, 10.0, -20.0);
        let r = ypr_to_rotation(&ypr);
        let back = rotation_to_ypr(&r);
        assert_relative_eq!(back, ypr, epsilon = 1e-9);
    }

    #[test]
    fn test_yaw_only_rotation_preserves_z() {
        let r = ypr_to_rotation(&Vector3::new(45.0, 0.0, 0.0));
        let z = Vector3::new(0.0, 0.0, 1.0);
        assert_relative_eq!(r * z, z, epsilon = 1e-12);
    }
}
