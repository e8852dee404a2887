//! Pinhole camera model with a fixed extrinsic.
//!
//! `extrinsic` maps points from the body frame (the left camera at identity)
//! into this camera's own frame, so the right camera carries the stereo
//! baseline. A frame's `pose` is the body's T_wc; projecting a world point
//! into an image therefore chains `pose⁻¹` and `extrinsic`.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::Deserialize;

use crate::geometry::SE3;

#[derive(Debug, Clone, Deserialize)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Body-to-camera transform.
    #[serde(skip, default = "SE3::identity")]
    pub extrinsic: SE3,
}

impl Camera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, extrinsic: SE3) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            extrinsic,
        }
    }

    /// Intrinsic matrix K.
    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Back-project a pixel to a unit-depth ray in the sensor frame.
    pub fn pixel_to_sensor(&self, px: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new((px.x - self.cx) / self.fx, (px.y - self.cy) / self.fy, 1.0)
    }

    /// Project a sensor-frame point; returns None behind the camera.
    pub fn sensor_to_pixel(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 1e-9 {
            return None;
        }
        Some(Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Project a body-frame point through the extrinsic.
    pub fn body_to_pixel(&self, p_body: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.sensor_to_pixel(&self.extrinsic.transform_point(p_body))
    }

    /// Project a world point given the body pose T_wc.
    pub fn world_to_pixel(&self, p_world: &Vector3<f64>, pose: &SE3) -> Option<Vector2<f64>> {
        self.body_to_pixel(&pose.inverse().transform_point(p_world))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> Camera {
        Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity())
    }

    #[test]
    fn test_project_backproject() {
        let cam = test_camera();
        let px = Vector2::new(350.0, 200.0);
        let ray = cam.pixel_to_sensor(&px);
        let back = cam.sensor_to_pixel(&(ray * 4.2)).unwrap();
        assert_relative_eq!(back, px, epsilon = 1e-10);
    }

    #[test]
    fn test_point_behind_camera_rejected() {
        let cam = test_camera();
        assert!(cam.sensor_to_pixel(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_world_to_pixel_uses_pose() {
        let cam = test_camera();
        let pose = SE3::new(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(0.0, 0.0, -1.0),
        );
        // World point at z=1 lands at z=2 in the camera.
        let px = cam
            .world_to_pixel(&Vector3::new(0.2, 0.0, 1.0), &pose)
            .unwrap();
        assert_relative_eq!(px.x, 320.0 + 400.0 * 0.1, epsilon = 1e-10);
        assert_relative_eq!(px.y, 240.0, epsilon = 1e-10);
    }
}
