//! Assembly of the odometry core: map, frontend, backend, and their wiring.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::camera::Camera;
use crate::config::Config;
use crate::frontend::{Frontend, FrontendStatus};
use crate::map::{Frame, Map};
use crate::sensors::SensorRegistry;

/// The running system. Construct once, feed frames and IMU samples from the
/// driver thread; the backend worker runs until `shutdown`.
pub struct Odometry {
    pub map: Arc<Mutex<Map>>,
    pub frontend: Arc<Frontend>,
    pub backend: Arc<Backend>,
}

impl Odometry {
    pub fn new(
        camera_left: Camera,
        camera_right: Camera,
        registry: SensorRegistry,
        config: Config,
    ) -> Result<Self> {
        let map = Arc::new(Mutex::new(Map::new()));
        let registry = Arc::new(registry);

        let frontend = Frontend::new(
            Arc::clone(&map),
            camera_left.clone(),
            camera_right,
            Arc::clone(&registry),
            config.clone(),
        );
        let backend = Backend::new(
            Arc::clone(&map),
            camera_left,
            Arc::clone(&registry),
            config,
        );
        frontend.set_backend(&backend);
        backend.set_frontend(&frontend);
        backend.spawn()?;

        Ok(Self {
            map,
            frontend,
            backend,
        })
    }

    /// Feed one stereo frame; returns false on a tracking failure.
    pub fn add_frame(&self, frame: Frame) -> Result<bool> {
        self.frontend.add_frame(frame)
    }

    /// Feed one IMU sample.
    pub fn add_imu(&self, time: f64, accel: nalgebra::Vector3<f64>, gyro: nalgebra::Vector3<f64>) {
        self.frontend.add_imu(time, accel, gyro);
    }

    pub fn status(&self) -> FrontendStatus {
        self.frontend.status()
    }

    /// Stop the backend worker.
    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;

    fn test_system() -> Odometry {
        let left = Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity());
        let right = Camera::new(
            400.0,
            400.0,
            320.0,
            240.0,
            SE3::new(
                nalgebra::UnitQuaternion::identity(),
                nalgebra::Vector3::new(-0.1, 0.0, 0.0),
            ),
        );
        Odometry::new(left, right, SensorRegistry::vision_only(), Config::default()).unwrap()
    }

    #[test]
    fn test_imageless_frame_keeps_initializing() {
        let system = test_system();
        // No image content: stereo bootstrap cannot find features, so the
        // frontend stays in Initializing without touching the map.
        system.add_frame(Frame::new(0, 0.0)).unwrap();
        assert_eq!(system.status(), FrontendStatus::Initializing);
        assert_eq!(system.map.lock().num_keyframes(), 0);
        system.shutdown();
    }

    #[test]
    fn test_imu_samples_buffer_without_keyframe() {
        let system = test_system();
        system.add_imu(0.0, nalgebra::Vector3::new(0.0, 0.0, 9.81), nalgebra::Vector3::zeros());
        system.add_imu(0.01, nalgebra::Vector3::new(0.0, 0.0, 9.81), nalgebra::Vector3::zeros());
        // Vision-only registry: nothing attaches, nothing crashes.
        system.add_frame(Frame::new(0, 0.02)).unwrap();
        system.shutdown();
    }
}
