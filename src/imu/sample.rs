//! IMU measurement, bias, noise, and calibration types.

use nalgebra::Vector3;
use serde::Deserialize;

use crate::geometry::SE3;

/// Gravity in the world frame (m/s²), z-up.
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// A single raw IMU sample.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub time: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

/// Accelerometer and gyroscope biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Continuous-time noise densities (1-sigma).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ImuNoise {
    /// Accelerometer measurement noise (m/s²/√Hz).
    pub sigma_accel: f64,
    /// Gyroscope measurement noise (rad/s/√Hz).
    pub sigma_gyro: f64,
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub sigma_accel_walk: f64,
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub sigma_gyro_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        // MEMS-grade values, EuRoC ballpark.
        Self {
            sigma_accel: 2.0e-3,
            sigma_gyro: 1.7e-4,
            sigma_accel_walk: 3.0e-3,
            sigma_gyro_walk: 1.9e-5,
        }
    }
}

/// Camera-to-IMU calibration, constant for a session.
#[derive(Debug, Clone, Copy)]
pub struct ImuCalib {
    /// Camera-to-body extrinsic T_cb.
    pub tcb: SE3,
    pub noise: ImuNoise,
}

impl Default for ImuCalib {
    fn default() -> Self {
        Self {
            tcb: SE3::identity(),
            noise: ImuNoise::default(),
        }
    }
}
