//! Tightly-coupled stereo visual-inertial odometry core.
//!
//! The crate estimates a 6-DoF trajectory and a sparse landmark map from a
//! synchronized stereo stream and IMU samples:
//!
//! - [`frontend::Frontend`] tracks features frame-to-frame (LK flow + EPnP)
//!   and promotes keyframes into the shared [`map::Map`].
//! - [`backend::Backend`] runs on its own thread, solving a sliding window
//!   of keyframe poses, velocities, and biases, then forward-propagating the
//!   correction so the frontend keeps predicting against fresh geometry.
//! - [`imu::Initializer`] bootstraps gravity, biases, and velocities on a
//!   staged schedule; until it succeeds the backend solves vision-only.
//!
//! LiDAR mapping, GNSS alignment, and loop closure are collaborators behind
//! the narrow traits in [`sensors`].

pub mod backend;
pub mod camera;
pub mod config;
pub mod frontend;
pub mod geometry;
pub mod imu;
pub mod map;
pub mod optimize;
pub mod pose_graph;
pub mod sensors;
pub mod system;

pub use backend::{Backend, BackendStatus};
pub use camera::Camera;
pub use config::Config;
pub use frontend::{Frontend, FrontendStatus};
pub use system::Odometry;

use thiserror::Error;

/// Errors surfaced by the core's typed interfaces.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}
