//! Runtime configuration for the odometry core.

use serde::Deserialize;

/// Tunables for the frontend, backend, and initializer. Deserializable so a
/// driver can load it from YAML/JSON alongside calibration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target feature count per keyframe.
    pub num_features: usize,
    /// Minimum stereo landmarks to bootstrap the map.
    pub num_features_init: usize,
    /// Inlier count above which tracking is good.
    pub num_features_tracking: usize,
    /// Inlier count above which tracking is merely bad (below is a try).
    pub num_features_tracking_bad: usize,
    /// Inlier count below which the current frame becomes a keyframe.
    pub num_features_needed_for_keyframe: usize,
    /// Backend sliding-window length in seconds.
    pub window_size: f64,
    /// Enables adaptive residual weighting when a collaborator supplies
    /// weights; identity otherwise.
    pub update_weights: bool,
    /// Solver parallelism handed to collaborators.
    pub num_threads: usize,
    /// Keyframes consumed by one inertial initialization attempt.
    pub init_num_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_features: 150,
            num_features_init: 50,
            num_features_tracking: 50,
            num_features_tracking_bad: 20,
            num_features_needed_for_keyframe: 80,
            window_size: 3.0,
            update_weights: false,
            num_threads: 4,
            init_num_frames: 10,
        }
    }
}
