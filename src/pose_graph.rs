//! Pose-graph propagation: the loop-closure collaborator's core-facing hook.

use crate::geometry::SE3;
use crate::map::Frames;

pub struct PoseGraph;

impl PoseGraph {
    /// Apply a world-frame correction to every pose in `frames`
    /// (left-multiplication).
    pub fn propagate(transform: &SE3, frames: &mut Frames) {
        for frame in frames.values_mut() {
            frame.pose = transform.compose(&frame.pose);
        }
    }
}
