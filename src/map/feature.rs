//! A single 2D observation of a landmark in one image of one frame.

use nalgebra::Vector2;

use super::{FrameTime, LandmarkId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    /// Owning frame (non-owning back-reference by time).
    pub frame_time: FrameTime,
    /// Observed landmark (non-owning back-reference by id).
    pub landmark: LandmarkId,
    /// Pixel coordinates.
    pub keypoint: Vector2<f64>,
    pub is_on_left_image: bool,
}

impl Feature {
    pub fn new(frame_time: FrameTime, landmark: LandmarkId, keypoint: Vector2<f64>) -> Self {
        Self {
            frame_time,
            landmark,
            keypoint,
            is_on_left_image: true,
        }
    }

    pub fn on_right(mut self) -> Self {
        self.is_on_left_image = false;
        self
    }
}
