//! Frames: one stereo capture with pose, velocity, bias, and features.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector3};
use opencv::core::Mat;

use crate::geometry::SE3;
use crate::imu::{ImuBias, Preintegration};

use super::{Feature, LabelType, LandmarkId};

/// Monotonic session time in seconds, totally ordered so it can key the
/// map's keyframe table.
#[derive(Debug, Clone, Copy)]
pub struct FrameTime(pub f64);

impl FrameTime {
    pub fn seconds(self) -> f64 {
        self.0
    }
}

impl PartialEq for FrameTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for FrameTime {}

impl PartialOrd for FrameTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Axis-aligned semantic detection box in image coordinates.
#[derive(Debug, Clone, Copy)]
pub struct DetectedObject {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub label: LabelType,
}

/// Residual weights a collaborator may supply; identity by default.
#[derive(Debug, Clone, Copy)]
pub struct FrameWeights {
    pub visual: f64,
}

impl Default for FrameWeights {
    fn default() -> Self {
        Self { visual: 1.0 }
    }
}

/// One stereo capture. Created by the frontend, promoted into the map at
/// keyframe time; the map copy then owns the canonical state.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub time: FrameTime,
    /// Body pose T_wc (left camera in world).
    pub pose: SE3,
    /// World-frame velocity; meaningful only once the IMU is initialized and
    /// the frame carries preintegration.
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    pub image_left: Mat,
    pub image_right: Mat,
    /// At most one feature per landmark per side.
    pub features_left: HashMap<LandmarkId, Feature>,
    pub features_right: HashMap<LandmarkId, Feature>,
    /// Present iff IMU samples exist between this frame and the previous
    /// keyframe.
    pub preintegration: Option<Preintegration>,
    /// Immediately preceding keyframe (non-owning back-reference).
    pub last_keyframe: Option<FrameTime>,
    /// Whether this frame participates in IMU residuals.
    pub b_imu: bool,
    pub objects: Vec<DetectedObject>,
    pub weights: FrameWeights,
}

impl Frame {
    pub fn new(id: u64, time: f64) -> Self {
        Self {
            id,
            time: FrameTime(time),
            pose: SE3::identity(),
            velocity: Vector3::zeros(),
            bias: ImuBias::zero(),
            image_left: Mat::default(),
            image_right: Mat::default(),
            features_left: HashMap::new(),
            features_right: HashMap::new(),
            preintegration: None,
            last_keyframe: None,
            b_imu: false,
            objects: Vec::new(),
            weights: FrameWeights::default(),
        }
    }

    pub fn add_feature(&mut self, feature: Feature) {
        debug_assert_eq!(feature.frame_time, self.time);
        if feature.is_on_left_image {
            self.features_left.insert(feature.landmark, feature);
        } else {
            self.features_right.insert(feature.landmark, feature);
        }
    }

    /// Detach a left-image feature; the caller keeps the landmark's
    /// observation list in sync.
    pub fn remove_feature(&mut self, landmark: LandmarkId) {
        self.features_left.remove(&landmark);
    }

    /// Copy for optimizer snapshots: full state, images left behind.
    pub fn snapshot(&self) -> Frame {
        Frame {
            image_left: Mat::default(),
            image_right: Mat::default(),
            ..self.clone()
        }
    }

    /// Label of the detection box covering (x, y), if any.
    pub fn label_at(&self, x: f64, y: f64) -> LabelType {
        for obj in &self.objects {
            if obj.xmin < x && x < obj.xmax && obj.ymin < y && y < obj.ymax {
                return obj.label;
            }
        }
        LabelType::None
    }

    pub fn set_new_bias(&mut self, bias: ImuBias) {
        self.bias = bias;
        if let Some(preint) = &mut self.preintegration {
            preint.set_new_bias(bias);
        }
    }

    /// World rotation of the IMU body, through the camera-to-IMU extrinsic.
    pub fn imu_rotation(&self) -> Option<Matrix3<f64>> {
        let preint = self.preintegration.as_ref()?;
        Some(self.pose.rotation_matrix() * preint.calib.tcb.rotation_matrix())
    }

    /// World position of the IMU body.
    pub fn imu_position(&self) -> Option<Vector3<f64>> {
        let preint = self.preintegration.as_ref()?;
        Some(self.pose.transform_point(&preint.calib.tcb.translation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    #[test]
    fn test_one_feature_per_landmark_per_side() {
        let mut frame = Frame::new(1, 10.0);
        let lm = LandmarkId(7);
        frame.add_feature(Feature::new(frame.time, lm, Vector2::new(1.0, 2.0)));
        frame.add_feature(Feature::new(frame.time, lm, Vector2::new(3.0, 4.0)));
        assert_eq!(frame.features_left.len(), 1);
        assert_eq!(frame.features_left[&lm].keypoint, Vector2::new(3.0, 4.0));

        frame.add_feature(Feature::new(frame.time, lm, Vector2::new(5.0, 6.0)).on_right());
        assert_eq!(frame.features_right.len(), 1);
    }

    #[test]
    fn test_label_at_box_lookup() {
        let mut frame = Frame::new(1, 0.0);
        frame.objects.push(DetectedObject {
            xmin: 10.0,
            ymin: 10.0,
            xmax: 20.0,
            ymax: 20.0,
            label: LabelType::Car,
        });
        assert_eq!(frame.label_at(15.0, 15.0), LabelType::Car);
        assert_eq!(frame.label_at(5.0, 15.0), LabelType::None);
    }

    #[test]
    fn test_frame_time_total_order() {
        assert!(FrameTime(1.0) < FrameTime(2.0));
        assert_eq!(FrameTime(1.5), FrameTime(1.5));
    }
}
