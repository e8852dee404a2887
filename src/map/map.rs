//! The map: ordered keyframes plus the landmark arena.
//!
//! Frames and landmarks are owned here; every cross-reference between them
//! is an id or a timestamp, never a pointer, so removal only has to detach
//! table entries. The whole struct is shared as `Arc<Mutex<Map>>`; callers
//! keep critical sections short by working on `get_keyframes` snapshots.

use std::collections::BTreeMap;
use std::ops::Bound;

use nalgebra::Vector3;

use super::{Frame, FrameTime, Landmark, LandmarkId};

/// Ordered keyframe snapshot, keyed by time.
pub type Frames = BTreeMap<FrameTime, Frame>;

#[derive(Default)]
pub struct Map {
    keyframes: Frames,
    landmarks: std::collections::HashMap<LandmarkId, Landmark>,
    next_landmark_id: u64,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_landmark_id(&mut self) -> LandmarkId {
        let id = LandmarkId(self.next_landmark_id);
        self.next_landmark_id += 1;
        id
    }

    /// Promote a frame to keyframe. All landmarks referenced by its features
    /// must already be inserted (triangulation inserts them first).
    pub fn insert_key_frame(&mut self, frame: Frame) {
        if let Some((&last, _)) = self.keyframes.iter().next_back() {
            debug_assert!(frame.time > last, "keyframe times must increase");
        }
        debug_assert!(
            frame
                .features_left
                .keys()
                .chain(frame.features_right.keys())
                .all(|id| self.landmarks.contains_key(id)),
            "keyframe references an unknown landmark"
        );
        self.keyframes.insert(frame.time, frame);
    }

    pub fn insert_landmark(&mut self, landmark: Landmark) {
        self.landmarks.insert(landmark.id, landmark);
    }

    /// Remove a landmark, detaching every observing feature first.
    pub fn remove_landmark(&mut self, id: LandmarkId) {
        if let Some(lm) = self.landmarks.remove(&id) {
            for (&time, _) in &lm.observations {
                if let Some(frame) = self.keyframes.get_mut(&time) {
                    frame.features_left.remove(&id);
                    frame.features_right.remove(&id);
                }
            }
        }
    }

    /// Detach one left-image feature from a keyframe and its landmark.
    pub fn remove_feature(&mut self, time: FrameTime, landmark: LandmarkId) {
        if let Some(frame) = self.keyframes.get_mut(&time) {
            frame.remove_feature(landmark);
        }
        if let Some(lm) = self.landmarks.get_mut(&landmark) {
            lm.remove_observation(time, true);
        }
    }

    /// Snapshot of keyframes with `time >= start`, images stripped.
    pub fn get_keyframes(&self, start: FrameTime) -> Frames {
        self.keyframes
            .range((Bound::Included(start), Bound::Unbounded))
            .map(|(&t, f)| (t, f.snapshot()))
            .collect()
    }

    /// Snapshot of the half-open range `[start, end)`.
    pub fn get_keyframes_in(&self, start: FrameTime, end: FrameTime) -> Frames {
        self.keyframes
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(&t, f)| (t, f.snapshot()))
            .collect()
    }

    /// The earliest `max_count` keyframes inside `[start, end)`.
    pub fn get_keyframes_limited(
        &self,
        start: FrameTime,
        end: FrameTime,
        max_count: usize,
    ) -> Frames {
        self.keyframes
            .range((Bound::Included(start), Bound::Excluded(end)))
            .take(max_count)
            .map(|(&t, f)| (t, f.snapshot()))
            .collect()
    }

    pub fn get_keyframe(&self, time: FrameTime) -> Option<&Frame> {
        self.keyframes.get(&time)
    }

    pub fn get_keyframe_mut(&mut self, time: FrameTime) -> Option<&mut Frame> {
        self.keyframes.get_mut(&time)
    }

    pub fn last_keyframe_time(&self) -> Option<FrameTime> {
        self.keyframes.keys().next_back().copied()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn get_landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    pub fn get_landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    /// World position of a landmark: its reference frame's pose applied to
    /// the stored camera-frame position. None once the reference frame is
    /// unknown (e.g. not yet promoted).
    pub fn position_world(&self, id: LandmarkId) -> Option<Vector3<f64>> {
        let lm = self.landmarks.get(&id)?;
        let frame = self.keyframes.get(&lm.reference_frame)?;
        Some(frame.pose.transform_point(&lm.position))
    }

    /// Drop all state; used after a hard tracking loss.
    pub fn reset(&mut self) {
        self.keyframes.clear();
        self.landmarks.clear();
        self.next_landmark_id = 0;
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_landmarks", &self.landmarks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Feature;
    use nalgebra::Vector2;

    fn keyframe_with_landmark(map: &mut Map, id: u64, time: f64) -> LandmarkId {
        let mut frame = Frame::new(id, time);
        let lm_id = map.next_landmark_id();
        let mut lm = Landmark::new(lm_id, Vector3::new(0.0, 0.0, 5.0), frame.time);
        lm.add_observation(frame.time, true);
        frame.add_feature(Feature::new(frame.time, lm_id, Vector2::new(10.0, 20.0)));
        map.insert_landmark(lm);
        map.insert_key_frame(frame);
        lm_id
    }

    #[test]
    fn test_keyframes_ordered_by_time() {
        let mut map = Map::new();
        keyframe_with_landmark(&mut map, 1, 1.0);
        keyframe_with_landmark(&mut map, 2, 2.0);
        keyframe_with_landmark(&mut map, 3, 3.5);

        let times: Vec<f64> = map
            .get_keyframes(FrameTime(0.0))
            .keys()
            .map(|t| t.0)
            .collect();
        assert_eq!(times, vec![1.0, 2.0, 3.5]);
    }

    #[test]
    fn test_get_keyframes_half_open_range() {
        let mut map = Map::new();
        for (i, t) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            keyframe_with_landmark(&mut map, i as u64, *t);
        }
        let range = map.get_keyframes_in(FrameTime(2.0), FrameTime(4.0));
        let times: Vec<f64> = range.keys().map(|t| t.0).collect();
        assert_eq!(times, vec![2.0, 3.0]);

        let limited = map.get_keyframes_limited(FrameTime(0.0), FrameTime(10.0), 2);
        let times: Vec<f64> = limited.keys().map(|t| t.0).collect();
        assert_eq!(times, vec![1.0, 2.0]);
    }

    #[test]
    fn test_remove_landmark_detaches_features() {
        let mut map = Map::new();
        let lm_id = keyframe_with_landmark(&mut map, 1, 1.0);

        // A second keyframe also observes it.
        let mut frame2 = Frame::new(2, 2.0);
        frame2.add_feature(Feature::new(frame2.time, lm_id, Vector2::new(12.0, 21.0)));
        map.get_landmark_mut(lm_id)
            .unwrap()
            .add_observation(frame2.time, true);
        map.insert_key_frame(frame2);

        map.remove_landmark(lm_id);
        assert_eq!(map.num_landmarks(), 0);
        for frame in map.get_keyframes(FrameTime(0.0)).values() {
            assert!(!frame.features_left.contains_key(&lm_id));
        }
    }

    #[test]
    fn test_remove_feature_keeps_both_sides_consistent() {
        let mut map = Map::new();
        let lm_id = keyframe_with_landmark(&mut map, 1, 1.0);
        map.remove_feature(FrameTime(1.0), lm_id);

        assert!(map
            .get_keyframe(FrameTime(1.0))
            .unwrap()
            .features_left
            .is_empty());
        assert!(map.get_landmark(lm_id).unwrap().observations.is_empty());
    }

    #[test]
    fn test_position_world_composes_reference_pose() {
        let mut map = Map::new();
        let lm_id = keyframe_with_landmark(&mut map, 1, 1.0);
        map.get_keyframe_mut(FrameTime(1.0)).unwrap().pose =
            crate::geometry::SE3::new(
                nalgebra::UnitQuaternion::identity(),
                Vector3::new(1.0, 0.0, 0.0),
            );
        let p = map.position_world(lm_id).unwrap();
        assert_eq!(p, Vector3::new(1.0, 0.0, 5.0));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut map = Map::new();
        keyframe_with_landmark(&mut map, 1, 1.0);
        map.reset();
        assert_eq!(map.num_keyframes(), 0);
        assert_eq!(map.num_landmarks(), 0);
    }
}
