//! Triangulated 3D landmarks and their observation lists.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use super::FrameTime;

/// Semantic tag carried by a landmark when object detections are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelType {
    #[default]
    None,
    Car,
    Person,
    Truck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LandmarkId(pub u64);

/// Which image(s) of a frame observe a landmark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    pub left: bool,
    pub right: bool,
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        !self.left && !self.right
    }

    pub fn count(&self) -> usize {
        usize::from(self.left) + usize::from(self.right)
    }
}

/// A 3D point expressed in the camera coordinates of its reference frame
/// (the frame in which it was first triangulated).
#[derive(Debug, Clone)]
pub struct Landmark {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
    pub reference_frame: FrameTime,
    /// Observing frames ordered by time; back-references only, the features
    /// themselves live in the frames' tables.
    pub observations: BTreeMap<FrameTime, Observation>,
    pub label: LabelType,
}

impl Landmark {
    pub fn new(id: LandmarkId, position: Vector3<f64>, reference_frame: FrameTime) -> Self {
        Self {
            id,
            position,
            reference_frame,
            observations: BTreeMap::new(),
            label: LabelType::None,
        }
    }

    pub fn add_observation(&mut self, time: FrameTime, on_left: bool) {
        let obs = self.observations.entry(time).or_default();
        if on_left {
            obs.left = true;
        } else {
            obs.right = true;
        }
    }

    pub fn remove_observation(&mut self, time: FrameTime, on_left: bool) {
        if let Some(obs) = self.observations.get_mut(&time) {
            if on_left {
                obs.left = false;
            } else {
                obs.right = false;
            }
            if obs.is_empty() {
                self.observations.remove(&time);
            }
        }
    }

    /// Earliest observing frame; equals `reference_frame` while that frame
    /// still observes the landmark.
    pub fn first_frame(&self) -> Option<FrameTime> {
        self.observations.keys().next().copied()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.values().map(Observation::count).sum()
    }
}
