//! Sensor registry and collaborator interfaces.
//!
//! The core consults this registry instead of global sensor state; drivers
//! construct it once and hand it to the frontend and backend. LiDAR mapping
//! and GNSS alignment are opaque collaborators behind narrow traits.

use std::sync::Arc;

use crate::imu::ImuCalib;
use crate::map::{Frame, FrameTime, Frames};

/// LiDAR mapping subsystem: may refine keyframe poses inside the window and
/// re-express frames once a global alignment is known.
pub trait LidarMapping: Send + Sync {
    fn optimize(&self, active_kfs: &mut Frames);
    fn to_world(&self, frame: &mut Frame);
}

/// GNSS alignment subsystem.
pub trait Navsat: Send + Sync {
    fn initialized(&self) -> bool;
    /// Optimize against raw fixes up to `latest`; returns the start of the
    /// keyframe prefix that should be re-expressed in the world frame.
    fn optimize(&self, latest: FrameTime) -> Option<FrameTime>;
}

/// Which sensors exist in this session, and their calibration.
#[derive(Default)]
pub struct SensorRegistry {
    pub imu: Option<ImuCalib>,
    pub lidar: Option<Arc<dyn LidarMapping>>,
    pub navsat: Option<Arc<dyn Navsat>>,
}

impl SensorRegistry {
    /// Stereo cameras only.
    pub fn vision_only() -> Self {
        Self::default()
    }

    pub fn with_imu(imu: ImuCalib) -> Self {
        Self {
            imu: Some(imu),
            ..Default::default()
        }
    }

    pub fn has_imu(&self) -> bool {
        self.imu.is_some()
    }
}
