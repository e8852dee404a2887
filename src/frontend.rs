//! Frontend: the per-frame tracking state machine.
//!
//! Each stereo frame is tracked against the last one with pyramidal LK flow,
//! its pose refined by EPnP RANSAC against cached landmark world positions,
//! and promoted to a keyframe when too few tracked features survive. The
//! backend refreshes the caches after every optimize cycle, so PnP always
//! sees post-optimization geometry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use anyhow::Result;
use nalgebra::{Vector2, Vector3};
use opencv::core::{Mat, Point2f, Rect, Scalar, Size, TermCriteria, Vector};
use opencv::prelude::*;
use opencv::{imgproc, video};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::camera::Camera;
use crate::config::Config;
use crate::geometry::{solve_pnp_ransac, triangulate, SE3};
use crate::imu::{ImuBias, ImuSample, Preintegration};
use crate::map::{Feature, Frame, FrameTime, LabelType, Landmark, LandmarkId, Map};
use crate::sensors::SensorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendStatus {
    Building,
    Initializing,
    TrackingGood,
    TrackingBad,
    TrackingTry,
    Lost,
}

/// Consecutive low-inlier frames tolerated before declaring a hard loss.
const MAX_TRACKING_TRIES: u32 = 4;

/// State behind the frontend mutex. The backend's forward propagation locks
/// this too, so the frontend only blocks during the short pose-rewrite phase.
pub struct FrontendInner {
    pub status: FrontendStatus,
    pub last_frame: Option<Frame>,
    pub last_keyframe_time: Option<FrameTime>,
    /// Constant-velocity motion model: pose delta between the last two frames.
    pub relative_motion: SE3,
    /// Landmark-id → world position, refreshed after each backend cycle.
    pub position_cache: HashMap<LandmarkId, Vector3<f64>>,
    pub last_frame_pose_cache: SE3,
    /// Keyframes before this time are ignored by the inertial initializer
    /// (set at reset).
    pub valid_time: f64,
    /// Live bias estimate used to seed new preintegrations.
    pub bias: ImuBias,
    num_tries: u32,
    imu_buffer: Vec<ImuSample>,
}

impl FrontendInner {
    fn new() -> Self {
        Self {
            status: FrontendStatus::Building,
            last_frame: None,
            last_keyframe_time: None,
            relative_motion: SE3::identity(),
            position_cache: HashMap::new(),
            last_frame_pose_cache: SE3::identity(),
            valid_time: 0.0,
            bias: ImuBias::zero(),
            num_tries: 0,
            imu_buffer: Vec::new(),
        }
    }
}

pub struct Frontend {
    map: Arc<Mutex<Map>>,
    backend: OnceLock<Weak<Backend>>,
    camera_left: Camera,
    camera_right: Camera,
    registry: Arc<SensorRegistry>,
    config: Config,
    pub(crate) inner: Mutex<FrontendInner>,
    live_frame_id: AtomicU64,
    next_frame_id: AtomicU64,
}

impl Frontend {
    pub fn new(
        map: Arc<Mutex<Map>>,
        camera_left: Camera,
        camera_right: Camera,
        registry: Arc<SensorRegistry>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            map,
            backend: OnceLock::new(),
            camera_left,
            camera_right,
            registry,
            config,
            inner: Mutex::new(FrontendInner::new()),
            live_frame_id: AtomicU64::new(0),
            next_frame_id: AtomicU64::new(1),
        })
    }

    pub fn set_backend(&self, backend: &Arc<Backend>) {
        let _ = self.backend.set(Arc::downgrade(backend));
    }

    fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.get().and_then(Weak::upgrade)
    }

    pub fn status(&self) -> FrontendStatus {
        self.inner.lock().status
    }

    /// Id of the frame currently being processed; the backend's landmark
    /// culling spares landmarks observed by it.
    pub fn live_frame_id(&self) -> u64 {
        self.live_frame_id.load(Ordering::SeqCst)
    }

    /// Buffer one IMU sample; it is folded into the preintegration of the
    /// frame being built once that frame arrives.
    pub fn add_imu(&self, time: f64, accel: Vector3<f64>, gyro: Vector3<f64>) {
        self.inner
            .lock()
            .imu_buffer
            .push(ImuSample { time, accel, gyro });
    }

    /// Process one stereo frame. Returns false when tracking failed on this
    /// frame (transient or hard loss).
    pub fn add_frame(&self, mut frame: Frame) -> Result<bool> {
        // A hard loss resets the whole pipeline before the next frame; the
        // frontend mutex must be free while the backend drains into pause.
        if self.inner.lock().status == FrontendStatus::Lost {
            self.reset(frame.time.0);
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        frame.id = self.next_frame_id.fetch_add(1, Ordering::SeqCst);
        self.live_frame_id.store(frame.id, Ordering::SeqCst);
        self.attach_preintegration(inner, &mut frame);

        let ok = match inner.status {
            FrontendStatus::Building | FrontendStatus::Initializing | FrontendStatus::Lost => {
                inner.status = FrontendStatus::Initializing;
                self.stereo_init(inner, &mut frame)?;
                true
            }
            FrontendStatus::TrackingGood
            | FrontendStatus::TrackingBad
            | FrontendStatus::TrackingTry => {
                let ok = self.track(inner, &mut frame)?;
                if ok && !frame.objects.is_empty() {
                    self.update_labels(&frame);
                }
                ok
            }
        };

        inner.last_frame_pose_cache = frame.pose;
        inner.last_frame = Some(frame);
        Ok(ok)
    }

    /// Build the preintegration covering (last keyframe, this frame] from
    /// buffered samples.
    fn attach_preintegration(&self, inner: &mut FrontendInner, frame: &mut Frame) {
        let Some(calib) = self.registry.imu else {
            return;
        };
        let Some(last_kf) = inner.last_keyframe_time else {
            return;
        };

        let mut preint = Preintegration::new(inner.bias, calib);
        let mut prev_t = last_kf.0;
        let mut used = 0;
        for sample in inner
            .imu_buffer
            .iter()
            .filter(|s| s.time > last_kf.0 && s.time <= frame.time.0)
        {
            match preint.append(sample.time - prev_t, sample.accel, sample.gyro) {
                Ok(()) => used += 1,
                Err(e) => warn!("dropping IMU sample: {e}"),
            }
            prev_t = sample.time;
        }
        if used > 0 {
            frame.preintegration = Some(preint);
            frame.last_keyframe = Some(last_kf);
        }
        // Samples before the last keyframe can never be needed again.
        inner.imu_buffer.retain(|s| s.time > last_kf.0);
    }

    fn track(&self, inner: &mut FrontendInner, frame: &mut Frame) -> Result<bool> {
        frame.pose = inner.relative_motion.compose(&inner.last_frame_pose_cache);
        self.track_last_frame(inner, frame)?;
        self.init_frame_pose_by_pnp(inner, frame)?;
        let inliers = frame.features_left.len();

        let (status, ok) = classify_tracking(inliers, &mut inner.num_tries, &self.config);
        inner.status = status;
        if !ok {
            debug!(inliers, "tracking attempt failed");
            return Ok(false);
        }

        if inliers < self.config.num_features_needed_for_keyframe {
            self.create_keyframe(inner, frame)?;
        }
        inner.relative_motion = frame.pose.compose(&inner.last_frame_pose_cache.inverse());
        Ok(true)
    }

    /// LK flow from the last frame's left features into this frame, seeded
    /// with the projection of the cached landmark positions.
    fn track_last_frame(&self, inner: &FrontendInner, frame: &mut Frame) -> Result<usize> {
        let Some(last) = inner.last_frame.as_ref() else {
            return Ok(0);
        };
        if last.features_left.is_empty() || last.image_left.empty() || frame.image_left.empty() {
            return Ok(0);
        }

        let mut kps_last = Vector::<Point2f>::new();
        let mut kps_current = Vector::<Point2f>::new();
        let mut landmark_ids = Vec::new();
        for feature in last.features_left.values() {
            let Some(&p_world) = inner.position_cache.get(&feature.landmark) else {
                continue;
            };
            let hint = self
                .camera_left
                .world_to_pixel(&p_world, &frame.pose)
                .unwrap_or(feature.keypoint);
            landmark_ids.push(feature.landmark);
            kps_last.push(Point2f::new(
                feature.keypoint.x as f32,
                feature.keypoint.y as f32,
            ));
            kps_current.push(Point2f::new(hint.x as f32, hint.y as f32));
        }
        if kps_last.is_empty() {
            return Ok(0);
        }

        let status = optical_flow(&last.image_left, &frame.image_left, &kps_last, &mut kps_current)?;

        let mut num_good = 0;
        for i in 0..status.len() {
            if status.get(i)? == 0 {
                continue;
            }
            let kp = kps_current.get(i)?;
            frame.add_feature(Feature::new(
                frame.time,
                landmark_ids[i],
                Vector2::new(kp.x as f64, kp.y as f64),
            ));
            num_good += 1;
        }
        debug!(num_good, "tracked features from last frame");
        Ok(num_good)
    }

    /// Refine the predicted pose with EPnP RANSAC over the tracked 3D-2D set.
    fn init_frame_pose_by_pnp(&self, inner: &FrontendInner, frame: &mut Frame) -> Result<bool> {
        let mut pts3d = Vec::new();
        let mut pts2d = Vec::new();
        for feature in frame.features_left.values() {
            if let Some(&p) = inner.position_cache.get(&feature.landmark) {
                pts3d.push(p);
                pts2d.push(Point2f::new(
                    feature.keypoint.x as f32,
                    feature.keypoint.y as f32,
                ));
            }
        }
        match solve_pnp_ransac(&pts3d, &pts2d, &self.camera_left)? {
            Some(pose) => {
                frame.pose = pose;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn create_keyframe(&self, inner: &mut FrontendInner, frame: &mut Frame) -> Result<()> {
        let mut map = self.map.lock();

        // New observations of already-known landmarks first.
        for feature in frame.features_left.values() {
            if let Some(lm) = map.get_landmark_mut(feature.landmark) {
                lm.add_observation(frame.time, true);
            }
        }

        let created = self.detect_new_features(&mut map, inner, frame)?;
        map.insert_key_frame(frame.clone());
        inner.last_keyframe_time = Some(frame.time);
        drop(map);

        info!(id = frame.id, new_landmarks = created.len(), "added keyframe");
        self.notify_backend();
        Ok(())
    }

    /// Shi-Tomasi corners away from existing features, matched into the
    /// right image by LK flow and triangulated against the stereo baseline.
    /// Accepts a landmark only when both forward reprojections close within
    /// half a pixel. Returns the created landmark ids.
    fn detect_new_features(
        &self,
        map: &mut Map,
        inner: &mut FrontendInner,
        frame: &mut Frame,
    ) -> Result<Vec<LandmarkId>> {
        if frame.image_left.empty() || frame.image_right.empty() {
            return Ok(Vec::new());
        }
        let want = self
            .config
            .num_features
            .saturating_sub(frame.features_left.len());
        if want == 0 {
            return Ok(Vec::new());
        }

        // Mask out a 20-px square around every current keypoint.
        let mut mask = Mat::new_rows_cols_with_default(
            frame.image_left.rows(),
            frame.image_left.cols(),
            opencv::core::CV_8UC1,
            Scalar::all(255.0),
        )?;
        for feature in frame.features_left.values() {
            let rect = Rect::new(
                feature.keypoint.x as i32 - 10,
                feature.keypoint.y as i32 - 10,
                20,
                20,
            );
            imgproc::rectangle(&mut mask, rect, Scalar::all(0.0), -1, imgproc::LINE_8, 0)?;
        }

        let mut kps_left = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            &frame.image_left,
            &mut kps_left,
            want as i32,
            0.01,
            30.0,
            &mask,
            3,
            false,
            0.04,
        )?;
        if kps_left.is_empty() {
            return Ok(Vec::new());
        }

        let mut kps_right = kps_left.clone();
        let status = optical_flow(
            &frame.image_left,
            &frame.image_right,
            &kps_left,
            &mut kps_right,
        )?;

        let mut created = Vec::new();
        for i in 0..status.len() {
            if status.get(i)? == 0 {
                continue;
            }
            let kl = kps_left.get(i)?;
            let kr = kps_right.get(i)?;
            let kp_left = Vector2::new(kl.x as f64, kl.y as f64);
            let kp_right = Vector2::new(kr.x as f64, kr.y as f64);

            let Some(p_body) = triangulate(
                &self.camera_left.extrinsic,
                &self.camera_right.extrinsic,
                &self.camera_left.pixel_to_sensor(&kp_left),
                &self.camera_right.pixel_to_sensor(&kp_right),
            ) else {
                continue;
            };
            let (Some(rp_left), Some(rp_right)) = (
                self.camera_left.body_to_pixel(&p_body),
                self.camera_right.body_to_pixel(&p_body),
            ) else {
                continue;
            };
            if (rp_left - kp_left).norm() >= 0.5 || (rp_right - kp_right).norm() >= 0.5 {
                continue;
            }

            let id = map.next_landmark_id();
            let mut landmark = Landmark::new(id, p_body, frame.time);
            landmark.add_observation(frame.time, true);
            landmark.add_observation(frame.time, false);
            frame.add_feature(Feature::new(frame.time, id, kp_left));
            frame.add_feature(Feature::new(frame.time, id, kp_right).on_right());
            map.insert_landmark(landmark);
            inner
                .position_cache
                .insert(id, frame.pose.transform_point(&p_body));
            created.push(id);
        }
        debug!(
            detected = kps_left.len(),
            created = created.len(),
            "stereo feature detection"
        );
        Ok(created)
    }

    /// Bootstrap the map from one stereo pair.
    fn stereo_init(&self, inner: &mut FrontendInner, frame: &mut Frame) -> Result<bool> {
        let mut map = self.map.lock();
        let created = self.detect_new_features(&mut map, inner, frame)?;
        if created.len() < self.config.num_features_init {
            // Not enough parallax-checked landmarks; unwind so the map holds
            // no references to a frame that was never promoted.
            for id in created {
                map.remove_landmark(id);
                inner.position_cache.remove(&id);
                frame.features_left.remove(&id);
                frame.features_right.remove(&id);
            }
            return Ok(false);
        }

        inner.status = FrontendStatus::TrackingGood;
        map.insert_key_frame(frame.clone());
        inner.last_keyframe_time = Some(frame.time);
        drop(map);

        info!(landmarks = frame.features_left.len(), "initial map created");
        self.notify_backend();
        Ok(true)
    }

    /// Hard reset after `Lost`: quiesce the backend, clear the map, resume.
    fn reset(&self, time: f64) {
        info!("resetting after tracking loss");
        if let Some(backend) = self.backend() {
            backend.pause();
        }
        self.map.lock().reset();
        if let Some(backend) = self.backend() {
            backend.continue_();
        }

        let mut inner = self.inner.lock();
        inner.status = FrontendStatus::Initializing;
        inner.last_frame = None;
        inner.last_keyframe_time = None;
        inner.relative_motion = SE3::identity();
        inner.position_cache.clear();
        inner.num_tries = 0;
        inner.valid_time = time;
        inner.imu_buffer.clear();
    }

    /// Push semantic labels from this frame's detections onto its landmarks.
    fn update_labels(&self, frame: &Frame) {
        let mut map = self.map.lock();
        for feature in frame.features_left.values() {
            let label = frame.label_at(feature.keypoint.x, feature.keypoint.y);
            if label == LabelType::None {
                continue;
            }
            if let Some(lm) = map.get_landmark_mut(feature.landmark) {
                lm.label = label;
            }
        }
    }

    /// Refresh the landmark world-position cache and the last-frame pose
    /// from post-optimization map state.
    pub fn update_cache(&self) {
        let mut inner = self.inner.lock();
        self.update_cache_locked(&mut inner);
    }

    pub(crate) fn update_cache_locked(&self, inner: &mut FrontendInner) {
        let map = self.map.lock();
        inner.position_cache.clear();
        let Some(last) = inner.last_frame.as_mut() else {
            return;
        };
        if let Some(kf) = map.get_keyframe(last.time) {
            last.pose = kf.pose;
            last.velocity = kf.velocity;
            last.bias = kf.bias;
        }
        for &lm in last.features_left.keys() {
            if let Some(p) = map.position_world(lm) {
                inner.position_cache.insert(lm, p);
            }
        }
        inner.last_frame_pose_cache = last.pose;
    }

    pub(crate) fn update_frame_imu_locked(&self, inner: &mut FrontendInner, bias: ImuBias) {
        inner.bias = bias;
    }

    fn notify_backend(&self) {
        if let Some(backend) = self.backend() {
            backend.update_map();
        }
    }
}

/// Tracking-state decision from the surviving inlier count. Returns the new
/// status and whether this frame counts as tracked.
fn classify_tracking(
    inliers: usize,
    num_tries: &mut u32,
    config: &Config,
) -> (FrontendStatus, bool) {
    if inliers > config.num_features_tracking {
        *num_tries = 0;
        (FrontendStatus::TrackingGood, true)
    } else if inliers > config.num_features_tracking_bad {
        *num_tries = 0;
        (FrontendStatus::TrackingBad, true)
    } else {
        *num_tries += 1;
        let status = if *num_tries >= MAX_TRACKING_TRIES {
            FrontendStatus::Lost
        } else {
            FrontendStatus::TrackingTry
        };
        *num_tries %= MAX_TRACKING_TRIES;
        (status, false)
    }
}

fn optical_flow(
    prev: &Mat,
    next: &Mat,
    kps_prev: &Vector<Point2f>,
    kps_next: &mut Vector<Point2f>,
) -> Result<Vector<u8>> {
    let mut status = Vector::<u8>::new();
    let mut err = Mat::default();
    video::calc_optical_flow_pyr_lk(
        prev,
        next,
        kps_prev,
        kps_next,
        &mut status,
        &mut err,
        Size::new(11, 11),
        3,
        TermCriteria::new(
            opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
            30,
            0.01,
        )?,
        video::OPTFLOW_USE_INITIAL_FLOW,
        1e-4,
    )?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            num_features_tracking: 50,
            num_features_tracking_bad: 20,
            ..Config::default()
        }
    }

    #[test]
    fn test_classify_good_bad_try() {
        let config = test_config();
        let mut tries = 0;

        let (s, ok) = classify_tracking(100, &mut tries, &config);
        assert_eq!(s, FrontendStatus::TrackingGood);
        assert!(ok);

        let (s, ok) = classify_tracking(30, &mut tries, &config);
        assert_eq!(s, FrontendStatus::TrackingBad);
        assert!(ok);

        let (s, ok) = classify_tracking(5, &mut tries, &config);
        assert_eq!(s, FrontendStatus::TrackingTry);
        assert!(!ok);
    }

    #[test]
    fn test_four_consecutive_tries_become_lost() {
        let config = test_config();
        let mut tries = 0;

        for _ in 0..3 {
            let (s, _) = classify_tracking(0, &mut tries, &config);
            assert_eq!(s, FrontendStatus::TrackingTry);
        }
        let (s, _) = classify_tracking(0, &mut tries, &config);
        assert_eq!(s, FrontendStatus::Lost);
        // Counter wraps so a later recovery starts a fresh budget.
        assert_eq!(tries, 0);
    }

    #[test]
    fn test_recovery_resets_try_counter() {
        let config = test_config();
        let mut tries = 0;

        classify_tracking(0, &mut tries, &config);
        classify_tracking(0, &mut tries, &config);
        let (s, ok) = classify_tracking(100, &mut tries, &config);
        assert_eq!(s, FrontendStatus::TrackingGood);
        assert!(ok);
        assert_eq!(tries, 0);

        // The budget is full again.
        for _ in 0..3 {
            let (s, _) = classify_tracking(0, &mut tries, &config);
            assert_eq!(s, FrontendStatus::TrackingTry);
        }
    }
}
