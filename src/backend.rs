//! Backend: background sliding-window optimization.
//!
//! A dedicated worker waits on the map-update signal, snapshots the active
//! window, solves visual (+ IMU, once initialized) residuals lock-free, then
//! commits results, purges outliers, and forward-propagates the correction to
//! keyframes past the window so the frontend keeps predicting against
//! consistent geometry. The pause/resume handshake lets the frontend quiesce
//! the worker before a hard reset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use nalgebra::{Vector2, Vector3};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::camera::Camera;
use crate::config::Config;
use crate::frontend::{Frontend, FrontendStatus};
use crate::geometry::{rotation_to_ypr, ypr_to_rotation, SE3};
use crate::imu::{ImuBias, Initializer, GRAVITY};
use crate::map::{Frame, FrameTime, Frames, LandmarkId, Map, TIME_EPSILON};
use crate::optimize::{
    ImuError, Loss, Manifold, PoseOnlyReprojectionError, Problem, SolverOptions,
    TwoFrameReprojectionError,
};
use crate::pose_graph::PoseGraph;
use crate::sensors::SensorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Running,
    ToPause,
    Pausing,
}

struct ControlState {
    status: BackendStatus,
    pending_update: bool,
    shutdown: bool,
}

/// State owned by the optimize cycle (the "backend mutex").
struct CycleState {
    /// All keyframes at or before this time are committed.
    finished: f64,
    initializer: Initializer,
    /// Timestamp of the last keyframe at the last successful initializer
    /// run, or -1.
    t_init: f64,
    init_a: bool,
    init_b: bool,
}

/// Parameter-block keys for window problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Param {
    Pose(u64),
    Velocity(u64),
    BiasAccel(u64),
    BiasGyro(u64),
}

fn pose_key(t: FrameTime) -> Param {
    Param::Pose(t.0.to_bits())
}

fn vel_key(t: FrameTime) -> Param {
    Param::Velocity(t.0.to_bits())
}

fn ba_key(t: FrameTime) -> Param {
    Param::BiasAccel(t.0.to_bits())
}

fn bg_key(t: FrameTime) -> Param {
    Param::BiasGyro(t.0.to_bits())
}

/// Landmark state captured under the map lock so problems build lock-free.
struct LandmarkContext {
    reference_frame: FrameTime,
    position: Vector3<f64>,
    position_world: Vector3<f64>,
}

pub struct Backend {
    map: Arc<Mutex<Map>>,
    frontend: OnceLock<Weak<Frontend>>,
    registry: Arc<SensorRegistry>,
    camera_left: Camera,
    config: Config,

    control: Mutex<ControlState>,
    map_update: Condvar,
    running: Condvar,
    pausing: Condvar,

    cycle: Mutex<CycleState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cycles_completed: AtomicU64,
}

impl Backend {
    pub fn new(
        map: Arc<Mutex<Map>>,
        camera_left: Camera,
        registry: Arc<SensorRegistry>,
        config: Config,
    ) -> Arc<Self> {
        let init_num_frames = config.init_num_frames;
        Arc::new(Self {
            map,
            frontend: OnceLock::new(),
            registry,
            camera_left,
            config,
            control: Mutex::new(ControlState {
                status: BackendStatus::Running,
                pending_update: false,
                shutdown: false,
            }),
            map_update: Condvar::new(),
            running: Condvar::new(),
            pausing: Condvar::new(),
            cycle: Mutex::new(CycleState {
                finished: 0.0,
                initializer: Initializer::new(init_num_frames),
                t_init: -1.0,
                init_a: false,
                init_b: false,
            }),
            worker: Mutex::new(None),
            cycles_completed: AtomicU64::new(0),
        })
    }

    pub fn set_frontend(&self, frontend: &Arc<Frontend>) {
        let _ = self.frontend.set(Arc::downgrade(frontend));
    }

    fn frontend(&self) -> Option<Arc<Frontend>> {
        self.frontend.get().and_then(Weak::upgrade)
    }

    /// Start the worker thread. Must be called once before `pause` is used.
    pub fn spawn(self: &Arc<Self>) -> Result<()> {
        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("lvio-backend".into())
            .spawn(move || me.worker_loop())?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn status(&self) -> BackendStatus {
        self.control.lock().status
    }

    /// Optimize cycles finished since start; lets tests and drivers wait for
    /// quiescence without polling the map.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::SeqCst)
    }

    /// Signal that new keyframes are available. Signals coalesce: many
    /// notifications before one wait behave as one.
    pub fn update_map(&self) {
        let mut control = self.control.lock();
        control.pending_update = true;
        self.map_update.notify_one();
    }

    /// Request a pause and wait until the worker has drained out of its
    /// critical section into `Pausing`.
    pub fn pause(&self) {
        let mut control = self.control.lock();
        if control.status == BackendStatus::Running {
            control.status = BackendStatus::ToPause;
            self.map_update.notify_one();
            while control.status != BackendStatus::Pausing && !control.shutdown {
                self.pausing.wait(&mut control);
            }
        }
    }

    /// Resume a paused worker.
    pub fn continue_(&self) {
        let mut control = self.control.lock();
        if control.status == BackendStatus::Pausing {
            control.status = BackendStatus::Running;
            self.running.notify_all();
        }
    }

    /// Stop the worker permanently and join it.
    pub fn shutdown(&self) {
        {
            let mut control = self.control.lock();
            control.shutdown = true;
            self.map_update.notify_all();
            self.running.notify_all();
            self.pausing.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        loop {
            {
                let mut control = self.control.lock();
                loop {
                    if control.shutdown {
                        return;
                    }
                    match control.status {
                        BackendStatus::ToPause => {
                            control.status = BackendStatus::Pausing;
                            self.pausing.notify_all();
                            self.running.wait(&mut control);
                        }
                        BackendStatus::Pausing => self.running.wait(&mut control),
                        BackendStatus::Running => {
                            if control.pending_update {
                                control.pending_update = false;
                                break;
                            }
                            self.map_update.wait(&mut control);
                        }
                    }
                }
            }
            let t_start = Instant::now();
            self.optimize();
            self.cycles_completed.fetch_add(1, Ordering::SeqCst);
            debug!(elapsed_ms = t_start.elapsed().as_millis() as u64, "backend cycle");
        }
    }

    /// One optimize cycle over the active window.
    fn optimize(&self) {
        let mut cycle = self.cycle.lock();

        let (mut active_kfs, contexts) = {
            let map = self.map.lock();
            let kfs = map.get_keyframes(FrameTime(cycle.finished));
            let contexts = collect_landmark_contexts(&map, &kfs);
            (kfs, contexts)
        };
        if active_kfs.is_empty() {
            return;
        }
        debug!(window = active_kfs.len(), "backend optimize");

        let old_pose = active_kfs.values().next_back().unwrap().pose;
        let old_pose_imu = active_kfs.values().next().unwrap().pose;
        let use_imu = self.registry.has_imu() && cycle.initializer.initialized;

        let mut problem: Problem<Param> = Problem::new();
        self.build_problem(&active_kfs, &contexts, &mut problem, true, use_imu);
        problem.solve(&SolverOptions {
            max_iterations: 20,
            max_solver_time: Duration::from_secs_f64(0.6 * self.config.window_size),
            num_threads: self.config.num_threads,
            ..Default::default()
        });
        write_back(&problem, &mut active_kfs);

        // IMU factors leave yaw and translation unconstrained; re-anchor on
        // the window's first keyframe.
        if use_imu {
            recover_data(&mut active_kfs, old_pose_imu);
        }

        let live_id = self.frontend().map_or(u64::MAX, |f| f.live_frame_id());
        let window_times: Vec<FrameTime> = active_kfs.keys().copied().collect();
        {
            let mut map = self.map.lock();
            commit_to_map(&mut map, &active_kfs);
            remove_outliers(&mut map, &window_times, &self.camera_left, live_id);
        }

        if let Some(lidar) = &self.registry.lidar {
            lidar.optimize(&mut active_kfs);
            commit_to_map(&mut self.map.lock(), &active_kfs);
        }

        let end_time = *active_kfs.keys().next_back().unwrap();
        if let Some(navsat) = &self.registry.navsat {
            if navsat.initialized() {
                if let Some(start) = navsat.optimize(end_time) {
                    if let Some(lidar) = &self.registry.lidar {
                        let mut map = self.map.lock();
                        let times: Vec<FrameTime> =
                            map.get_keyframes(start).keys().copied().collect();
                        for t in times {
                            if let Some(frame) = map.get_keyframe_mut(t) {
                                lidar.to_world(frame);
                            }
                        }
                    }
                }
            }
        }

        // Propagate the window's correction to everything after it.
        let new_frame = active_kfs.values().next_back().unwrap().clone();
        let transform = new_frame.pose.compose(&old_pose.inverse());
        let forward = end_time.0 + TIME_EPSILON;
        self.forward_propagate(&mut cycle, transform, forward, new_frame);
        cycle.finished = forward - self.config.window_size;
    }

    /// Assemble the window problem: pose blocks on the SE3 manifold, visual
    /// residuals under Huber(1.0), and (when requested and initialized) raw
    /// IMU residuals between consecutive IMU-enabled keyframes.
    fn build_problem(
        &self,
        frames: &Frames,
        contexts: &HashMap<LandmarkId, LandmarkContext>,
        problem: &mut Problem<Param>,
        use_imu: bool,
        initialized: bool,
    ) {
        let Some(&start_time) = frames.keys().next() else {
            return;
        };

        for (&t, frame) in frames {
            problem.add_parameter_block(pose_key(t), &frame.pose.to_params(), Manifold::Se3);
            for feature in frame.features_left.values() {
                let Some(ctx) = contexts.get(&feature.landmark) else {
                    continue;
                };
                let weight = frame.weights.visual;
                if ctx.reference_frame < start_time {
                    // Reference slid out of the window: the landmark is a
                    // fixed world point.
                    problem.add_residual_block(
                        Box::new(PoseOnlyReprojectionError::new(
                            feature.keypoint,
                            ctx.position_world,
                            self.camera_left.clone(),
                            weight,
                        )),
                        Some(Loss::Huber(1.0)),
                        &[pose_key(t)],
                    );
                } else if ctx.reference_frame != t {
                    problem.add_residual_block(
                        Box::new(TwoFrameReprojectionError::new(
                            ctx.position,
                            feature.keypoint,
                            self.camera_left.clone(),
                            weight,
                        )),
                        Some(Loss::Huber(1.0)),
                        &[pose_key(ctx.reference_frame), pose_key(t)],
                    );
                }
            }
        }

        if use_imu && initialized && self.registry.has_imu() {
            let mut last: Option<(FrameTime, &Frame)> = None;
            for (&t, frame) in frames {
                if !frame.b_imu || frame.last_keyframe.is_none() || frame.preintegration.is_none()
                {
                    last = Some((t, frame));
                    continue;
                }
                problem.add_parameter_block(
                    vel_key(t),
                    frame.velocity.as_slice(),
                    Manifold::Euclidean,
                );
                problem.add_parameter_block(
                    ba_key(t),
                    frame.bias.accel.as_slice(),
                    Manifold::Euclidean,
                );
                problem.add_parameter_block(
                    bg_key(t),
                    frame.bias.gyro.as_slice(),
                    Manifold::Euclidean,
                );

                if let Some((lt, lf)) = last {
                    if lf.b_imu && lf.last_keyframe.is_some() {
                        problem.add_parameter_block(
                            vel_key(lt),
                            lf.velocity.as_slice(),
                            Manifold::Euclidean,
                        );
                        problem.add_parameter_block(
                            ba_key(lt),
                            lf.bias.accel.as_slice(),
                            Manifold::Euclidean,
                        );
                        problem.add_parameter_block(
                            bg_key(lt),
                            lf.bias.gyro.as_slice(),
                            Manifold::Euclidean,
                        );
                        let preint = frame.preintegration.clone().unwrap();
                        problem.add_residual_block(
                            Box::new(ImuError::new(preint)),
                            None,
                            &[
                                pose_key(lt),
                                vel_key(lt),
                                ba_key(lt),
                                bg_key(lt),
                                pose_key(t),
                                vel_key(t),
                                ba_key(t),
                                bg_key(t),
                            ],
                        );
                    }
                }
                last = Some((t, frame));
            }
        }
    }

    /// Apply the window correction forward and keep the frontend consistent:
    /// staged inertial initialization, pose-graph propagation, a one-iteration
    /// visual stabilization, gravity-aware re-prediction, a fixed-anchor IMU
    /// refinement, and finally the frontend cache refresh.
    fn forward_propagate(
        &self,
        cycle: &mut CycleState,
        transform: SE3,
        time: f64,
        anchor: Frame,
    ) {
        let Some(frontend) = self.frontend() else {
            return;
        };
        let mut fe_guard = frontend.inner.lock();
        let fe = &mut *fe_guard;

        let mut active_kfs = self.map.lock().get_keyframes(FrameTime(time));
        let last_frame_time = fe.last_frame.as_ref().map(|f| f.time);
        if let Some(last) = &fe.last_frame {
            active_kfs.entry(last.time).or_insert_with(|| last.snapshot());
        }
        debug!(forward = active_kfs.len(), "forward propagate");

        // Staged initialization gating by time since the last successful run.
        let has_imu = self.registry.has_imu();
        let mut prior_a = 1e3;
        let mut prior_g = 1e1;
        let mut dt_since_init = f64::NEG_INFINITY;
        if let Some(&last_time) = active_kfs.keys().next_back() {
            let anchor_t = if cycle.t_init >= 0.0 {
                cycle.t_init
            } else {
                fe.valid_time
            };
            dt_since_init = last_time.0 - anchor_t;
        }
        if has_imu {
            if let Some((a, g)) =
                stage_priors(dt_since_init, &mut cycle.init_a, &mut cycle.init_b)
            {
                cycle.initializer.reinit = true;
                prior_a = a;
                prior_g = g;
            }
        }

        // Collect the attempt window: the earliest `num_frames` keyframes
        // after valid_time that carry preintegration.
        let mut frames_init: Option<Frames> = None;
        let want_attempt = has_imu
            && (cycle.initializer.reinit
                || (!cycle.initializer.initialized && dt_since_init >= 5.0));
        if want_attempt {
            let candidates = self
                .map
                .lock()
                .get_keyframes_in(FrameTime(fe.valid_time), FrameTime(time));
            let fi: Frames = candidates
                .into_iter()
                .filter(|(_, f)| f.preintegration.is_some())
                .take(cycle.initializer.num_frames)
                .collect();
            if fi.len() == cycle.initializer.num_frames {
                frames_init = Some(fi);
            }
        }

        let mut origin_init = false;
        if let Some(mut fi) = frames_init {
            origin_init = true;
            info!(priors = ?(prior_a, prior_g), "inertial initializer start");
            if cycle.initializer.initialize_imu(&mut fi, prior_a, prior_g) {
                cycle.t_init = fi.keys().next_back().unwrap().0;
                fe.status = FrontendStatus::TrackingGood;

                let mut map = self.map.lock();
                for (&t, f) in &fi {
                    if let Some(kf) = map.get_keyframe_mut(t) {
                        kf.velocity = f.velocity;
                        kf.set_new_bias(f.bias);
                    }
                }
                // Every keyframe with preintegration now participates in IMU
                // residuals.
                for (&t, f) in active_kfs.iter_mut() {
                    if f.preintegration.is_some() {
                        f.b_imu = true;
                        if let Some(src) = fi.get(&t) {
                            f.velocity = src.velocity;
                            f.set_new_bias(src.bias);
                        }
                        if let Some(kf) = map.get_keyframe_mut(t) {
                            kf.b_imu = true;
                        }
                    }
                }
            }
            info!("inertial initializer finished");
        }

        if !origin_init {
            PoseGraph::propagate(&transform, &mut active_kfs);
        }
        commit_to_map(&mut self.map.lock(), &active_kfs);

        // One-iteration visual linearization to stabilize the propagated
        // section.
        let contexts = {
            let map = self.map.lock();
            collect_landmark_contexts(&map, &active_kfs)
        };
        let mut problem: Problem<Param> = Problem::new();
        self.build_problem(&active_kfs, &contexts, &mut problem, false, false);
        problem.solve(&SolverOptions {
            max_iterations: 1,
            max_solver_time: Duration::from_secs_f64(0.1),
            num_threads: self.config.num_threads,
            ..Default::default()
        });
        write_back(&problem, &mut active_kfs);

        if has_imu && cycle.initializer.initialized {
            self.repredict_with_gravity(&anchor, &mut active_kfs);
            self.refine_imu_fixed_anchor(&anchor, &mut active_kfs);
        }
        commit_to_map(&mut self.map.lock(), &active_kfs);

        // Push the refreshed state back into the frontend.
        if let (Some(lt), Some(last)) = (last_frame_time, fe.last_frame.as_mut()) {
            if let Some(src) = active_kfs.get(&lt) {
                last.pose = src.pose;
                last.velocity = src.velocity;
                last.bias = src.bias;
                last.b_imu = src.b_imu;
            }
        }
        let live_bias = active_kfs
            .values()
            .next_back()
            .map(|f| f.bias)
            .unwrap_or(anchor.bias);
        frontend.update_frame_imu_locked(fe, live_bias);
        frontend.update_cache_locked(fe);
    }

    /// Re-derive pose and velocity of each forward keyframe from its
    /// predecessor through gravity-aware integration of its preintegration,
    /// carrying the predecessor's bias.
    fn repredict_with_gravity(&self, anchor: &Frame, frames: &mut Frames) {
        let Some(calib) = self.registry.imu else {
            return;
        };
        let tcb_r = calib.tcb.rotation_matrix();
        let tcb_t = calib.tcb.translation;

        let mut last = anchor.clone();
        for (&t, frame) in frames.iter_mut() {
            if t <= last.time {
                continue;
            }
            let Some(preint) = frame.preintegration.clone() else {
                last = frame.clone();
                continue;
            };
            let t12 = preint.sum_dt;
            let bias = last.bias;

            let rwb1 = last.pose.rotation_matrix() * tcb_r;
            let twb1 = last.pose.transform_point(&tcb_t);
            let vwb1 = last.velocity;

            let rwb2 = rwb1
                * preint
                    .delta_rotation(&bias)
                    .to_rotation_matrix()
                    .into_inner();
            let twb2 =
                twb1 + vwb1 * t12 + 0.5 * t12 * t12 * GRAVITY + rwb1 * preint.delta_position(&bias);
            let vwb2 = vwb1 + t12 * GRAVITY + rwb1 * preint.delta_velocity(&bias);

            let r_wc = rwb2 * tcb_r.transpose();
            let t_wc = twb2 - r_wc * tcb_t;
            frame.pose = SE3::from_rt(r_wc, t_wc);
            frame.velocity = vwb2;
            frame.set_new_bias(bias);
            last = frame.clone();
        }
    }

    /// IMU-only refinement over the forward set with the first propagated
    /// pair held constant; poses stay fixed, biases and velocities move.
    fn refine_imu_fixed_anchor(&self, anchor: &Frame, frames: &mut Frames) {
        let mut problem: Problem<Param> = Problem::new();
        let chain_anchor = !frames.contains_key(&anchor.time);
        let anchor_pair = (anchor.time, anchor);
        let iter = chain_anchor
            .then_some(anchor_pair)
            .into_iter()
            .chain(frames.iter().map(|(&t, f)| (t, f)));

        let mut first = true;
        let mut last: Option<(FrameTime, ImuBias, Vector3<f64>, SE3, bool)> = None;
        for (t, frame) in iter {
            if !frame.b_imu || frame.last_keyframe.is_none() || frame.preintegration.is_none() {
                last = Some((t, frame.bias, frame.velocity, frame.pose, frame.b_imu));
                // The anchor counts as a valid predecessor even without its
                // own preintegration in the set.
                if t == anchor.time {
                    last = Some((t, frame.bias, frame.velocity, frame.pose, true));
                }
                continue;
            }

            problem.add_parameter_block(pose_key(t), &frame.pose.to_params(), Manifold::Se3);
            problem.set_parameter_block_constant(pose_key(t));
            problem.add_parameter_block(vel_key(t), frame.velocity.as_slice(), Manifold::Euclidean);
            problem.add_parameter_block(ba_key(t), frame.bias.accel.as_slice(), Manifold::Euclidean);
            problem.add_parameter_block(bg_key(t), frame.bias.gyro.as_slice(), Manifold::Euclidean);

            if let Some((lt, lbias, lvel, lpose, l_imu)) = last {
                if l_imu {
                    problem.add_parameter_block(pose_key(lt), &lpose.to_params(), Manifold::Se3);
                    problem.set_parameter_block_constant(pose_key(lt));
                    problem.add_parameter_block(vel_key(lt), lvel.as_slice(), Manifold::Euclidean);
                    problem.add_parameter_block(ba_key(lt), lbias.accel.as_slice(), Manifold::Euclidean);
                    problem.add_parameter_block(bg_key(lt), lbias.gyro.as_slice(), Manifold::Euclidean);
                    if first {
                        // The first propagated pair anchors the refinement.
                        problem.set_parameter_block_constant(vel_key(lt));
                        problem.set_parameter_block_constant(ba_key(lt));
                        problem.set_parameter_block_constant(bg_key(lt));
                        first = false;
                    }
                    let preint = frame.preintegration.clone().unwrap();
                    problem.add_residual_block(
                        Box::new(ImuError::new(preint)),
                        None,
                        &[
                            pose_key(lt),
                            vel_key(lt),
                            ba_key(lt),
                            bg_key(lt),
                            pose_key(t),
                            vel_key(t),
                            ba_key(t),
                            bg_key(t),
                        ],
                    );
                }
            }
            last = Some((t, frame.bias, frame.velocity, frame.pose, frame.b_imu));
        }

        if problem.num_residual_blocks() == 0 {
            return;
        }
        problem.solve(&SolverOptions {
            max_iterations: 4,
            max_solver_time: Duration::from_secs_f64(0.1),
            num_threads: self.config.num_threads,
            ..Default::default()
        });
        write_back(&problem, frames);
        for frame in frames.values_mut() {
            let bias = frame.bias;
            frame.set_new_bias(bias);
        }
    }
}

/// Staged bias-prior schedule, keyed by time since the last successful
/// initializer run. Under 5 s nothing fires; the first window re-initializes
/// with a strong accel prior, and past 15 s a final pass runs with the bias
/// priors released. Each stage fires once.
fn stage_priors(dt: f64, init_a: &mut bool, init_b: &mut bool) -> Option<(f64, f64)> {
    if (5.0..15.0).contains(&dt) && !*init_a {
        *init_a = true;
        Some((1e4, 1e1))
    } else if dt >= 15.0 && !*init_b {
        *init_b = true;
        Some((0.0, 0.0))
    } else {
        None
    }
}

/// Capture landmark geometry for every left feature of `frames`.
fn collect_landmark_contexts(
    map: &Map,
    frames: &Frames,
) -> HashMap<LandmarkId, LandmarkContext> {
    let mut contexts = HashMap::new();
    for frame in frames.values() {
        for &id in frame.features_left.keys() {
            if contexts.contains_key(&id) {
                continue;
            }
            let Some(lm) = map.get_landmark(id) else {
                continue;
            };
            let Some(position_world) = map.position_world(id) else {
                continue;
            };
            contexts.insert(
                id,
                LandmarkContext {
                    reference_frame: lm.reference_frame,
                    position: lm.position,
                    position_world,
                },
            );
        }
    }
    contexts
}

/// Pull solved parameters back into the snapshot.
fn write_back(problem: &Problem<Param>, frames: &mut Frames) {
    for (&t, frame) in frames.iter_mut() {
        if let Some(p) = problem.get(pose_key(t)) {
            frame.pose = SE3::from_params(p);
        }
        if let Some(v) = problem.get(vel_key(t)) {
            frame.velocity = Vector3::new(v[0], v[1], v[2]);
        }
        let accel = problem
            .get(ba_key(t))
            .map(|b| Vector3::new(b[0], b[1], b[2]));
        let gyro = problem
            .get(bg_key(t))
            .map(|b| Vector3::new(b[0], b[1], b[2]));
        if accel.is_some() || gyro.is_some() {
            frame.bias = ImuBias {
                accel: accel.unwrap_or(frame.bias.accel),
                gyro: gyro.unwrap_or(frame.bias.gyro),
            };
        }
    }
}

/// Commit snapshot state onto the map's frames.
fn commit_to_map(map: &mut Map, frames: &Frames) {
    for (&t, frame) in frames {
        if let Some(kf) = map.get_keyframe_mut(t) {
            kf.pose = frame.pose;
            kf.velocity = frame.velocity;
            kf.b_imu = frame.b_imu;
            kf.set_new_bias(frame.bias);
        }
    }
}

/// Undo the gauge drift of an IMU window solve: rotate and translate all
/// IMU-participating keyframes so the window's first frame returns to its
/// pre-solve anchor. Yaw-only, unless the first-frame pitch sits near ±90°
/// where yaw extraction degenerates; then the full rotation delta is used.
pub(crate) fn recover_data(frames: &mut Frames, old_pose_imu: SE3) {
    let Some(first) = frames.values().next() else {
        return;
    };
    let new_pose = first.pose;
    let origin_p0 = old_pose_imu.translation;
    let ypr_old = rotation_to_ypr(&old_pose_imu.rotation_matrix());
    let ypr_new = rotation_to_ypr(&new_pose.rotation_matrix());

    let mut rot_diff = ypr_to_rotation(&Vector3::new(ypr_old.x - ypr_new.x, 0.0, 0.0));
    if (ypr_old.y.abs() - 90.0).abs() < 1.0 || (ypr_new.y.abs() - 90.0).abs() < 1.0 {
        rot_diff = old_pose_imu.rotation_matrix() * new_pose.rotation_matrix().transpose();
    }

    let new_t = new_pose.translation;
    for frame in frames.values_mut() {
        if frame.preintegration.is_none() || frame.last_keyframe.is_none() || !frame.b_imu {
            continue;
        }
        frame.pose = SE3::from_rt(
            rot_diff * frame.pose.rotation_matrix(),
            rot_diff * (frame.pose.translation - new_t) + origin_p0,
        );
        frame.velocity = rot_diff * frame.velocity;
        let bias = frame.bias;
        frame.set_new_bias(bias);
    }
}

/// Post-solve outlier purge: detach left features whose reprojection error
/// exceeds 10 px (never from the landmark's reference frame), then drop
/// landmarks left with at most one observation, unless the frame is the
/// live one.
pub(crate) fn remove_outliers(
    map: &mut Map,
    window: &[FrameTime],
    camera: &Camera,
    live_frame_id: u64,
) {
    for &t in window {
        let Some(frame) = map.get_keyframe(t) else {
            continue;
        };
        let frame_id = frame.id;
        let pose = frame.pose;
        let candidates: Vec<(LandmarkId, Vector2<f64>)> = frame
            .features_left
            .iter()
            .map(|(&id, f)| (id, f.keypoint))
            .collect();

        let mut removed_landmarks = Vec::new();
        for (id, keypoint) in candidates {
            let Some(lm) = map.get_landmark(id) else {
                continue;
            };
            if lm.reference_frame != t {
                let error = map
                    .position_world(id)
                    .and_then(|pw| camera.world_to_pixel(&pw, &pose))
                    .map(|uv| (uv - keypoint).norm());
                if !matches!(error, Some(e) if e <= 10.0) {
                    map.remove_feature(t, id);
                }
            }
            if let Some(lm) = map.get_landmark(id) {
                if lm.num_observations() <= 1 && frame_id != live_frame_id {
                    removed_landmarks.push(id);
                }
            }
        }
        for id in removed_landmarks {
            map.remove_landmark(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Feature, Landmark};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn imu_frame(id: u64, time: f64, pose: SE3) -> Frame {
        use crate::imu::{ImuCalib, Preintegration};
        let mut f = Frame::new(id, time);
        f.pose = pose;
        f.b_imu = true;
        f.last_keyframe = Some(FrameTime(time - 1.0));
        let mut preint = Preintegration::new(ImuBias::zero(), ImuCalib::default());
        preint.append(0.01, -GRAVITY, Vector3::zeros()).unwrap();
        f.preintegration = Some(preint);
        f
    }

    #[test]
    fn test_stage_priors_schedule() {
        let (mut a, mut b) = (false, false);

        // Too early: nothing fires.
        assert_eq!(stage_priors(3.0, &mut a, &mut b), None);

        // First stage at 6 s: strong accel prior, fires once.
        assert_eq!(stage_priors(6.0, &mut a, &mut b), Some((1e4, 1e1)));
        assert!(a);
        assert_eq!(stage_priors(7.0, &mut a, &mut b), None);

        // Second stage past 15 s: priors released, fires once.
        assert_eq!(stage_priors(16.0, &mut a, &mut b), Some((0.0, 0.0)));
        assert!(b);
        assert_eq!(stage_priors(20.0, &mut a, &mut b), None);
    }

    #[test]
    fn test_recover_data_undoes_yaw_gauge_drift() {
        let poses: Vec<SE3> = (0..4)
            .map(|i| {
                SE3::new(
                    UnitQuaternion::from_euler_angles(0.0, 0.1, 0.05 * i as f64),
                    Vector3::new(i as f64, 0.5 * i as f64, 0.1),
                )
            })
            .collect();
        let original: Frames = poses
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let f = imu_frame(i as u64, i as f64, *p);
                (f.time, f)
            })
            .collect();

        // Gauge drift a solve might introduce: a yaw rotation about the
        // world z plus a translation offset.
        let yaw = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3);
        let gauge = SE3::new(yaw, Vector3::new(0.7, -0.2, 0.4));
        let mut drifted: Frames = original
            .iter()
            .map(|(&t, f)| {
                let mut g = f.clone();
                g.pose = gauge.compose(&f.pose);
                g.velocity = yaw * f.velocity;
                (t, g)
            })
            .collect();

        let old_pose_imu = original.values().next().unwrap().pose;
        recover_data(&mut drifted, old_pose_imu);

        for (rec, orig) in drifted.values().zip(original.values()) {
            assert_relative_eq!(
                rec.pose.translation,
                orig.pose.translation,
                epsilon = 1e-9
            );
            assert_relative_eq!(
                rec.pose.rotation.angle_to(&orig.pose.rotation),
                0.0,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_remove_outliers_detaches_and_culls() {
        let camera = Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity());
        let mut map = Map::new();

        // Reference keyframe holding the landmark 5 m ahead.
        let mut kf1 = Frame::new(1, 1.0);
        kf1.pose = SE3::identity();
        let lm_id = map.next_landmark_id();
        let p_body = Vector3::new(0.0, 0.0, 5.0);
        let mut lm = Landmark::new(lm_id, p_body, kf1.time);
        lm.add_observation(kf1.time, true);
        kf1.add_feature(Feature::new(kf1.time, lm_id, Vector2::new(320.0, 240.0)));
        map.insert_landmark(lm);
        map.insert_key_frame(kf1);

        // Second keyframe observes it 20 px off.
        let mut kf2 = Frame::new(2, 2.0);
        kf2.pose = SE3::identity();
        let good_uv = camera.world_to_pixel(&p_body, &kf2.pose).unwrap();
        kf2.add_feature(Feature::new(
            kf2.time,
            lm_id,
            good_uv + Vector2::new(20.0, 0.0),
        ));
        map.get_landmark_mut(lm_id)
            .unwrap()
            .add_observation(FrameTime(2.0), true);
        map.insert_key_frame(kf2);

        remove_outliers(
            &mut map,
            &[FrameTime(1.0), FrameTime(2.0)],
            &camera,
            99, // live frame is someone else
        );

        // Feature detached from the second keyframe; with one observation
        // left, the landmark is gone entirely.
        assert!(map.get_landmark(lm_id).is_none());
        assert!(map
            .get_keyframe(FrameTime(2.0))
            .unwrap()
            .features_left
            .is_empty());
        assert!(map
            .get_keyframe(FrameTime(1.0))
            .unwrap()
            .features_left
            .is_empty());
    }

    #[test]
    fn test_remove_outliers_keeps_inliers() {
        let camera = Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity());
        let mut map = Map::new();

        let mut kf1 = Frame::new(1, 1.0);
        kf1.pose = SE3::identity();
        let lm_id = map.next_landmark_id();
        let p_body = Vector3::new(0.2, -0.1, 4.0);
        let mut lm = Landmark::new(lm_id, p_body, kf1.time);
        lm.add_observation(kf1.time, true);
        let uv1 = camera.world_to_pixel(&p_body, &kf1.pose).unwrap();
        kf1.add_feature(Feature::new(kf1.time, lm_id, uv1));
        map.insert_landmark(lm);
        map.insert_key_frame(kf1);

        let mut kf2 = Frame::new(2, 2.0);
        kf2.pose = SE3::new(UnitQuaternion::identity(), Vector3::new(0.05, 0.0, 0.0));
        let uv2 = camera.world_to_pixel(&p_body, &kf2.pose).unwrap();
        kf2.add_feature(Feature::new(kf2.time, lm_id, uv2 + Vector2::new(2.0, 0.0)));
        map.get_landmark_mut(lm_id)
            .unwrap()
            .add_observation(FrameTime(2.0), true);
        map.insert_key_frame(kf2);

        remove_outliers(&mut map, &[FrameTime(1.0), FrameTime(2.0)], &camera, 99);
        assert!(map.get_landmark(lm_id).is_some());
        assert_eq!(map.get_landmark(lm_id).unwrap().num_observations(), 2);
    }

    #[test]
    fn test_single_frame_window_builds_without_imu_residuals() {
        let map = Arc::new(Mutex::new(Map::new()));
        let camera = Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity());
        let backend = Backend::new(
            Arc::clone(&map),
            camera,
            Arc::new(SensorRegistry::vision_only()),
            Config::default(),
        );

        let mut frames = Frames::new();
        let mut frame = imu_frame(1, 1.0, SE3::identity());
        frame.b_imu = true;
        frames.insert(frame.time, frame);

        let mut problem: Problem<Param> = Problem::new();
        // Even claiming "initialized", one frame can form no IMU pair.
        backend.build_problem(&frames, &HashMap::new(), &mut problem, true, true);
        assert_eq!(problem.num_residual_blocks(), 0);
    }

    #[test]
    fn test_pause_resume_handshake() {
        let map = Arc::new(Mutex::new(Map::new()));
        let camera = Camera::new(400.0, 400.0, 320.0, 240.0, SE3::identity());
        let backend = Backend::new(
            Arc::clone(&map),
            camera,
            Arc::new(SensorRegistry::vision_only()),
            Config::default(),
        );
        backend.spawn().unwrap();

        // pause() must not return before the worker acknowledges.
        backend.pause();
        assert_eq!(backend.status(), BackendStatus::Pausing);

        backend.continue_();
        assert_eq!(backend.status(), BackendStatus::Running);

        // Coalesced updates: several signals, the worker drains them without
        // deadlocking, and pause still round-trips.
        backend.update_map();
        backend.update_map();
        backend.pause();
        assert_eq!(backend.status(), BackendStatus::Pausing);
        backend.continue_();

        backend.shutdown();
    }
}
