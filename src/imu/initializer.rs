//! Inertial initialization: gravity direction, biases, and velocities from
//! the first keyframes that carry preintegration.

use std::time::Duration;

use nalgebra::{UnitQuaternion, Vector3};
use tracing::{debug, info};

use crate::map::{Frames, FrameTime};
use crate::optimize::{ImuErrorG, Manifold, Problem, SolverOptions};

/// Parameter-block keys for one initialization problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Param {
    Velocity(u64),
    BiasAccel,
    BiasGyro,
    Gravity,
}

fn vel(t: FrameTime) -> Param {
    Param::Velocity(t.0.to_bits())
}

/// Staged inertial bootstrap. The backend gates when attempts run; this type
/// owns the optimization itself and the initialization flags.
pub struct Initializer {
    /// Keyframes consumed per attempt.
    pub num_frames: usize,
    pub initialized: bool,
    /// Set by the stage gate to request another pass with fresh priors.
    pub reinit: bool,
    /// Estimated world-from-gravity rotation after a successful pass.
    pub rwg: UnitQuaternion<f64>,
}

impl Initializer {
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            initialized: false,
            reinit: false,
            rwg: UnitQuaternion::identity(),
        }
    }

    /// Solve for gravity rotation, a window-wide bias pair, and per-keyframe
    /// velocities, with the first keyframe's state held fixed and Gaussian
    /// priors (`prior_a`, `prior_g`) on the biases.
    ///
    /// On success the solved state is written back into `frames` (biases via
    /// `set_new_bias`, so preintegrations relinearize) and `initialized` is
    /// set. On failure nothing is modified and `false` is returned.
    pub fn initialize_imu(&mut self, frames: &mut Frames, prior_a: f64, prior_g: f64) -> bool {
        let pairs: Vec<(FrameTime, FrameTime)> = frames
            .keys()
            .zip(frames.keys().skip(1))
            .map(|(&a, &b)| (a, b))
            .collect();
        let usable = pairs
            .iter()
            .filter(|(_, j)| frames[j].preintegration.is_some())
            .count();
        if usable < 2 {
            return false;
        }

        let mut problem: Problem<Param> = Problem::new();
        let first_bias = frames.values().next().map(|f| f.bias).unwrap_or_default();
        problem.add_parameter_block(
            Param::BiasAccel,
            first_bias.accel.as_slice(),
            Manifold::Euclidean,
        );
        problem.add_parameter_block(
            Param::BiasGyro,
            first_bias.gyro.as_slice(),
            Manifold::Euclidean,
        );
        problem.add_parameter_block(
            Param::Gravity,
            &[0.0, 0.0, 0.0, 1.0],
            Manifold::Quaternion,
        );

        let mut first = true;
        for (t_i, t_j) in &pairs {
            let (frame_i, frame_j) = (&frames[t_i], &frames[t_j]);
            let preint = match &frame_j.preintegration {
                Some(p) => p.clone(),
                None => continue,
            };

            problem.add_parameter_block(
                vel(*t_i),
                frame_i.velocity.as_slice(),
                Manifold::Euclidean,
            );
            problem.add_parameter_block(
                vel(*t_j),
                frame_j.velocity.as_slice(),
                Manifold::Euclidean,
            );
            if first {
                // The first keyframe anchors the problem.
                problem.set_parameter_block_constant(vel(*t_i));
                first = false;
            }

            problem.add_residual_block(
                Box::new(ImuErrorG::new(
                    preint,
                    frame_i.pose,
                    frame_j.pose,
                    prior_a,
                    prior_g,
                )),
                None,
                &[
                    vel(*t_i),
                    Param::BiasAccel,
                    Param::BiasGyro,
                    vel(*t_j),
                    Param::Gravity,
                ],
            );
        }

        if problem.num_residual_blocks() == 0 {
            return false;
        }

        let summary = problem.solve(&SolverOptions {
            max_iterations: 20,
            max_solver_time: Duration::from_millis(100),
            ..Default::default()
        });
        if !summary.final_cost.is_finite() {
            debug!("inertial initialization diverged");
            return false;
        }

        // Recover the shared bias and per-frame velocities.
        let ba = problem.get(Param::BiasAccel).unwrap();
        let bg = problem.get(Param::BiasGyro).unwrap();
        let bias = crate::imu::ImuBias {
            accel: Vector3::new(ba[0], ba[1], ba[2]),
            gyro: Vector3::new(bg[0], bg[1], bg[2]),
        };
        let rwg_params = problem.get(Param::Gravity).unwrap().to_vec();

        for (&t, frame) in frames.iter_mut() {
            if let Some(v) = problem.get(vel(t)) {
                frame.velocity = Vector3::new(v[0], v[1], v[2]);
            }
            frame.set_new_bias(bias);
        }
        self.rwg = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            rwg_params[3],
            rwg_params[0],
            rwg_params[1],
            rwg_params[2],
        ));
        self.initialized = true;
        self.reinit = false;
        info!(
            cost = summary.final_cost,
            iterations = summary.iterations,
            "inertial initialization succeeded"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::imu::{ImuBias, ImuCalib, Preintegration, GRAVITY};
    use crate::map::Frame;
    use approx::assert_relative_eq;

    /// Stationary rig: every keyframe at the origin, resting IMU between
    /// them. The solved velocities must stay near zero and the biases small.
    fn stationary_frames(n: usize, spacing: f64) -> Frames {
        let mut frames = Frames::new();
        let mut last: Option<FrameTime> = None;
        for i in 0..n {
            let t = i as f64 * spacing;
            let mut frame = Frame::new(i as u64, t);
            frame.pose = SE3::identity();
            if let Some(last_t) = last {
                let mut preint = Preintegration::new(ImuBias::zero(), ImuCalib::default());
                let dt = 0.005;
                let mut elapsed = 0.0;
                while elapsed < spacing {
                    preint
                        .append(dt, -GRAVITY, nalgebra::Vector3::zeros())
                        .unwrap();
                    elapsed += dt;
                }
                frame.preintegration = Some(preint);
                frame.last_keyframe = Some(last_t);
            }
            last = Some(frame.time);
            frames.insert(frame.time, frame);
        }
        frames
    }

    #[test]
    fn test_initializes_on_stationary_data() {
        let mut frames = stationary_frames(6, 0.25);
        let mut init = Initializer::new(6);
        assert!(init.initialize_imu(&mut frames, 1e4, 1e1));
        assert!(init.initialized);
        assert!(!init.reinit);

        for frame in frames.values() {
            assert!(frame.velocity.norm() < 0.05, "v = {}", frame.velocity.norm());
            assert!(frame.bias.accel.norm() < 0.1);
            assert!(frame.bias.gyro.norm() < 0.01);
        }
    }

    #[test]
    fn test_fails_without_preintegration() {
        let mut frames = Frames::new();
        for i in 0..5 {
            let frame = Frame::new(i, i as f64);
            frames.insert(frame.time, frame);
        }
        let before: Vec<_> = frames.values().map(|f| f.velocity).collect();
        let mut init = Initializer::new(5);
        assert!(!init.initialize_imu(&mut frames, 1e4, 1e1));
        assert!(!init.initialized);
        for (frame, v) in frames.values().zip(before) {
            assert_relative_eq!(frame.velocity, v);
        }
    }
}
