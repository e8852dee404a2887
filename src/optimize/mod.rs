//! Residual factory and the dense nonlinear least-squares solver behind it.

pub mod imu_error;
pub mod pose_error;
pub mod problem;
pub mod solver;
pub mod visual_error;

pub use imu_error::{ImuError, ImuErrorG};
pub use pose_error::{PoseError, RError, TError};
pub use problem::{CostFunction, Loss, Manifold, Problem};
pub use solver::{SolverOptions, SolverSummary};
pub use visual_error::{PoseOnlyReprojectionError, TwoFrameReprojectionError};
