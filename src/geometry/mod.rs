//! Geometry utilities: SE3 transforms, SO3 Jacobians, PnP, triangulation.

pub mod pnp;
pub mod se3;
pub mod so3;
pub mod triangulation;

pub use pnp::solve_pnp_ransac;
pub use se3::{rotation_to_ypr, ypr_to_rotation, SE3};
pub use so3::{right_jacobian, right_jacobian_inv, skew};
pub use triangulation::triangulate;
