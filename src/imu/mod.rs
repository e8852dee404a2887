//! Inertial pipeline: raw samples, preintegration, bootstrap.

pub mod initializer;
pub mod preintegration;
pub mod sample;

pub use initializer::Initializer;
pub use preintegration::{Preintegration, RelinThreshold};
pub use sample::{ImuBias, ImuCalib, ImuNoise, ImuSample, GRAVITY};
