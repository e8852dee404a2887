//! Diagonal pose priors used by the loop-closure collaborator surface.

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::geometry::{skew, SE3};

use super::problem::CostFunction;

/// Weighted anchor of a full pose: `[Log(q_ref⁻¹ q); t - t_ref]`.
pub struct PoseError {
    reference: SE3,
    weight: f64,
}

impl PoseError {
    pub fn new(reference: SE3, weight: f64) -> Self {
        Self { reference, weight }
    }
}

impl CostFunction for PoseError {
    fn num_residuals(&self) -> usize {
        6
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![6]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let pose = SE3::from_params(params[0]);
        let dq = (self.reference.rotation.inverse() * pose.rotation).scaled_axis();
        let dt = pose.translation - self.reference.translation;
        for k in 0..3 {
            residuals[k] = self.weight * dq[k];
            residuals[3 + k] = self.weight * dt[k];
        }
        if let Some(jacs) = jacobians {
            let mut j = DMatrix::zeros(6, 6);
            // Jr⁻¹ ≈ I + ½[dq]× for the small angles a prior sees.
            let top = Matrix3::identity() + 0.5 * skew(&Vector3::new(dq[0], dq[1], dq[2]));
            j.view_mut((0, 0), (3, 3)).copy_from(&(self.weight * top));
            j.view_mut((3, 3), (3, 3))
                .copy_from(&(self.weight * Matrix3::identity()));
            jacs[0].copy_from(&j);
        }
        true
    }
}

/// Rotation-only anchor.
pub struct RError {
    reference: SE3,
    weight: f64,
}

impl RError {
    pub fn new(reference: SE3, weight: f64) -> Self {
        Self { reference, weight }
    }
}

impl CostFunction for RError {
    fn num_residuals(&self) -> usize {
        3
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![6]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let pose = SE3::from_params(params[0]);
        let dq = (self.reference.rotation.inverse() * pose.rotation).scaled_axis();
        for k in 0..3 {
            residuals[k] = self.weight * dq[k];
        }
        if let Some(jacs) = jacobians {
            let mut j = DMatrix::zeros(3, 6);
            j.view_mut((0, 0), (3, 3))
                .copy_from(&(self.weight * Matrix3::identity()));
            jacs[0].copy_from(&j);
        }
        true
    }
}

/// Translation-only anchor.
pub struct TError {
    reference: SE3,
    weight: f64,
}

impl TError {
    pub fn new(reference: SE3, weight: f64) -> Self {
        Self { reference, weight }
    }
}

impl CostFunction for TError {
    fn num_residuals(&self) -> usize {
        3
    }

    fn local_dims(&self) -> Vec<usize> {
        vec![6]
    }

    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool {
        let pose = SE3::from_params(params[0]);
        let dt = pose.translation - self.reference.translation;
        for k in 0..3 {
            residuals[k] = self.weight * dt[k];
        }
        if let Some(jacs) = jacobians {
            let mut j = DMatrix::zeros(3, 6);
            j.view_mut((0, 3), (3, 3))
                .copy_from(&(self.weight * Matrix3::identity()));
            jacs[0].copy_from(&j);
        }
        true
    }
}
