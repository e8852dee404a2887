//! Nonlinear least-squares problem over keyed parameter blocks.
//!
//! The residual factories are written against this Ceres-like surface so the
//! solver behind it can change without touching residual definitions. Blocks
//! are addressed by a caller-chosen key type; pose blocks live on the
//! quaternion × identity manifold, so cost functions produce Jacobians in
//! tangent coordinates directly.

use std::collections::HashMap;
use std::hash::Hash;

use nalgebra::{DMatrix, Quaternion, UnitQuaternion, Vector3};

/// Local parameterization of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifold {
    /// Plain vector space; local dim equals global dim.
    Euclidean,
    /// `[qx, qy, qz, qw, tx, ty, tz]`: quaternion tangent (3) × translation (3).
    Se3,
    /// `[qx, qy, qz, qw]`: quaternion tangent (3).
    Quaternion,
}

impl Manifold {
    pub fn local_dim(&self, global_dim: usize) -> usize {
        match self {
            Manifold::Euclidean => global_dim,
            Manifold::Se3 => 6,
            Manifold::Quaternion => 3,
        }
    }

    /// x ⊞ δ, in place. Quaternions take a right-multiplied exponential and
    /// are renormalized.
    pub fn plus(&self, x: &mut [f64], delta: &[f64]) {
        match self {
            Manifold::Euclidean => {
                for (xi, di) in x.iter_mut().zip(delta) {
                    *xi += di;
                }
            }
            Manifold::Se3 => {
                quaternion_plus(&mut x[0..4], &delta[0..3]);
                for i in 0..3 {
                    x[4 + i] += delta[3 + i];
                }
            }
            Manifold::Quaternion => quaternion_plus(x, delta),
        }
    }
}

fn quaternion_plus(x: &mut [f64], delta: &[f64]) {
    let q = UnitQuaternion::from_quaternion(Quaternion::new(x[3], x[0], x[1], x[2]));
    let dq = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
    let out = q * dq;
    let c = out.quaternion();
    x[0] = c.i;
    x[1] = c.j;
    x[2] = c.k;
    x[3] = c.w;
}

/// A residual term over one or more parameter blocks.
///
/// `jacobians[i]`, when requested, is `num_residuals × local_dim` of block i.
/// Returning false drops the term for this iteration (e.g. a point behind
/// the camera).
pub trait CostFunction: Send {
    fn num_residuals(&self) -> usize;
    /// Tangent dimension per parameter block, in call order.
    fn local_dims(&self) -> Vec<usize>;
    fn evaluate(
        &self,
        params: &[&[f64]],
        residuals: &mut [f64],
        jacobians: Option<&mut [DMatrix<f64>]>,
    ) -> bool;
}

/// Robust loss applied to a residual block.
#[derive(Debug, Clone, Copy)]
pub enum Loss {
    Huber(f64),
}

impl Loss {
    /// Scale factor applied to both residual and Jacobian, sqrt(ρ′(‖r‖²)).
    pub fn weight(&self, squared_norm: f64) -> f64 {
        match self {
            Loss::Huber(delta) => {
                if squared_norm <= delta * delta {
                    1.0
                } else {
                    (delta / squared_norm.sqrt()).sqrt()
                }
            }
        }
    }
}

pub(crate) struct ParamBlock {
    pub values: Vec<f64>,
    pub manifold: Manifold,
    pub constant: bool,
}

pub(crate) struct ResidualBlock {
    pub cost: Box<dyn CostFunction>,
    pub loss: Option<Loss>,
    pub block_indices: Vec<usize>,
}

pub struct Problem<K> {
    pub(crate) blocks: Vec<ParamBlock>,
    pub(crate) index: HashMap<K, usize>,
    pub(crate) residuals: Vec<ResidualBlock>,
}

impl<K: Eq + Hash + Copy> Problem<K> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            index: HashMap::new(),
            residuals: Vec::new(),
        }
    }

    /// Register a block; re-adding an existing key is a no-op (the original
    /// values stay), matching how window construction revisits frames.
    pub fn add_parameter_block(&mut self, key: K, values: &[f64], manifold: Manifold) {
        if self.index.contains_key(&key) {
            return;
        }
        let idx = self.blocks.len();
        self.blocks.push(ParamBlock {
            values: values.to_vec(),
            manifold,
            constant: false,
        });
        self.index.insert(key, idx);
    }

    pub fn set_parameter_block_constant(&mut self, key: K) {
        if let Some(&idx) = self.index.get(&key) {
            self.blocks[idx].constant = true;
        }
    }

    pub fn has_block(&self, key: K) -> bool {
        self.index.contains_key(&key)
    }

    /// Attach a residual term. All referenced keys must be registered.
    pub fn add_residual_block(
        &mut self,
        cost: Box<dyn CostFunction>,
        loss: Option<Loss>,
        keys: &[K],
    ) {
        let block_indices: Vec<usize> = keys
            .iter()
            .map(|k| *self.index.get(k).expect("unregistered parameter block"))
            .collect();
        debug_assert_eq!(
            cost.local_dims().len(),
            block_indices.len(),
            "cost arity mismatch"
        );
        self.residuals.push(ResidualBlock {
            cost,
            loss,
            block_indices,
        });
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residuals.len()
    }

    /// Current values of a block.
    pub fn get(&self, key: K) -> Option<&[f64]> {
        self.index
            .get(&key)
            .map(|&idx| self.blocks[idx].values.as_slice())
    }
}

impl<K: Eq + Hash + Copy> Default for Problem<K> {
    fn default() -> Self {
        Self::new()
    }
}
