//! Dense Levenberg–Marquardt over a `Problem`.
//!
//! The windows this system solves stay small (tens of pose blocks, a few
//! hundred residuals), so dense normal equations with damped Gauss–Newton
//! steps are both simple and fast enough to finish inside the backend's wall
//! budget.

use std::hash::Hash;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::problem::Problem;

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub max_solver_time: Duration,
    /// Kept for configuration parity with collaborators; the dense solve is
    /// single-threaded.
    pub num_threads: usize,
    pub initial_lambda: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_solver_time: Duration::from_secs(1),
            num_threads: 1,
            initial_lambda: 1e-4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

impl<K: Eq + Hash + Copy> Problem<K> {
    /// Run LM; iterates are written into the parameter blocks regardless of
    /// convergence (the backend accepts wall-bounded partial progress).
    pub fn solve(&mut self, options: &SolverOptions) -> SolverSummary {
        let start = Instant::now();

        // Column layout over non-constant blocks.
        let mut col_offset = vec![usize::MAX; self.blocks.len()];
        let mut num_cols = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if !block.constant {
                col_offset[i] = num_cols;
                num_cols += block.manifold.local_dim(block.values.len());
            }
        }
        let num_rows: usize = self.residuals.iter().map(|r| r.cost.num_residuals()).sum();

        let initial_cost = self.total_cost();
        if num_cols == 0 || num_rows == 0 {
            return SolverSummary {
                iterations: 0,
                initial_cost,
                final_cost: initial_cost,
            };
        }

        let mut lambda = options.initial_lambda;
        let mut current_cost = initial_cost;
        let mut iterations = 0;

        for _ in 0..options.max_iterations {
            if start.elapsed() > options.max_solver_time {
                break;
            }
            iterations += 1;

            let (jacobian, residual) = self.linearize(num_rows, num_cols, &col_offset);

            let gradient = jacobian.transpose() * &residual;
            if gradient.amax() < 1e-10 {
                break;
            }
            let hessian = jacobian.transpose() * &jacobian;

            // Damped step; retry with a larger lambda on failure.
            let mut stepped = false;
            for _ in 0..5 {
                let mut damped = hessian.clone();
                for i in 0..num_cols {
                    damped[(i, i)] += lambda * damped[(i, i)].max(1e-8);
                }
                let delta = match damped.lu().solve(&(-&gradient)) {
                    Some(d) => d,
                    None => {
                        lambda = (lambda * 10.0).min(1e8);
                        continue;
                    }
                };

                let saved: Vec<Vec<f64>> =
                    self.blocks.iter().map(|b| b.values.clone()).collect();
                self.apply_step(&delta, &col_offset);
                let trial_cost = self.total_cost();

                if trial_cost.is_finite() && trial_cost < current_cost {
                    current_cost = trial_cost;
                    lambda = (lambda * 0.3).max(1e-12);
                    stepped = true;
                    break;
                }
                // Reject: restore and increase damping.
                for (block, old) in self.blocks.iter_mut().zip(saved) {
                    block.values = old;
                }
                lambda = (lambda * 10.0).min(1e8);
            }
            if !stepped {
                break;
            }
        }

        let final_cost = current_cost;
        debug!(
            iterations,
            initial_cost, final_cost, "solver finished"
        );
        SolverSummary {
            iterations,
            initial_cost,
            final_cost,
        }
    }

    fn apply_step(&mut self, delta: &DVector<f64>, col_offset: &[usize]) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.constant {
                continue;
            }
            let dim = block.manifold.local_dim(block.values.len());
            let local = delta.rows(col_offset[i], dim).iter().copied().collect::<Vec<_>>();
            block.manifold.plus(&mut block.values, &local);
        }
    }

    fn total_cost(&self) -> f64 {
        let mut cost = 0.0;
        for rb in &self.residuals {
            let params: Vec<&[f64]> = rb
                .block_indices
                .iter()
                .map(|&i| self.blocks[i].values.as_slice())
                .collect();
            let mut r = vec![0.0; rb.cost.num_residuals()];
            if !rb.cost.evaluate(&params, &mut r, None) {
                continue;
            }
            let sq: f64 = r.iter().map(|v| v * v).sum();
            let w = rb.loss.map_or(1.0, |l| l.weight(sq));
            cost += w * w * sq;
        }
        0.5 * cost
    }

    fn linearize(
        &self,
        num_rows: usize,
        num_cols: usize,
        col_offset: &[usize],
    ) -> (DMatrix<f64>, DVector<f64>) {
        let mut jacobian = DMatrix::zeros(num_rows, num_cols);
        let mut residual = DVector::zeros(num_rows);

        let mut row = 0;
        for rb in &self.residuals {
            let dim = rb.cost.num_residuals();
            let params: Vec<&[f64]> = rb
                .block_indices
                .iter()
                .map(|&i| self.blocks[i].values.as_slice())
                .collect();

            let local_dims = rb.cost.local_dims();
            let mut jacs: Vec<DMatrix<f64>> = local_dims
                .iter()
                .map(|&d| DMatrix::zeros(dim, d))
                .collect();
            let mut r = vec![0.0; dim];
            if !rb.cost.evaluate(&params, &mut r, Some(&mut jacs)) {
                row += dim;
                continue;
            }

            let sq: f64 = r.iter().map(|v| v * v).sum();
            let w = rb.loss.map_or(1.0, |l| l.weight(sq));

            for (k, v) in r.iter().enumerate() {
                residual[row + k] = w * v;
            }
            for (jac, &block_idx) in jacs.iter().zip(&rb.block_indices) {
                let block = &self.blocks[block_idx];
                if block.constant {
                    continue;
                }
                let col = col_offset[block_idx];
                for rr in 0..dim {
                    for cc in 0..jac.ncols() {
                        jacobian[(row + rr, col + cc)] = w * jac[(rr, cc)];
                    }
                }
            }
            row += dim;
        }
        (jacobian, residual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::problem::{CostFunction, Manifold};

    /// r = x - target, one Euclidean block.
    struct TargetCost {
        target: Vec<f64>,
    }

    impl CostFunction for TargetCost {
        fn num_residuals(&self) -> usize {
            self.target.len()
        }
        fn local_dims(&self) -> Vec<usize> {
            vec![self.target.len()]
        }
        fn evaluate(
            &self,
            params: &[&[f64]],
            residuals: &mut [f64],
            jacobians: Option<&mut [DMatrix<f64>]>,
        ) -> bool {
            for (i, r) in residuals.iter_mut().enumerate() {
                *r = params[0][i] - self.target[i];
            }
            if let Some(jacs) = jacobians {
                jacs[0] = DMatrix::identity(self.target.len(), self.target.len());
            }
            true
        }
    }

    #[test]
    fn test_converges_to_target() {
        let mut problem: Problem<u32> = Problem::new();
        problem.add_parameter_block(0, &[5.0, -3.0], Manifold::Euclidean);
        problem.add_residual_block(
            Box::new(TargetCost {
                target: vec![1.0, 2.0],
            }),
            None,
            &[0],
        );
        let summary = problem.solve(&SolverOptions::default());
        assert!(summary.final_cost < 1e-12);
        let x = problem.get(0).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-6);
        assert!((x[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_block_is_untouched() {
        let mut problem: Problem<u32> = Problem::new();
        problem.add_parameter_block(0, &[5.0], Manifold::Euclidean);
        problem.set_parameter_block_constant(0);
        problem.add_residual_block(
            Box::new(TargetCost { target: vec![0.0] }),
            None,
            &[0],
        );
        let summary = problem.solve(&SolverOptions::default());
        assert_eq!(problem.get(0).unwrap()[0], 5.0);
        assert_eq!(summary.iterations, 0);
    }

    #[test]
    fn test_two_blocks_pulled_together() {
        /// r = x - y over two scalar blocks.
        struct Coupling;
        impl CostFunction for Coupling {
            fn num_residuals(&self) -> usize {
                1
            }
            fn local_dims(&self) -> Vec<usize> {
                vec![1, 1]
            }
            fn evaluate(
                &self,
                params: &[&[f64]],
                residuals: &mut [f64],
                jacobians: Option<&mut [DMatrix<f64>]>,
            ) -> bool {
                residuals[0] = params[0][0] - params[1][0];
                if let Some(jacs) = jacobians {
                    jacs[0][(0, 0)] = 1.0;
                    jacs[1][(0, 0)] = -1.0;
                }
                true
            }
        }

        let mut problem: Problem<u32> = Problem::new();
        problem.add_parameter_block(0, &[4.0], Manifold::Euclidean);
        problem.add_parameter_block(1, &[0.0], Manifold::Euclidean);
        problem.set_parameter_block_constant(1);
        problem.add_residual_block(Box::new(Coupling), None, &[0, 1]);
        problem.solve(&SolverOptions::default());
        assert!((problem.get(0).unwrap()[0]).abs() < 1e-6);
    }
}
