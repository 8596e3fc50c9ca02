use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::TrajOptError;
use crate::loss::LossFn;
use crate::mapping::MappingRegistry;
use crate::multi_shot::{MultiShot, SparsityStructure};
use crate::rollout::{OwnedRollout, Rollout};
use crate::simulator::Simulator;
use crate::single_shot::SingleShot;

/// The exact contract an outer solver drives (§4.6). State machine is
/// trivial: constructed, repeatedly evaluated, destroyed.
pub trait Problem {
    fn flat_dim(&self) -> usize;
    fn constraint_dim(&self) -> usize;

    fn flatten(&self) -> DVector<f64>;
    fn unflatten(&mut self, x: &DVector<f64>);

    fn upper_bounds(&self) -> DVector<f64>;
    fn lower_bounds(&self) -> DVector<f64>;
    fn constraint_upper_bounds(&self) -> DVector<f64>;
    fn constraint_lower_bounds(&self) -> DVector<f64>;

    fn initial_guess(&self) -> DVector<f64>;

    fn compute_loss(&mut self) -> Result<f64, TrajOptError>;
    fn backprop_gradient(&mut self) -> Result<DVector<f64>, TrajOptError>;
    fn compute_constraints(&mut self) -> Result<DVector<f64>, TrajOptError>;
    fn backprop_jacobian(&mut self) -> Result<DMatrix<f64>, TrajOptError>;

    fn number_nonzero_jacobian(&self) -> usize;
    fn jacobian_sparsity_structure(&self) -> (Vec<usize>, Vec<usize>);
    fn get_sparse_jacobian(&mut self) -> Result<Vec<f64>, TrajOptError>;
}

/// A single-shot on its own, as a standalone `Problem` — `constraintDim` is
/// trivially zero (§4.6). Owns the primary simulator the shot's operations
/// are driven against.
pub struct SingleShotProblem {
    shot: SingleShot,
    sim: Box<dyn Simulator>,
    registry: Arc<MappingRegistry>,
    loss: LossFn,
}

impl SingleShotProblem {
    pub fn new(
        sim: Box<dyn Simulator>,
        registry: Arc<MappingRegistry>,
        loss: LossFn,
        steps: usize,
        tune_starting_state: bool,
    ) -> Self {
        let representation = registry.representation();
        let rep_pos_dim = representation.pos_dim(sim.as_ref());
        let rep_vel_dim = representation.vel_dim(sim.as_ref());
        let force_dim = representation.force_dim(sim.as_ref());
        let shot = SingleShot::new(steps, tune_starting_state, rep_pos_dim, rep_vel_dim, force_dim, 0, false);
        Self { shot, sim, registry, loss }
    }

    pub fn shot(&self) -> &SingleShot {
        &self.shot
    }

    fn roll(&mut self) -> Result<(OwnedRollout, Vec<crate::simulator::BackpropSnapshot>), TrajOptError> {
        let representation = self.registry.representation();
        self.shot.unroll(self.sim.as_mut(), &self.registry, representation.as_ref())
    }
}

impl Problem for SingleShotProblem {
    fn flat_dim(&self) -> usize {
        self.shot.flat_dim()
    }
    fn constraint_dim(&self) -> usize {
        0
    }

    fn flatten(&self) -> DVector<f64> {
        self.shot.flatten()
    }
    fn unflatten(&mut self, x: &DVector<f64>) {
        self.shot.unflatten(x);
    }

    fn upper_bounds(&self) -> DVector<f64> {
        self.shot.bounds(self.sim.as_ref()).1
    }
    fn lower_bounds(&self) -> DVector<f64> {
        self.shot.bounds(self.sim.as_ref()).0
    }
    fn constraint_upper_bounds(&self) -> DVector<f64> {
        DVector::zeros(0)
    }
    fn constraint_lower_bounds(&self) -> DVector<f64> {
        DVector::zeros(0)
    }

    fn initial_guess(&self) -> DVector<f64> {
        self.shot.flatten()
    }

    fn compute_loss(&mut self) -> Result<f64, TrajOptError> {
        let (rollout, _) = self.roll()?;
        Ok(self.loss.value(&Rollout::Owned(&rollout)))
    }

    fn backprop_gradient(&mut self) -> Result<DVector<f64>, TrajOptError> {
        let (rollout, snapshots) = self.roll()?;
        let mapping_names: Vec<String> = self.registry.names().map(str::to_string).collect();
        let (_, grad_rollout) = self.loss.gradient(&rollout, &mapping_names);
        let representation_name = self.registry.representation_name().to_string();
        let grad_pos = grad_rollout.poses(&representation_name).columns(0, self.shot.steps()).into_owned();
        let grad_vel = grad_rollout.vels(&representation_name).columns(0, self.shot.steps()).into_owned();
        let grad_force = grad_rollout.forces(&representation_name).columns(0, self.shot.steps()).into_owned();
        Ok(self.shot.gradient_backprop(&snapshots, &grad_pos, &grad_vel, &grad_force))
    }

    fn compute_constraints(&mut self) -> Result<DVector<f64>, TrajOptError> {
        Ok(DVector::zeros(0))
    }

    fn backprop_jacobian(&mut self) -> Result<DMatrix<f64>, TrajOptError> {
        Ok(DMatrix::zeros(0, self.flat_dim()))
    }

    fn number_nonzero_jacobian(&self) -> usize {
        0
    }
    fn jacobian_sparsity_structure(&self) -> (Vec<usize>, Vec<usize>) {
        (Vec::new(), Vec::new())
    }
    fn get_sparse_jacobian(&mut self) -> Result<Vec<f64>, TrajOptError> {
        Ok(Vec::new())
    }
}

impl Problem for MultiShot {
    fn flat_dim(&self) -> usize {
        MultiShot::flat_dim(self)
    }
    fn constraint_dim(&self) -> usize {
        MultiShot::constraint_dim(self)
    }

    fn flatten(&self) -> DVector<f64> {
        MultiShot::flatten(self)
    }
    fn unflatten(&mut self, x: &DVector<f64>) {
        MultiShot::unflatten(self, x)
    }

    fn upper_bounds(&self) -> DVector<f64> {
        MultiShot::bounds(self).1
    }
    fn lower_bounds(&self) -> DVector<f64> {
        MultiShot::bounds(self).0
    }
    fn constraint_upper_bounds(&self) -> DVector<f64> {
        MultiShot::constraint_bounds(self).1
    }
    fn constraint_lower_bounds(&self) -> DVector<f64> {
        MultiShot::constraint_bounds(self).0
    }

    fn initial_guess(&self) -> DVector<f64> {
        MultiShot::initial_guess(self)
    }

    fn compute_loss(&mut self) -> Result<f64, TrajOptError> {
        MultiShot::compute_loss(self)
    }
    fn backprop_gradient(&mut self) -> Result<DVector<f64>, TrajOptError> {
        MultiShot::backprop_gradient(self).map(|(_, g)| g)
    }
    fn compute_constraints(&mut self) -> Result<DVector<f64>, TrajOptError> {
        MultiShot::compute_constraints(self)
    }
    fn backprop_jacobian(&mut self) -> Result<DMatrix<f64>, TrajOptError> {
        MultiShot::backprop_jacobian(self)
    }

    fn number_nonzero_jacobian(&self) -> usize {
        MultiShot::number_nonzero_jacobian(self)
    }
    fn jacobian_sparsity_structure(&self) -> (Vec<usize>, Vec<usize>) {
        let SparsityStructure { rows, cols } = MultiShot::jacobian_sparsity_structure(self).clone();
        (rows, cols)
    }
    fn get_sparse_jacobian(&mut self) -> Result<Vec<f64>, TrajOptError> {
        MultiShot::get_sparse_jacobian(self)
    }
}
