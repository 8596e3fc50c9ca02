use std::sync::{Arc, OnceLock};

use nalgebra::{DMatrix, DVector};

use crate::error::TrajOptError;
use crate::loss::LossFn;
use crate::mapping::MappingRegistry;
use crate::rollout::{OwnedRollout, Rollout};
use crate::simulator::{BackpropSnapshot, ScopedSimulatorState, Simulator};
use crate::single_shot::SingleShot;

/// Centered finite-difference step for the mass block, adaptively scaled
/// like the force-column step in `loss.rs`: neither `BackpropSnapshot` nor
/// `LossFn` expose an analytic derivative with respect to mass, so this is
/// the only source of gradient/Jacobian signal on those columns.
const MASS_FD_STEP: f64 = 1e-7;

fn set_block(dst: &mut DMatrix<f64>, row0: usize, col0: usize, src: &DMatrix<f64>) {
    for r in 0..src.nrows() {
        for c in 0..src.ncols() {
            dst[(row0 + r, col0 + c)] = src[(r, c)];
        }
    }
}

/// Row/column index arrays for the multi-shot Jacobian's sparsity pattern.
/// Computed once and reused; values are recomputed every call (§4.5).
#[derive(Debug, Clone)]
pub struct SparsityStructure {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
}

/// `N` single-shots chained by knot-point defect constraints, sharing one
/// representation mapping and (optionally) one mass-tuning block (§3, §4.5).
///
/// Mass tuning is attached here rather than duplicated per sub-shot: mass is
/// a physical constant shared across the whole trajectory, not a per-segment
/// decision variable, so member shots are always constructed with
/// `num_mass_params = 0` (see `DESIGN.md`).
pub struct MultiShot {
    shots: Vec<SingleShot>,
    sim: Box<dyn Simulator>,
    registry: Arc<MappingRegistry>,
    loss: LossFn,
    parent_constraints: Vec<LossFn>,
    tune_mass: bool,
    mass_params: DVector<f64>,
    parallel: bool,
    sparsity: OnceLock<SparsityStructure>,
}

impl MultiShot {
    /// Builds shots of sizes `[shotLength, ..., remainder]` (§4.5). Only the
    /// first shot's `tuneStartingState` follows the caller; every later shot
    /// is forced on, since its start state is a decision variable tied to
    /// the preceding shot's defect.
    pub fn new(
        sim: Box<dyn Simulator>,
        registry: Arc<MappingRegistry>,
        loss: LossFn,
        total_steps: usize,
        shot_length: usize,
        tune_starting_state: bool,
    ) -> Self {
        assert!(shot_length > 0, "shot_length must be positive");
        assert!(total_steps > 0, "total_steps must be positive");

        let num_shots = total_steps.div_ceil(shot_length);
        let remainder = total_steps - shot_length * (num_shots - 1);

        let representation = registry.representation();
        let rep_pos_dim = representation.pos_dim(sim.as_ref());
        let rep_vel_dim = representation.vel_dim(sim.as_ref());
        let force_dim = representation.force_dim(sim.as_ref());

        let mut shots = Vec::with_capacity(num_shots);
        for i in 0..num_shots {
            let steps_i = if i + 1 == num_shots { remainder } else { shot_length };
            let tune_start_i = if i == 0 { tune_starting_state } else { true };
            shots.push(SingleShot::new(steps_i, tune_start_i, rep_pos_dim, rep_vel_dim, force_dim, 0, false));
        }

        Self {
            shots,
            sim,
            registry,
            loss,
            parent_constraints: Vec::new(),
            tune_mass: false,
            mass_params: DVector::zeros(0),
            parallel: false,
            sparsity: OnceLock::new(),
        }
    }

    pub fn with_parent_constraint(mut self, constraint: LossFn) -> Self {
        self.parent_constraints.push(constraint);
        self
    }

    pub fn with_mass_tuning(mut self) -> Self {
        self.tune_mass = true;
        self.mass_params = self.sim.mass_params();
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn shots(&self) -> &[SingleShot] {
        &self.shots
    }

    pub fn total_steps(&self) -> usize {
        self.shots.iter().map(SingleShot::steps).sum()
    }

    fn state_dim(&self) -> usize {
        let representation = self.registry.representation();
        representation.pos_dim(self.sim.as_ref()) + representation.vel_dim(self.sim.as_ref())
    }

    fn defect_pairs(&self) -> usize {
        self.shots.len().saturating_sub(1)
    }

    fn shot_flat_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.shots.len() + 1);
        let mut acc = 0;
        for shot in &self.shots {
            offsets.push(acc);
            acc += shot.flat_dim();
        }
        offsets.push(acc);
        offsets
    }

    fn mass_block_offset(&self) -> usize {
        self.shot_flat_offsets().last().copied().unwrap_or(0)
    }

    pub fn flat_dim(&self) -> usize {
        self.mass_block_offset() + if self.tune_mass { self.mass_params.len() } else { 0 }
    }

    pub fn constraint_dim(&self) -> usize {
        self.parent_constraints.len() + self.defect_pairs() * self.state_dim()
    }

    /// Constraint bound vectors: each parent constraint's own `[lower,
    /// upper]` (defaulting to `(0, 0)` — equality — when unset), followed by
    /// zero for every defect component, since knot defects must vanish.
    pub fn constraint_bounds(&self) -> (DVector<f64>, DVector<f64>) {
        let mut lo = DVector::zeros(self.constraint_dim());
        let mut hi = DVector::zeros(self.constraint_dim());
        for (i, constraint) in self.parent_constraints.iter().enumerate() {
            let (l, u) = constraint.bounds().unwrap_or((0.0, 0.0));
            lo[i] = l;
            hi[i] = u;
        }
        (lo, hi)
    }

    pub fn flatten(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.flat_dim());
        let offsets = self.shot_flat_offsets();
        for (i, shot) in self.shots.iter().enumerate() {
            x.rows_mut(offsets[i], shot.flat_dim()).copy_from(&shot.flatten());
        }
        if self.tune_mass {
            x.rows_mut(self.mass_block_offset(), self.mass_params.len())
                .copy_from(&self.mass_params);
        }
        x
    }

    pub fn unflatten(&mut self, x: &DVector<f64>) {
        debug_assert_eq!(x.len(), self.flat_dim());
        let offsets = self.shot_flat_offsets();
        for (i, shot) in self.shots.iter_mut().enumerate() {
            let dim = shot.flat_dim();
            shot.unflatten(&x.rows(offsets[i], dim).into_owned());
        }
        if self.tune_mass {
            self.mass_params = x.rows(self.mass_block_offset(), self.mass_params.len()).into_owned();
        }
    }

    pub fn bounds(&self) -> (DVector<f64>, DVector<f64>) {
        let mut lo = DVector::zeros(self.flat_dim());
        let mut hi = DVector::zeros(self.flat_dim());
        let offsets = self.shot_flat_offsets();
        for (i, shot) in self.shots.iter().enumerate() {
            let (shot_lo, shot_hi) = shot.bounds(self.sim.as_ref());
            lo.rows_mut(offsets[i], shot.flat_dim()).copy_from(&shot_lo);
            hi.rows_mut(offsets[i], shot.flat_dim()).copy_from(&shot_hi);
        }
        if self.tune_mass {
            lo.rows_mut(self.mass_block_offset(), self.mass_params.len())
                .copy_from(&self.sim.mass_param_lower_bounds());
            hi.rows_mut(self.mass_block_offset(), self.mass_params.len())
                .copy_from(&self.sim.mass_param_upper_bounds());
        }
        (lo, hi)
    }

    fn unroll_all(&mut self) -> Result<Vec<(OwnedRollout, Vec<BackpropSnapshot>)>, TrajOptError> {
        if self.tune_mass {
            self.sim.set_mass_params(&self.mass_params);
        }
        if self.parallel {
            self.unroll_all_parallel()
        } else {
            self.unroll_all_serial()
        }
    }

    fn unroll_all_serial(&mut self) -> Result<Vec<(OwnedRollout, Vec<BackpropSnapshot>)>, TrajOptError> {
        let representation = self.registry.representation();
        let mut out = Vec::with_capacity(self.shots.len());
        for shot in &self.shots {
            out.push(shot.unroll(self.sim.as_mut(), &self.registry, representation.as_ref())?);
        }
        Ok(out)
    }

    /// Each shot unrolls against an independent `clone_boxed()` simulator on
    /// its own Rayon task; outputs land in statically-known, disjoint slots
    /// so the result is bit-identical to the serial path (§4.5, §5).
    fn unroll_all_parallel(&mut self) -> Result<Vec<(OwnedRollout, Vec<BackpropSnapshot>)>, TrajOptError> {
        let representation = self.registry.representation();
        let registry = &self.registry;
        let primary = self.sim.as_ref();

        let mut results: Vec<Option<Result<(OwnedRollout, Vec<BackpropSnapshot>), TrajOptError>>> =
            (0..self.shots.len()).map(|_| None).collect();

        {
            let slots: Vec<_> = results.iter_mut().collect();
            rayon::scope(|scope| {
                for (shot, slot) in self.shots.iter().zip(slots) {
                    let mut clone = primary.clone_boxed();
                    let representation = representation.clone();
                    scope.spawn(move |_| {
                        *slot = Some(shot.unroll(clone.as_mut(), registry, representation.as_ref()));
                    });
                }
            });
        }

        results
            .into_iter()
            .map(|slot| slot.expect("every shot slot is written by rayon::scope before it returns"))
            .collect()
    }

    fn stitch_rollout(&self, per_shot: &[(OwnedRollout, Vec<BackpropSnapshot>)]) -> OwnedRollout {
        let total = self.total_steps();
        let mut combined = OwnedRollout::new(&self.registry, self.sim.as_ref(), total);
        let mut col = 0;
        for (rollout, _) in per_shot {
            for name in self.registry.names() {
                combined.poses_mut(name).columns_mut(col, rollout.cols()).copy_from(&rollout.poses(name));
                combined.vels_mut(name).columns_mut(col, rollout.cols()).copy_from(&rollout.vels(name));
                combined.forces_mut(name).columns_mut(col, rollout.cols()).copy_from(&rollout.forces(name));
            }
            col += rollout.cols();
        }
        if self.tune_mass {
            combined.masses_mut().copy_from(&self.mass_params);
        }
        combined
    }

    /// `getStates`, with-knots variant: each shot's own recorded trajectory,
    /// concatenated in order — defects between shots are not closed (§4.5).
    pub fn get_states_with_knots(&mut self) -> Result<OwnedRollout, TrajOptError> {
        let per_shot = self.unroll_all()?;
        Ok(self.stitch_rollout(&per_shot))
    }

    /// `getStates`, without-knots variant: replays every stored force in one
    /// continuous simulation from the first shot's start state, ignoring
    /// each later shot's own (possibly inconsistent) start state. Useful for
    /// visualizing what the solver sees once defects close (§4.5).
    pub fn get_states_without_knots(&mut self) -> Result<OwnedRollout, TrajOptError> {
        let representation = self.registry.representation();
        let first_start_pos = self.shots[0].start_pos().clone();
        let first_start_vel = self.shots[0].start_vel().clone();
        let mass_params = self.mass_params.clone();
        let tune_mass = self.tune_mass;
        let total = self.total_steps();

        let mut guard = ScopedSimulatorState::new(self.sim.as_mut());
        if tune_mass {
            guard.sim_mut().set_mass_params(&mass_params);
        }
        representation.write_pos(guard.sim_mut(), &first_start_pos);
        representation.write_vel(guard.sim_mut(), &first_start_vel);

        let mut rollout = OwnedRollout::new(&self.registry, guard.sim(), total);
        let mut col = 0;
        for shot in &self.shots {
            for t in 0..shot.steps() {
                let force_t = shot.forces().column(t).into_owned();
                representation.write_force(guard.sim_mut(), &force_t);
                guard.sim_mut().step().map_err(|e| match e {
                    TrajOptError::SimulatorStep { source, .. } => TrajOptError::SimulatorStep { t: col, source },
                    other => other,
                })?;
                for name in self.registry.names() {
                    let mapping = self.registry.get(name);
                    let pos = mapping.read_pos(guard.sim());
                    let vel = mapping.read_vel(guard.sim());
                    let force = mapping.read_force(guard.sim());
                    rollout.poses_mut(name).column_mut(col).copy_from(&pos);
                    rollout.vels_mut(name).column_mut(col).copy_from(&vel);
                    rollout.forces_mut(name).column_mut(col).copy_from(&force);
                }
                col += 1;
            }
        }
        Ok(rollout)
    }

    pub fn compute_loss(&mut self) -> Result<f64, TrajOptError> {
        let per_shot = self.unroll_all()?;
        let stitched = self.stitch_rollout(&per_shot);
        Ok(self.loss.value(&Rollout::Owned(&stitched)))
    }

    pub fn compute_constraints(&mut self) -> Result<DVector<f64>, TrajOptError> {
        let per_shot = self.unroll_all()?;
        let stitched = self.stitch_rollout(&per_shot);
        let mut out = DVector::zeros(self.constraint_dim());

        for (i, constraint) in self.parent_constraints.iter().enumerate() {
            out[i] = constraint.value(&Rollout::Owned(&stitched));
        }

        let base = self.parent_constraints.len();
        let state_dim = self.state_dim();
        let representation_name = self.registry.representation_name().to_string();
        for pair in 0..self.defect_pairs() {
            let (rollout_i, _) = &per_shot[pair];
            let last = rollout_i.cols() - 1;
            let final_pos = rollout_i.poses(&representation_name).column(last).into_owned();
            let final_vel = rollout_i.vels(&representation_name).column(last).into_owned();
            let next = &self.shots[pair + 1];
            let defect_pos = &final_pos - next.start_pos();
            let defect_vel = &final_vel - next.start_vel();

            let row0 = base + pair * state_dim;
            out.rows_mut(row0, final_pos.len()).copy_from(&defect_pos);
            out.rows_mut(row0 + final_pos.len(), final_vel.len()).copy_from(&defect_vel);
        }

        Ok(out)
    }

    pub fn backprop_gradient(&mut self) -> Result<(f64, DVector<f64>), TrajOptError> {
        let per_shot = self.unroll_all()?;
        let stitched = self.stitch_rollout(&per_shot);
        let mapping_names: Vec<String> = self.registry.names().map(str::to_string).collect();
        let (loss, grad_rollout) = self.loss.gradient(&stitched, &mapping_names);

        let representation_name = self.registry.representation_name().to_string();
        let offsets = self.shot_flat_offsets();
        let mut out = DVector::zeros(self.flat_dim());

        let mut col = 0;
        for (i, (_, snapshots)) in per_shot.iter().enumerate() {
            let steps = self.shots[i].steps();
            let grad_pos = grad_rollout.poses(&representation_name).columns(col, steps).into_owned();
            let grad_vel = grad_rollout.vels(&representation_name).columns(col, steps).into_owned();
            let grad_force = grad_rollout.forces(&representation_name).columns(col, steps).into_owned();
            let shot_grad = self.shots[i].gradient_backprop(snapshots, &grad_pos, &grad_vel, &grad_force);
            out.rows_mut(offsets[i], shot_grad.len()).copy_from(&shot_grad);
            col += steps;
        }

        if self.tune_mass {
            let mass_grad = self.mass_gradient_fd()?;
            let offset = self.mass_block_offset();
            out.rows_mut(offset, mass_grad.len()).copy_from(&mass_grad);
        }

        Ok((loss, out))
    }

    /// Centered finite difference of `compute_loss` with respect to each
    /// mass parameter, one parameter at a time (§4.6's `backpropGradient`
    /// still owes the solver a mass-column entry even though the dynamics
    /// Jacobians in `BackpropSnapshot` carry no mass sensitivity).
    fn mass_gradient_fd(&mut self) -> Result<DVector<f64>, TrajOptError> {
        let original = self.mass_params.clone();
        let mut grad = DVector::zeros(original.len());

        for i in 0..original.len() {
            let step = MASS_FD_STEP * original[i].abs().max(1.0);

            let mut plus = original.clone();
            plus[i] += step;
            self.mass_params = plus;
            let loss_plus = self.compute_loss()?;

            let mut minus = original.clone();
            minus[i] -= step;
            self.mass_params = minus;
            let loss_minus = self.compute_loss()?;

            grad[i] = (loss_plus - loss_minus) / (2.0 * step);
        }

        self.mass_params = original.clone();
        self.sim.set_mass_params(&original);
        Ok(grad)
    }

    /// Dense `constraintDim x flatDim` Jacobian: parent constraints get a
    /// backprop-through-every-shot row each; defect pairs get the two
    /// column bands described in §4.5.
    pub fn backprop_jacobian(&mut self) -> Result<DMatrix<f64>, TrajOptError> {
        let per_shot = self.unroll_all()?;
        let stitched = self.stitch_rollout(&per_shot);
        let mapping_names: Vec<String> = self.registry.names().map(str::to_string).collect();
        let representation_name = self.registry.representation_name().to_string();
        let offsets = self.shot_flat_offsets();

        let mut jac = DMatrix::zeros(self.constraint_dim(), self.flat_dim());

        for (row, constraint) in self.parent_constraints.iter().enumerate() {
            let (_, grad_rollout) = constraint.gradient(&stitched, &mapping_names);
            let mut col = 0;
            for (i, (_, snapshots)) in per_shot.iter().enumerate() {
                let steps = self.shots[i].steps();
                let grad_pos = grad_rollout.poses(&representation_name).columns(col, steps).into_owned();
                let grad_vel = grad_rollout.vels(&representation_name).columns(col, steps).into_owned();
                let grad_force = grad_rollout.forces(&representation_name).columns(col, steps).into_owned();
                let shot_grad = self.shots[i].gradient_backprop(snapshots, &grad_pos, &grad_vel, &grad_force);
                for (k, value) in shot_grad.iter().enumerate() {
                    jac[(row, offsets[i] + k)] = *value;
                }
                col += steps;
            }
        }

        let base = self.parent_constraints.len();
        let state_dim = self.state_dim();
        for pair in 0..self.defect_pairs() {
            let (_, snapshots_i) = &per_shot[pair];
            let shot_i_jac = self.shots[pair].final_state_jacobian(snapshots_i);
            let row0 = base + pair * state_dim;
            set_block(&mut jac, row0, offsets[pair], &shot_i_jac);

            let next_start_col = offsets[pair + 1];
            for d in 0..state_dim {
                jac[(row0 + d, next_start_col + d)] = -1.0;
            }
        }

        if self.tune_mass {
            let mass_jac = self.mass_jacobian_fd()?;
            let offset = self.mass_block_offset();
            set_block(&mut jac, 0, offset, &mass_jac);
        }

        Ok(jac)
    }

    /// Centered finite difference of `compute_constraints` with respect to
    /// each mass parameter, column by column — the Jacobian counterpart of
    /// `mass_gradient_fd`. Defect rows genuinely depend on mass (it changes
    /// the dynamics each shot integrates through), so this is not just a
    /// parent-constraint concern.
    fn mass_jacobian_fd(&mut self) -> Result<DMatrix<f64>, TrajOptError> {
        let original = self.mass_params.clone();
        let mut jac = DMatrix::zeros(self.constraint_dim(), original.len());

        for i in 0..original.len() {
            let step = MASS_FD_STEP * original[i].abs().max(1.0);

            let mut plus = original.clone();
            plus[i] += step;
            self.mass_params = plus;
            let c_plus = self.compute_constraints()?;

            let mut minus = original.clone();
            minus[i] -= step;
            self.mass_params = minus;
            let c_minus = self.compute_constraints()?;

            let d = (c_plus - c_minus) / (2.0 * step);
            jac.column_mut(i).copy_from(&d);
        }

        self.mass_params = original.clone();
        self.sim.set_mass_params(&original);
        Ok(jac)
    }

    fn compute_sparsity(&self) -> SparsityStructure {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let offsets = self.shot_flat_offsets();

        for row in 0..self.parent_constraints.len() {
            for col in 0..self.flat_dim() {
                rows.push(row);
                cols.push(col);
            }
        }

        let base = self.parent_constraints.len();
        let state_dim = self.state_dim();
        for pair in 0..self.defect_pairs() {
            let flat_dim_i = self.shots[pair].flat_dim();
            let row0 = base + pair * state_dim;
            for d in 0..state_dim {
                for c in 0..flat_dim_i {
                    rows.push(row0 + d);
                    cols.push(offsets[pair] + c);
                }
            }
            let next_start_col = offsets[pair + 1];
            for d in 0..state_dim {
                rows.push(row0 + d);
                cols.push(next_start_col + d);
            }
        }

        SparsityStructure { rows, cols }
    }

    pub fn jacobian_sparsity_structure(&self) -> &SparsityStructure {
        self.sparsity.get_or_init(|| self.compute_sparsity())
    }

    pub fn number_nonzero_jacobian(&self) -> usize {
        self.jacobian_sparsity_structure().rows.len()
    }

    /// Scatters the dense Jacobian into the declared sparsity pattern. Not
    /// the fastest possible sparse assembly, but by construction it can
    /// never disagree with `backprop_jacobian` — Testable Property 5.
    pub fn get_sparse_jacobian(&mut self) -> Result<Vec<f64>, TrajOptError> {
        let dense = self.backprop_jacobian()?;
        let structure = self.jacobian_sparsity_structure().clone();
        Ok(structure.rows.iter().zip(&structure.cols).map(|(&r, &c)| dense[(r, c)]).collect())
    }

    pub fn initial_guess(&self) -> DVector<f64> {
        self.flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shot(steps: usize, tune_start: bool) -> SingleShot {
        SingleShot::new(steps, tune_start, 2, 2, 1, 0, false)
    }

    #[test]
    fn defect_is_zero_when_states_replicated() {
        let mut shot_a = test_shot(2, true);
        shot_a.set_start_state(DVector::from_vec(vec![0.0, 0.0]), DVector::from_vec(vec![0.0, 0.0]));

        let mut shot_b = test_shot(2, true);
        // Replicate shot_a's start state exactly; with zero forces and a
        // trivial (identity) dynamics stand-in the final state equals the
        // start state, so the defect against shot_b is exactly zero.
        shot_b.set_start_state(shot_a.start_pos().clone(), shot_a.start_vel().clone());

        let defect_pos = shot_a.start_pos() - shot_b.start_pos();
        let defect_vel = shot_a.start_vel() - shot_b.start_vel();
        assert_eq!(defect_pos.norm(), 0.0);
        assert_eq!(defect_vel.norm(), 0.0);
    }
}
