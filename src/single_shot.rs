use nalgebra::{DMatrix, DVector};

use crate::error::TrajOptError;
use crate::mapping::{Mapping, MappingRegistry};
use crate::rollout::OwnedRollout;
use crate::simulator::{BackpropSnapshot, ScopedSimulatorState, Simulator};

fn set_block(dst: &mut DMatrix<f64>, row0: usize, col0: usize, src: &DMatrix<f64>) {
    for r in 0..src.nrows() {
        for c in 0..src.ncols() {
            dst[(row0 + r, col0 + c)] = src[(r, c)];
        }
    }
}

/// `transfer * [[pos_pos, pos_vel], [vel_pos, vel_vel]]`: advances the
/// running `d(final)/d(pos_t, vel_t)` pair one step further back.
fn transfer_update(transfer: &DMatrix<f64>, snap: &BackpropSnapshot, rep_dim: usize) -> DMatrix<f64> {
    let mut j = DMatrix::zeros(2 * rep_dim, 2 * rep_dim);
    set_block(&mut j, 0, 0, &snap.pos_pos);
    set_block(&mut j, 0, rep_dim, &snap.pos_vel);
    set_block(&mut j, rep_dim, 0, &snap.vel_pos);
    set_block(&mut j, rep_dim, rep_dim, &snap.vel_vel);
    transfer * j
}

/// `transfer * [pos_force; vel_force]`: this step's force contribution to
/// the final-state Jacobian, through the running transfer pair.
fn transfer_force_block(transfer: &DMatrix<f64>, snap: &BackpropSnapshot, rep_dim: usize) -> DMatrix<f64> {
    let force_dim = snap.pos_force.ncols();
    let mut jf = DMatrix::zeros(2 * rep_dim, force_dim);
    set_block(&mut jf, 0, 0, &snap.pos_force);
    set_block(&mut jf, rep_dim, 0, &snap.vel_force);
    transfer * jf
}

/// One contiguous simulated trajectory segment: a start state (optionally
/// tunable) in the representation mapping's coordinates, driven forward by
/// per-step forces (§3, §4.4). Holds no reference to a simulator — the
/// owning `Problem` supplies one to each call, matching §5's "the primary
/// simulator is owned by the problem".
#[derive(Clone)]
pub struct SingleShot {
    steps: usize,
    tune_starting_state: bool,
    start_pos: DVector<f64>,
    start_vel: DVector<f64>,
    forces: DMatrix<f64>,
    tune_mass: bool,
    mass_params: DVector<f64>,
}

impl SingleShot {
    pub fn new(
        steps: usize,
        tune_starting_state: bool,
        rep_pos_dim: usize,
        rep_vel_dim: usize,
        force_dim: usize,
        num_mass_params: usize,
        tune_mass: bool,
    ) -> Self {
        Self {
            steps,
            tune_starting_state,
            start_pos: DVector::zeros(rep_pos_dim),
            start_vel: DVector::zeros(rep_vel_dim),
            forces: DMatrix::zeros(force_dim, steps),
            tune_mass,
            mass_params: DVector::zeros(num_mass_params),
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
    pub fn tune_starting_state(&self) -> bool {
        self.tune_starting_state
    }
    pub fn set_tune_starting_state(&mut self, tune: bool) {
        self.tune_starting_state = tune;
    }
    pub fn start_pos(&self) -> &DVector<f64> {
        &self.start_pos
    }
    pub fn start_vel(&self) -> &DVector<f64> {
        &self.start_vel
    }
    pub fn set_start_state(&mut self, pos: DVector<f64>, vel: DVector<f64>) {
        debug_assert_eq!(pos.len(), self.start_pos.len());
        debug_assert_eq!(vel.len(), self.start_vel.len());
        self.start_pos = pos;
        self.start_vel = vel;
    }
    pub fn forces(&self) -> &DMatrix<f64> {
        &self.forces
    }
    pub fn set_forces(&mut self, forces: DMatrix<f64>) {
        debug_assert_eq!(forces.shape(), self.forces.shape());
        self.forces = forces;
    }
    pub fn mass_params(&self) -> &DVector<f64> {
        &self.mass_params
    }

    fn rep_pos_dim(&self) -> usize {
        self.start_pos.len()
    }
    fn rep_vel_dim(&self) -> usize {
        self.start_vel.len()
    }
    fn force_dim(&self) -> usize {
        self.forces.nrows()
    }

    fn start_block_len(&self) -> usize {
        if self.tune_starting_state {
            self.rep_pos_dim() + self.rep_vel_dim()
        } else {
            0
        }
    }

    fn forces_block_offset(&self) -> usize {
        self.start_block_len()
    }

    fn mass_block_offset(&self) -> usize {
        self.forces_block_offset() + self.force_dim() * self.steps
    }

    /// Offset (within this shot's own flat vector) of the force block for
    /// step `t`. Exposed so `MultiShot` can translate shot-local offsets
    /// into the concatenated multi-shot flat layout.
    pub fn force_offset(&self, t: usize) -> usize {
        self.forces_block_offset() + t * self.force_dim()
    }

    /// Flat variable layout (§4.4, item order fixed):
    /// `[start_pos, start_vel]?  forces_0 .. forces_{steps-1}  [mass]?`
    pub fn flat_dim(&self) -> usize {
        let mass_block = if self.tune_mass { self.mass_params.len() } else { 0 };
        self.mass_block_offset() + mass_block
    }

    pub fn flatten(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.flat_dim());
        if self.tune_starting_state {
            x.rows_mut(0, self.rep_pos_dim()).copy_from(&self.start_pos);
            x.rows_mut(self.rep_pos_dim(), self.rep_vel_dim())
                .copy_from(&self.start_vel);
        }
        for t in 0..self.steps {
            x.rows_mut(self.force_offset(t), self.force_dim())
                .copy_from(&self.forces.column(t));
        }
        if self.tune_mass {
            x.rows_mut(self.mass_block_offset(), self.mass_params.len())
                .copy_from(&self.mass_params);
        }
        x
    }

    pub fn unflatten(&mut self, x: &DVector<f64>) {
        debug_assert_eq!(x.len(), self.flat_dim());
        if self.tune_starting_state {
            self.start_pos = x.rows(0, self.rep_pos_dim()).into_owned();
            self.start_vel = x.rows(self.rep_pos_dim(), self.rep_vel_dim()).into_owned();
        }
        for t in 0..self.steps {
            self.forces
                .column_mut(t)
                .copy_from(&x.rows(self.force_offset(t), self.force_dim()));
        }
        if self.tune_mass {
            self.mass_params = x.rows(self.mass_block_offset(), self.mass_params.len()).into_owned();
        }
    }

    /// Position/velocity bounds come from the simulator's joint limits in
    /// the current representation mapping; force bounds from per-DOF force
    /// limits; mass bounds from registered mass-parameter ranges (§4.4).
    pub fn bounds(&self, sim: &dyn Simulator) -> (DVector<f64>, DVector<f64>) {
        let mut lo = DVector::zeros(self.flat_dim());
        let mut hi = DVector::zeros(self.flat_dim());

        if self.tune_starting_state {
            lo.rows_mut(0, self.rep_pos_dim()).copy_from(&sim.position_lower_bounds());
            hi.rows_mut(0, self.rep_pos_dim()).copy_from(&sim.position_upper_bounds());
            lo.rows_mut(self.rep_pos_dim(), self.rep_vel_dim())
                .copy_from(&sim.velocity_lower_bounds());
            hi.rows_mut(self.rep_pos_dim(), self.rep_vel_dim())
                .copy_from(&sim.velocity_upper_bounds());
        }

        let flo = sim.force_lower_bounds();
        let fhi = sim.force_upper_bounds();
        for t in 0..self.steps {
            lo.rows_mut(self.force_offset(t), self.force_dim()).copy_from(&flo);
            hi.rows_mut(self.force_offset(t), self.force_dim()).copy_from(&fhi);
        }

        if self.tune_mass {
            lo.rows_mut(self.mass_block_offset(), self.mass_params.len())
                .copy_from(&sim.mass_param_lower_bounds());
            hi.rows_mut(self.mass_block_offset(), self.mass_params.len())
                .copy_from(&sim.mass_param_upper_bounds());
        }

        (lo, hi)
    }

    /// Forward unroll (§4.4): scoped save, apply mass params and start
    /// state, then step once per force column, recording a linearization
    /// and reading every registered mapping into the output rollout.
    pub fn unroll(
        &self,
        sim: &mut dyn Simulator,
        registry: &MappingRegistry,
        representation: &dyn Mapping,
    ) -> Result<(OwnedRollout, Vec<BackpropSnapshot>), TrajOptError> {
        let mut guard = ScopedSimulatorState::new(sim);

        if self.tune_mass {
            guard.sim_mut().set_mass_params(&self.mass_params);
        }
        representation.write_pos(guard.sim_mut(), &self.start_pos);
        representation.write_vel(guard.sim_mut(), &self.start_vel);

        let mut rollout = OwnedRollout::new(registry, guard.sim(), self.steps);
        let mut snapshots = Vec::with_capacity(self.steps);

        for t in 0..self.steps {
            let force_t = self.forces.column(t).into_owned();
            representation.write_force(guard.sim_mut(), &force_t);

            guard.sim_mut().step().map_err(|e| match e {
                TrajOptError::SimulatorStep { source, .. } => TrajOptError::SimulatorStep { t, source },
                other => other,
            })?;

            snapshots.push(guard.sim().linearize());

            for name in registry.names() {
                let mapping = registry.get(name);
                let pos = mapping.read_pos(guard.sim());
                let vel = mapping.read_vel(guard.sim());
                let force = mapping.read_force(guard.sim());
                rollout.poses_mut(name).column_mut(t).copy_from(&pos);
                rollout.vels_mut(name).column_mut(t).copy_from(&vel);
                rollout.forces_mut(name).column_mut(t).copy_from(&force);
            }
        }

        Ok((rollout, snapshots))
    }

    /// Final-state Jacobian: a dense `(2*repDim) x flatDim` matrix giving
    /// `(pos_T, vel_T)`'s sensitivity to every decision variable, by
    /// chaining the per-step linearizations backward (§4.4). Requires the
    /// representation mapping to be full-state (see `DESIGN.md`).
    pub fn final_state_jacobian(&self, snapshots: &[BackpropSnapshot]) -> DMatrix<f64> {
        debug_assert_eq!(snapshots.len(), self.steps);

        let rep_dim = self.rep_pos_dim();
        debug_assert_eq!(
            rep_dim,
            self.rep_vel_dim(),
            "final-state jacobian requires pos/vel representation dims to match"
        );

        let mut jac = DMatrix::zeros(2 * rep_dim, self.flat_dim());
        let mut transfer = DMatrix::<f64>::identity(2 * rep_dim, 2 * rep_dim);

        for t in (0..self.steps).rev() {
            let snap = &snapshots[t];
            let force_block = transfer_force_block(&transfer, snap, rep_dim);
            set_block(&mut jac, 0, self.force_offset(t), &force_block);
            transfer = transfer_update(&transfer, snap, rep_dim);
        }

        if self.tune_starting_state {
            set_block(&mut jac, 0, 0, &transfer.columns(0, rep_dim).into_owned());
            set_block(&mut jac, 0, rep_dim, &transfer.columns(rep_dim, rep_dim).into_owned());
        }

        jac
    }

    /// Vector-adjoint analogue of [`final_state_jacobian`](Self::final_state_jacobian):
    /// backprops a per-timestep loss gradient (`repDim x steps` for
    /// pos/vel, `forceDim x steps` for force, all in representation
    /// coordinates) into a flat gradient over this shot's decision
    /// variables (§4.4).
    pub fn gradient_backprop(
        &self,
        snapshots: &[BackpropSnapshot],
        grad_pos: &DMatrix<f64>,
        grad_vel: &DMatrix<f64>,
        grad_force: &DMatrix<f64>,
    ) -> DVector<f64> {
        debug_assert_eq!(snapshots.len(), self.steps);
        let rep_dim = self.rep_pos_dim();
        debug_assert_eq!(rep_dim, self.rep_vel_dim());

        let mut out = DVector::zeros(self.flat_dim());
        let mut adj_pos = DVector::zeros(rep_dim);
        let mut adj_vel = DVector::zeros(rep_dim);

        for t in (0..self.steps).rev() {
            adj_pos += grad_pos.column(t);
            adj_vel += grad_vel.column(t);

            let snap = &snapshots[t];
            let mut force_grad = grad_force.column(t).into_owned();
            force_grad += snap.pos_force.transpose() * &adj_pos;
            force_grad += snap.vel_force.transpose() * &adj_vel;
            out.rows_mut(self.force_offset(t), self.force_dim()).copy_from(&force_grad);

            let new_adj_pos = snap.pos_pos.transpose() * &adj_pos + snap.vel_pos.transpose() * &adj_vel;
            let new_adj_vel = snap.pos_vel.transpose() * &adj_pos + snap.vel_vel.transpose() * &adj_vel;
            adj_pos = new_adj_pos;
            adj_vel = new_adj_vel;
        }

        if self.tune_starting_state {
            out.rows_mut(0, rep_dim).copy_from(&adj_pos);
            out.rows_mut(rep_dim, rep_dim).copy_from(&adj_vel);
        }

        out
    }
}
