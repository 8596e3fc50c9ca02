use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::TrajOptError;

/// The world-frame translation and XYZ-Euler rotation of one body node,
/// as produced by forward kinematics. Euler-angle parameterization and its
/// derivatives are a pure function consumed from outside this crate; this
/// struct only carries the result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyPose {
    pub translation: Vector3<f64>,
    pub euler_xyz: Vector3<f64>,
}

/// A full raw-joint-space snapshot of the world, captured by
/// [`Simulator::snapshot`] and restored by [`Simulator::restore`]. Held
/// opaque to callers beyond the scoped-restoration guard.
#[derive(Debug, Clone)]
pub struct SimulatorSnapshot {
    pub positions: DVector<f64>,
    pub velocities: DVector<f64>,
    pub forces: DVector<f64>,
}

/// A single step's linearization of the dynamics: the six Jacobians of
/// `(pos_{t+1}, vel_{t+1})` with respect to `(pos_t, vel_t, force_t)`, all
/// expressed in the simulator's raw joint-space (identity mapping) basis.
/// The core treats these as black boxes — see `DESIGN.md` for why the
/// identity basis is load-bearing here.
#[derive(Debug, Clone)]
pub struct BackpropSnapshot {
    pub pos_pos: DMatrix<f64>,
    pub pos_vel: DMatrix<f64>,
    pub pos_force: DMatrix<f64>,
    pub vel_pos: DMatrix<f64>,
    pub vel_vel: DMatrix<f64>,
    pub vel_force: DMatrix<f64>,
}

/// The dynamics world this crate optimizes trajectories against. Contact
/// resolution, the constraint LCP, and skeleton kinematics all live on the
/// other side of this trait — consumed only through these operations.
pub trait Simulator: Send {
    fn num_dofs(&self) -> usize;

    fn positions(&self) -> DVector<f64>;
    fn velocities(&self) -> DVector<f64>;
    fn forces(&self) -> DVector<f64>;

    fn set_positions(&mut self, pos: &DVector<f64>);
    fn set_velocities(&mut self, vel: &DVector<f64>);
    fn set_forces(&mut self, force: &DVector<f64>);

    /// Advances the simulation by one tick. Propagated failures (stiff
    /// steps, solver divergence inside the LCP, ...) abort the current
    /// unroll via `TrajOptError::SimulatorStep`.
    fn step(&mut self) -> Result<(), TrajOptError>;

    /// An independent copy used by the parallel multi-shot path; mutations
    /// to the clone must never be observable through the original.
    fn clone_boxed(&self) -> Box<dyn Simulator>;

    fn snapshot(&self) -> SimulatorSnapshot {
        SimulatorSnapshot {
            positions: self.positions(),
            velocities: self.velocities(),
            forces: self.forces(),
        }
    }

    fn restore(&mut self, snapshot: &SimulatorSnapshot) {
        self.set_positions(&snapshot.positions);
        self.set_velocities(&snapshot.velocities);
        self.set_forces(&snapshot.forces);
    }

    fn linearize(&self) -> BackpropSnapshot;

    fn position_lower_bounds(&self) -> DVector<f64>;
    fn position_upper_bounds(&self) -> DVector<f64>;
    fn velocity_lower_bounds(&self) -> DVector<f64>;
    fn velocity_upper_bounds(&self) -> DVector<f64>;
    fn force_lower_bounds(&self) -> DVector<f64>;
    fn force_upper_bounds(&self) -> DVector<f64>;

    fn num_mass_params(&self) -> usize;
    fn mass_params(&self) -> DVector<f64>;
    fn set_mass_params(&mut self, masses: &DVector<f64>);
    fn mass_param_lower_bounds(&self) -> DVector<f64>;
    fn mass_param_upper_bounds(&self) -> DVector<f64>;

    /// Body nodes available to the IK mapping and to Rollout JSON emission.
    fn body_node_names(&self) -> &[String];
    fn forward_kinematics_pose(&self, body: &str) -> BodyPose;

    /// Writes a full 6-DOF pose (translation + XYZ-Euler) onto one body,
    /// driving the world to that configuration. Inverse kinematics itself
    /// is a pure function supplied by the implementor; this crate never
    /// differentiates it.
    fn ik_set_body_pose(&mut self, body: &str, pose: &BodyPose);
    fn ik_body_spatial_velocity(&self, body: &str) -> nalgebra::Vector6<f64>;
    fn ik_set_body_spatial_velocity(&mut self, body: &str, vel: &nalgebra::Vector6<f64>);
    fn ik_body_wrench(&self, body: &str) -> nalgebra::Vector6<f64>;
    fn ik_set_body_wrench(&mut self, body: &str, wrench: &nalgebra::Vector6<f64>);
}

/// RAII scoped mutation: saves the world state on construction and restores
/// it when dropped, on every exit path including early `?` returns and
/// panics during unwind.
pub struct ScopedSimulatorState<'a> {
    sim: &'a mut dyn Simulator,
    saved: SimulatorSnapshot,
}

impl<'a> ScopedSimulatorState<'a> {
    pub fn new(sim: &'a mut dyn Simulator) -> Self {
        let saved = sim.snapshot();
        Self { sim, saved }
    }

    pub fn sim(&self) -> &dyn Simulator {
        self.sim
    }

    pub fn sim_mut(&mut self) -> &mut dyn Simulator {
        self.sim
    }
}

impl Drop for ScopedSimulatorState<'_> {
    fn drop(&mut self) {
        self.sim.restore(&self.saved);
    }
}
