//! A closed-form, decoupled multi-DOF simulator used only by tests. Each DOF
//! is an independent damped mass with an optional gravity-restoring torque
//! (`gravityCoeff = 0` gives a sliding box; nonzero gives a small-angle
//! pendulum), integrated with semi-implicit Euler. Every partial derivative
//! below is exact, which is what lets the jacobian-vs-finite-difference
//! tests hold to a tight tolerance.

use nalgebra::{DMatrix, DVector, Vector3, Vector6};
use trajopt::error::TrajOptError;
use trajopt::simulator::{BackpropSnapshot, BodyPose, Simulator};

#[derive(Clone, Copy)]
pub struct DofConfig {
    pub mass: f64,
    pub damping: f64,
    pub gravity_coeff: f64,
    pub length: f64,
}

impl DofConfig {
    pub fn sliding(mass: f64, damping: f64) -> Self {
        Self { mass, damping, gravity_coeff: 0.0, length: 1.0 }
    }

    pub fn pendulum(mass: f64, damping: f64, gravity_coeff: f64, length: f64) -> Self {
        Self { mass, damping, gravity_coeff, length }
    }
}

#[derive(Clone)]
pub struct ToySimulator {
    dt: f64,
    damping: DVector<f64>,
    gravity_coeff: DVector<f64>,
    length: DVector<f64>,
    mass: DVector<f64>,
    pos: DVector<f64>,
    vel: DVector<f64>,
    force: DVector<f64>,
    body_names: Vec<String>,
    last_linearization: BackpropSnapshot,
}

impl ToySimulator {
    pub fn new(dt: f64, configs: &[DofConfig]) -> Self {
        let n = configs.len();
        let body_names = (0..n).map(|i| format!("body_{i}")).collect();
        Self {
            dt,
            damping: DVector::from_iterator(n, configs.iter().map(|c| c.damping)),
            gravity_coeff: DVector::from_iterator(n, configs.iter().map(|c| c.gravity_coeff)),
            length: DVector::from_iterator(n, configs.iter().map(|c| c.length)),
            mass: DVector::from_iterator(n, configs.iter().map(|c| c.mass)),
            pos: DVector::zeros(n),
            vel: DVector::zeros(n),
            force: DVector::zeros(n),
            body_names,
            last_linearization: BackpropSnapshot {
                pos_pos: DMatrix::zeros(n, n),
                pos_vel: DMatrix::zeros(n, n),
                pos_force: DMatrix::zeros(n, n),
                vel_pos: DMatrix::zeros(n, n),
                vel_vel: DMatrix::zeros(n, n),
                vel_force: DMatrix::zeros(n, n),
            },
        }
    }

    pub fn sliding_box(dt: f64, mass: f64, damping: f64) -> Self {
        Self::new(dt, &[DofConfig::sliding(mass, damping)])
    }

    pub fn pendulum(dt: f64, mass: f64, damping: f64, gravity_coeff: f64, length: f64) -> Self {
        Self::new(dt, &[DofConfig::pendulum(mass, damping, gravity_coeff, length)])
    }

    pub fn cartpole(dt: f64, cart_mass: f64, pole_mass: f64, damping: f64, gravity_coeff: f64, pole_length: f64) -> Self {
        Self::new(
            dt,
            &[DofConfig::sliding(cart_mass, damping), DofConfig::pendulum(pole_mass, damping, gravity_coeff, pole_length)],
        )
    }

    pub fn chain(dt: f64, n: usize, mass: f64, damping: f64, gravity_coeff: f64, length: f64) -> Self {
        let configs: Vec<_> = (0..n).map(|_| DofConfig::pendulum(mass, damping, gravity_coeff, length)).collect();
        Self::new(dt, &configs)
    }

    pub fn set_angle(&mut self, i: usize, angle: f64) {
        self.pos[i] = angle;
    }

    fn body_index(&self, body: &str) -> usize {
        self.body_names
            .iter()
            .position(|b| b == body)
            .unwrap_or_else(|| panic!("unknown body {body:?}"))
    }
}

impl Simulator for ToySimulator {
    fn num_dofs(&self) -> usize {
        self.pos.len()
    }

    fn positions(&self) -> DVector<f64> {
        self.pos.clone()
    }
    fn velocities(&self) -> DVector<f64> {
        self.vel.clone()
    }
    fn forces(&self) -> DVector<f64> {
        self.force.clone()
    }

    fn set_positions(&mut self, pos: &DVector<f64>) {
        debug_assert_eq!(pos.len(), self.pos.len());
        self.pos = pos.clone();
    }
    fn set_velocities(&mut self, vel: &DVector<f64>) {
        debug_assert_eq!(vel.len(), self.vel.len());
        self.vel = vel.clone();
    }
    fn set_forces(&mut self, force: &DVector<f64>) {
        debug_assert_eq!(force.len(), self.force.len());
        self.force = force.clone();
    }

    fn step(&mut self) -> Result<(), TrajOptError> {
        let n = self.num_dofs();
        let mut pos_pos = DMatrix::zeros(n, n);
        let mut pos_vel = DMatrix::zeros(n, n);
        let mut pos_force = DMatrix::zeros(n, n);
        let mut vel_pos = DMatrix::zeros(n, n);
        let mut vel_vel = DMatrix::zeros(n, n);
        let mut vel_force = DMatrix::zeros(n, n);

        let mut new_pos = DVector::zeros(n);
        let mut new_vel = DVector::zeros(n);

        for i in 0..n {
            let m = self.mass[i];
            let c = self.damping[i];
            let g = self.gravity_coeff[i];
            let q = self.pos[i];
            let qdot = self.vel[i];
            let f = self.force[i];
            let dt = self.dt;

            let qddot = (f - c * qdot - g * m * q.sin()) / m;
            let new_qdot = qdot + dt * qddot;
            let new_q = q + dt * new_qdot;

            let d_qdot_d_qdot = 1.0 - dt * c / m;
            let d_qdot_d_q = -dt * g * q.cos();
            let d_qdot_d_f = dt / m;

            let d_q_d_q = 1.0 + dt * d_qdot_d_q;
            let d_q_d_qdot = dt * d_qdot_d_qdot;
            let d_q_d_f = dt * d_qdot_d_f;

            pos_pos[(i, i)] = d_q_d_q;
            pos_vel[(i, i)] = d_q_d_qdot;
            pos_force[(i, i)] = d_q_d_f;
            vel_pos[(i, i)] = d_qdot_d_q;
            vel_vel[(i, i)] = d_qdot_d_qdot;
            vel_force[(i, i)] = d_qdot_d_f;

            new_pos[i] = new_q;
            new_vel[i] = new_qdot;
        }

        self.pos = new_pos;
        self.vel = new_vel;
        self.last_linearization = BackpropSnapshot { pos_pos, pos_vel, pos_force, vel_pos, vel_vel, vel_force };
        Ok(())
    }

    fn clone_boxed(&self) -> Box<dyn Simulator> {
        Box::new(self.clone())
    }

    fn linearize(&self) -> BackpropSnapshot {
        self.last_linearization.clone()
    }

    fn position_lower_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_dofs(), -1.0e6)
    }
    fn position_upper_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_dofs(), 1.0e6)
    }
    fn velocity_lower_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_dofs(), -1.0e6)
    }
    fn velocity_upper_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_dofs(), 1.0e6)
    }
    fn force_lower_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_dofs(), -1.0e6)
    }
    fn force_upper_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_dofs(), 1.0e6)
    }

    fn num_mass_params(&self) -> usize {
        self.mass.len()
    }
    fn mass_params(&self) -> DVector<f64> {
        self.mass.clone()
    }
    fn set_mass_params(&mut self, masses: &DVector<f64>) {
        debug_assert_eq!(masses.len(), self.mass.len());
        self.mass = masses.clone();
    }
    fn mass_param_lower_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_mass_params(), 1.0e-3)
    }
    fn mass_param_upper_bounds(&self) -> DVector<f64> {
        DVector::repeat(self.num_mass_params(), 1.0e3)
    }

    fn body_node_names(&self) -> &[String] {
        &self.body_names
    }

    fn forward_kinematics_pose(&self, body: &str) -> BodyPose {
        let i = self.body_index(body);
        let q = self.pos[i];
        let l = self.length[i];
        BodyPose {
            translation: Vector3::new(l * q.cos(), l * q.sin(), 0.0),
            euler_xyz: Vector3::new(0.0, 0.0, q),
        }
    }

    fn ik_set_body_pose(&mut self, body: &str, pose: &BodyPose) {
        let i = self.body_index(body);
        self.pos[i] = pose.euler_xyz.z;
    }

    fn ik_body_spatial_velocity(&self, body: &str) -> Vector6<f64> {
        let i = self.body_index(body);
        let q = self.pos[i];
        let l = self.length[i];
        let qdot = self.vel[i];
        Vector6::new(-l * q.sin() * qdot, l * q.cos() * qdot, 0.0, 0.0, 0.0, qdot)
    }

    fn ik_set_body_spatial_velocity(&mut self, body: &str, vel: &Vector6<f64>) {
        let i = self.body_index(body);
        self.vel[i] = vel[5];
    }

    fn ik_body_wrench(&self, body: &str) -> Vector6<f64> {
        let i = self.body_index(body);
        Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, self.force[i])
    }

    fn ik_set_body_wrench(&mut self, body: &str, wrench: &Vector6<f64>) {
        let i = self.body_index(body);
        self.force[i] = wrench[5];
    }
}
