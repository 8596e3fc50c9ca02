//! Testable Property 8: `getStates` with and without knots.

mod common;

use std::sync::Arc;

use common::toy_simulator::ToySimulator;
use nalgebra::DVector;
use trajopt::loss::LossFn;
use trajopt::mapping::MappingRegistry;
use trajopt::multi_shot::MultiShot;
use trajopt::rollout::Rollout;
use trajopt::simulator::Simulator;

fn run_steps(sim0: &ToySimulator, start_pos: f64, start_vel: f64, forces: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut sim = sim0.clone();
    sim.set_positions(&DVector::from_vec(vec![start_pos]));
    sim.set_velocities(&DVector::from_vec(vec![start_vel]));
    let mut pos_hist = Vec::with_capacity(forces.len());
    let mut vel_hist = Vec::with_capacity(forces.len());
    for &f in forces {
        sim.set_forces(&DVector::from_vec(vec![f]));
        sim.step().unwrap();
        pos_hist.push(sim.positions()[0]);
        vel_hist.push(sim.velocities()[0]);
    }
    (pos_hist, vel_hist)
}

#[test]
fn with_knots_matches_each_shots_own_unroll() {
    let sim0 = ToySimulator::sliding_box(0.02, 1.0, 0.05);
    let registry = MappingRegistry::new_with_identity();
    let loss = LossFn::new(|_: &Rollout| 0.0);
    let mut ms = MultiShot::new(Box::new(sim0.clone()), Arc::new(registry), loss, 6, 3, true);

    let shot0_forces = [0.2, 0.1, -0.1];
    let shot1_forces = [0.05, 0.05, 0.05];
    // Shot 1's start state is deliberately inconsistent with shot 0's actual
    // final state, so the two reconstructions are forced to disagree.
    let x = DVector::from_vec(vec![
        0.0, 0.0, shot0_forces[0], shot0_forces[1], shot0_forces[2], 5.0, 0.0, shot1_forces[0], shot1_forces[1],
        shot1_forces[2],
    ]);
    ms.unflatten(&x);

    let with_knots = ms.get_states_with_knots().unwrap();

    let (pos0, vel0) = run_steps(&sim0, 0.0, 0.0, &shot0_forces);
    let (pos1, vel1) = run_steps(&sim0, 5.0, 0.0, &shot1_forces);

    for t in 0..3 {
        assert!((with_knots.poses("identity")[(0, t)] - pos0[t]).abs() <= 1e-12);
        assert!((with_knots.vels("identity")[(0, t)] - vel0[t]).abs() <= 1e-12);
    }
    for t in 0..3 {
        assert!((with_knots.poses("identity")[(0, 3 + t)] - pos1[t]).abs() <= 1e-12);
        assert!((with_knots.vels("identity")[(0, 3 + t)] - vel1[t]).abs() <= 1e-12);
    }
}

#[test]
fn without_knots_matches_monolithic_simulation() {
    let sim0 = ToySimulator::sliding_box(0.02, 1.0, 0.05);
    let registry = MappingRegistry::new_with_identity();
    let loss = LossFn::new(|_: &Rollout| 0.0);
    let mut ms = MultiShot::new(Box::new(sim0.clone()), Arc::new(registry), loss, 6, 3, true);

    let shot0_forces = [0.2, 0.1, -0.1];
    let shot1_forces = [0.05, 0.05, 0.05];
    let x = DVector::from_vec(vec![
        0.0, 0.0, shot0_forces[0], shot0_forces[1], shot0_forces[2], 5.0, 0.0, shot1_forces[0], shot1_forces[1],
        shot1_forces[2],
    ]);
    ms.unflatten(&x);

    let without_knots = ms.get_states_without_knots().unwrap();

    let all_forces: Vec<f64> = shot0_forces.iter().chain(shot1_forces.iter()).copied().collect();
    let (pos, vel) = run_steps(&sim0, 0.0, 0.0, &all_forces);

    for t in 0..6 {
        assert!((without_knots.poses("identity")[(0, t)] - pos[t]).abs() <= 1e-12);
        assert!((without_knots.vels("identity")[(0, t)] - vel[t]).abs() <= 1e-12);
    }
}
