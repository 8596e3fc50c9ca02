//! Unconstrained sliding box: single DOF, 40 steps, no contacts. Verifies
//! single-step, single-shot, and 8x2 multi-shot Jacobians.

mod common;

use std::sync::Arc;

use common::toy_simulator::ToySimulator;
use nalgebra::{DMatrix, DVector};
use trajopt::loss::LossFn;
use trajopt::mapping::MappingRegistry;
use trajopt::multi_shot::MultiShot;
use trajopt::rollout::Rollout;
use trajopt::simulator::Simulator;
use trajopt::single_shot::SingleShot;

fn base_sim() -> ToySimulator {
    ToySimulator::sliding_box(0.02, 1.0, 0.05)
}

#[test]
fn single_step_jacobian_has_expected_signs() {
    let mut stepped = base_sim();
    stepped.set_forces(&DVector::from_vec(vec![0.5]));
    stepped.step().unwrap();
    let snap = stepped.linearize();

    assert!(snap.pos_force[(0, 0)] > 0.0);
    assert!(snap.vel_force[(0, 0)] > 0.0);
    assert!(snap.pos_pos[(0, 0)] > 0.0);
}

#[test]
fn single_shot_forty_step_jacobian_matches_finite_difference() {
    let sim0 = base_sim();
    let steps = 40;
    let forces: Vec<f64> = (0..steps).map(|t| 0.1 * ((t as f64) * 0.2).sin()).collect();

    let mut shot = SingleShot::new(steps, true, 1, 1, 1, 0, false);
    shot.set_start_state(DVector::from_vec(vec![0.0]), DVector::from_vec(vec![0.0]));
    shot.set_forces(DMatrix::from_row_slice(1, steps, &forces));

    let registry = MappingRegistry::new_with_identity();
    let representation = registry.representation();
    let mut sim = sim0.clone();
    let (_, snapshots) = shot.unroll(&mut sim, &registry, representation.as_ref()).unwrap();
    let jac = shot.final_state_jacobian(&snapshots);

    let run = |fs: &[f64]| -> f64 {
        let mut s = sim0.clone();
        for &f in fs {
            s.set_forces(&DVector::from_vec(vec![f]));
            s.step().unwrap();
        }
        s.positions()[0]
    };

    let h = 1e-6;
    let t_check = 20;
    let mut fs_plus = forces.clone();
    let mut fs_minus = forces.clone();
    fs_plus[t_check] += h;
    fs_minus[t_check] -= h;
    let fd = (run(&fs_plus) - run(&fs_minus)) / (2.0 * h);

    let col = shot.force_offset(t_check);
    assert!((jac[(0, col)] - fd).abs() <= 1e-7);
}

#[test]
fn eight_by_two_multi_shot_jacobian_matches_finite_difference() {
    let sim = base_sim();
    let registry = MappingRegistry::new_with_identity();
    let loss = LossFn::new(|_: &Rollout| 0.0);
    let mut ms = MultiShot::new(Box::new(sim), Arc::new(registry), loss, 16, 2, true);

    let mut x = ms.initial_guess();
    for i in 0..x.len() {
        x[i] = 0.05 * ((i as f64 + 1.0) * 0.31).sin();
    }
    ms.unflatten(&x);

    let analytic = ms.backprop_jacobian().unwrap();

    let h = 1e-6;
    let n = x.len();
    let m = ms.constraint_dim();
    let mut fd = DMatrix::zeros(m, n);
    for j in 0..n {
        let mut xp = x.clone();
        let mut xm = x.clone();
        xp[j] += h;
        xm[j] -= h;
        ms.unflatten(&xp);
        let cp = ms.compute_constraints().unwrap();
        ms.unflatten(&xm);
        let cm = ms.compute_constraints().unwrap();
        let d = (cp - cm) / (2.0 * h);
        for i in 0..m {
            fd[(i, j)] = d[i];
        }
    }

    for i in 0..m {
        for j in 0..n {
            assert!((analytic[(i, j)] - fd[(i, j)]).abs() <= 1e-6, "i={i} j={j}");
        }
    }
}
