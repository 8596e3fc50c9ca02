//! Constrained cycle: 1-DOF pendulum, 12 steps / 3-step shots, equality
//! constraint `(p_0 - p_{T-1})^2 = 0` and objective `(p_{T/2} - 0.1)^2`.
//! Verifies the constraint Jacobian against finite differences and that a
//! simple penalty-gradient descent reduces both loss and constraint
//! violation.

mod common;

use std::sync::Arc;

use common::toy_simulator::ToySimulator;
use nalgebra::DMatrix;
use trajopt::loss::LossFn;
use trajopt::mapping::MappingRegistry;
use trajopt::multi_shot::MultiShot;
use trajopt::rollout::Rollout;

fn build() -> MultiShot {
    let sim = ToySimulator::pendulum(0.02, 1.0, 0.05, 9.8, 1.0);
    let registry = MappingRegistry::new_with_identity();

    let loss = LossFn::new(|rollout: &Rollout| {
        let pos = rollout.poses("identity");
        let mid = pos.ncols() / 2;
        let v = pos[(0, mid)] - 0.1;
        v * v
    });

    let cycle_constraint = LossFn::new(|rollout: &Rollout| {
        let pos = rollout.poses("identity");
        let last = pos.ncols() - 1;
        let v = pos[(0, 0)] - pos[(0, last)];
        v * v
    })
    .with_bounds(0.0, 0.0);

    MultiShot::new(Box::new(sim), Arc::new(registry), loss, 12, 3, true).with_parent_constraint(cycle_constraint)
}

#[test]
fn constraint_jacobian_matches_finite_difference() {
    let mut ms = build();
    let mut x = ms.initial_guess();
    for i in 0..x.len() {
        x[i] += 0.02 * ((i as f64 + 1.0) * 0.29).sin();
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
            assert!((analytic[(i, j)] - fd[(i, j)]).abs() <= 1e-4, "i={i} j={j}");
        }
    }
}

#[test]
fn penalty_descent_reduces_loss_and_constraint_violation() {
    let mut ms = build();
    let mut x = ms.initial_guess();
    for i in 0..x.len() {
        x[i] += 0.02 * ((i as f64 + 1.0) * 0.17).cos();
    }
    ms.unflatten(&x);

    let initial_loss = ms.compute_loss().unwrap();
    let initial_violation = ms.compute_constraints().unwrap().norm();

    for _ in 0..200 {
        ms.unflatten(&x);
        let (_, grad) = ms.backprop_gradient().unwrap();
        let constraints = ms.compute_constraints().unwrap();
        let jac = ms.backprop_jacobian().unwrap();
        let penalty_grad = jac.transpose() * &constraints;
        x -= 0.01 * (&grad + 50.0 * &penalty_grad);
    }
    ms.unflatten(&x);

    let final_loss = ms.compute_loss().unwrap();
    let final_violation = ms.compute_constraints().unwrap().norm();

    assert!(final_loss < initial_loss);
    assert!(final_violation < initial_violation);
}
