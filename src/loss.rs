use nalgebra::DMatrix;

use crate::rollout::{OwnedRollout, Rollout};

/// Centered finite-difference step for positions/velocities, used only when
/// a loss has no analytic gradient callable (§4.3).
const FD_STEP: f64 = 1e-7;

/// A value(+gradient) callable over a rollout, optionally carrying bounds
/// that let the same wrapper double as an equality/inequality constraint
/// when embedded in a multi-shot's parent-constraint list.
pub struct LossFn {
    value_fn: Box<dyn Fn(&Rollout) -> f64 + Send + Sync>,
    grad_fn: Option<Box<dyn Fn(&Rollout, &mut OwnedRollout) -> f64 + Send + Sync>>,
    bounds: Option<(f64, f64)>,
}

impl LossFn {
    pub fn new(value_fn: impl Fn(&Rollout) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            value_fn: Box::new(value_fn),
            grad_fn: None,
            bounds: None,
        }
    }

    pub fn with_analytic_gradient(
        mut self,
        grad_fn: impl Fn(&Rollout, &mut OwnedRollout) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.grad_fn = Some(Box::new(grad_fn));
        self
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.bounds = Some((lower, upper));
        self
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.bounds
    }

    pub fn value(&self, rollout: &Rollout) -> f64 {
        (self.value_fn)(rollout)
    }

    /// Returns `(loss, grad_rollout)`. Falls back to centered finite
    /// differences over the owning rollout's poses/vels/forces columns when
    /// no analytic gradient was supplied.
    pub fn gradient(&self, rollout: &OwnedRollout, mapping_names: &[String]) -> (f64, OwnedRollout) {
        if let Some(grad_fn) = &self.grad_fn {
            let mut grad = rollout.deep_clone();
            zero_all(&mut grad, mapping_names);
            let loss = grad_fn(&Rollout::Owned(rollout), &mut grad);
            return (loss, grad);
        }

        let base_loss = self.value(&Rollout::Owned(rollout));
        let mut perturbed = rollout.deep_clone();
        let mut grad = rollout.deep_clone();
        zero_all(&mut grad, mapping_names);

        for name in mapping_names {
            finite_difference_columns(&mut perturbed, &mut grad, name, &self.value_fn, PerturbKind::Pose);
            finite_difference_columns(&mut perturbed, &mut grad, name, &self.value_fn, PerturbKind::Vel);
            finite_difference_columns(&mut perturbed, &mut grad, name, &self.value_fn, PerturbKind::Force);
        }

        (base_loss, grad)
    }
}

fn zero_all(rollout: &mut OwnedRollout, mapping_names: &[String]) {
    for name in mapping_names {
        rollout.poses_mut(name).fill(0.0);
        rollout.vels_mut(name).fill(0.0);
        rollout.forces_mut(name).fill(0.0);
    }
}

#[derive(Clone, Copy)]
enum PerturbKind {
    Pose,
    Vel,
    Force,
}

fn select<'a>(rollout: &'a mut OwnedRollout, name: &str, kind: PerturbKind) -> &'a mut DMatrix<f64> {
    match kind {
        PerturbKind::Pose => rollout.poses_mut(name),
        PerturbKind::Vel => rollout.vels_mut(name),
        PerturbKind::Force => rollout.forces_mut(name),
    }
}

fn finite_difference_columns(
    perturbed: &mut OwnedRollout,
    grad: &mut OwnedRollout,
    name: &str,
    value_fn: &(dyn Fn(&Rollout) -> f64 + Send + Sync),
    kind: PerturbKind,
) {
    let (rows, cols) = {
        let m = select(perturbed, name, kind);
        (m.nrows(), m.ncols())
    };

    for r in 0..rows {
        for c in 0..cols {
            let original = select(perturbed, name, kind)[(r, c)];
            // Force columns use an adaptive step scaled by the current
            // magnitude; positions/velocities use the fixed step of §4.3.
            let step = match kind {
                PerturbKind::Force => FD_STEP * original.abs().max(1.0),
                _ => FD_STEP,
            };

            select(perturbed, name, kind)[(r, c)] = original + step;
            let plus = value_fn(&Rollout::Owned(perturbed));

            select(perturbed, name, kind)[(r, c)] = original - step;
            let minus = value_fn(&Rollout::Owned(perturbed));

            select(perturbed, name, kind)[(r, c)] = original;

            select(grad, name, kind)[(r, c)] = (plus - minus) / (2.0 * step);
        }
    }
}
