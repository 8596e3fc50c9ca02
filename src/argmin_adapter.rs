use std::cell::{Ref, RefCell};

use argmin::core::{CostFunction, Error as ArgminError, Gradient, Operator};
use nalgebra::DVector;

use crate::problem::Problem;

/// Thin adapter letting any `Problem` drive an `argmin` solver, mirroring
/// the teacher's `impl CostFunction/Gradient/Operator for SubProblem`. Those
/// traits take `&self`; our `Problem` methods take `&mut self` because
/// unrolling needs a mutable simulator, so the adapter closes over a
/// `RefCell` rather than requiring `Problem` itself to use interior
/// mutability.
///
/// This is what lets the crate's own tests drive an unconstrained L-BFGS
/// solve (mass recovery, unconstrained sliding box, §8) without the core
/// crate depending on a real interior-point solver.
pub struct ArgminAdapter<P: Problem> {
    problem: RefCell<P>,
}

impl<P: Problem> ArgminAdapter<P> {
    pub fn new(problem: P) -> Self {
        Self { problem: RefCell::new(problem) }
    }

    pub fn into_inner(self) -> P {
        self.problem.into_inner()
    }

    pub fn borrow(&self) -> Ref<'_, P> {
        self.problem.borrow()
    }
}

fn to_argmin_error(err: crate::error::TrajOptError) -> ArgminError {
    ArgminError::msg(err.to_string())
}

impl<P: Problem> CostFunction for ArgminAdapter<P> {
    type Param = DVector<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, ArgminError> {
        let mut problem = self.problem.borrow_mut();
        problem.unflatten(p);
        problem.compute_loss().map_err(to_argmin_error)
    }
}

impl<P: Problem> Gradient for ArgminAdapter<P> {
    type Param = DVector<f64>;
    type Gradient = DVector<f64>;

    fn gradient(&self, p: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        let mut problem = self.problem.borrow_mut();
        problem.unflatten(p);
        problem.backprop_gradient().map_err(to_argmin_error)
    }
}

/// `Operator` exposes the constraint vector, matching the teacher's use of
/// `Operator` as "the vector-valued residual apply", here repurposed as
/// "the vector of constraint values" (§4.6).
impl<P: Problem> Operator for ArgminAdapter<P> {
    type Param = DVector<f64>;
    type Output = DVector<f64>;

    fn apply(&self, p: &Self::Param) -> Result<Self::Output, ArgminError> {
        let mut problem = self.problem.borrow_mut();
        problem.unflatten(p);
        problem.compute_constraints().map_err(to_argmin_error)
    }
}
