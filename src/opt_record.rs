use std::cell::RefCell;
use std::rc::Rc;

use argmin::core::{Error as ArgminError, KV, State, observers::Observe};
use nalgebra::DVector;

use crate::rollout::OwnedRollout;

/// A normal, enumerated solver outcome (§7) — not an error. Attached to an
/// `OptimizationRecord` by the caller once the external solve completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    TolerancesReached,
    IterationLimit,
    StaticProblem,
    Invalid,
}

/// One announced solver iteration's full snapshot (§4.7), retained by deep
/// copy for post-hoc inspection.
#[derive(Debug, Clone)]
pub struct IterationEntry {
    pub index: usize,
    pub x: DVector<f64>,
    pub loss: f64,
    pub gradient: DVector<f64>,
    pub constraints: DVector<f64>,
    pub sparse_jacobian: Vec<f64>,
    pub rollout: OwnedRollout,
}

/// Append-only per-iteration history plus a running best, mirroring the
/// teacher's `MyObserver` (which appends once per `argmin` `observe_iter`
/// callback) but snapshotting the full iterate rather than only its cost.
#[derive(Debug, Default)]
pub struct OptimizationRecord {
    entries: Vec<IterationEntry>,
    best: Option<(DVector<f64>, f64)>,
    outcome: Option<ConvergenceOutcome>,
}

impl OptimizationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[IterationEntry] {
        &self.entries
    }

    pub fn best(&self) -> Option<&(DVector<f64>, f64)> {
        self.best.as_ref()
    }

    pub fn outcome(&self) -> Option<ConvergenceOutcome> {
        self.outcome
    }

    pub fn set_outcome(&mut self, outcome: ConvergenceOutcome) {
        self.outcome = Some(outcome);
    }

    /// Called once per *announced* new iteration (never once per bare
    /// `cost`/`gradient` call — §4.7).
    pub fn record_iteration(
        &mut self,
        x: DVector<f64>,
        loss: f64,
        gradient: DVector<f64>,
        constraints: DVector<f64>,
        sparse_jacobian: Vec<f64>,
        rollout: OwnedRollout,
    ) {
        if self.best.as_ref().map_or(true, |(_, best_loss)| loss < *best_loss) {
            self.best = Some((x.clone(), loss));
        }
        let index = self.entries.len();
        self.entries.push(IterationEntry { index, x, loss, gradient, constraints, sparse_jacobian, rollout });
    }

    /// Resumes from the stored best `x`, clears the iteration history, and
    /// returns the seed guess; re-driving the solver is the caller's job.
    pub fn reoptimize(&mut self) -> DVector<f64> {
        let guess = self
            .best
            .as_ref()
            .expect("reoptimize called with no recorded iterations")
            .0
            .clone();
        self.entries.clear();
        guess
    }
}

/// Tracks the cost trajectory of an `argmin` solve, exactly as the teacher's
/// `MyObserver` does. Richer per-iteration snapshots (gradient, constraints,
/// sparse Jacobian, rollout) are recorded by the driving loop calling
/// `OptimizationRecord::record_iteration` directly, since that loop already
/// has those values in hand from the same `Problem` calls this observer
/// would otherwise have to repeat.
#[derive(Clone)]
pub struct CostHistoryObserver {
    cost_history: Rc<RefCell<Vec<f64>>>,
}

impl CostHistoryObserver {
    pub fn new() -> Self {
        Self { cost_history: Rc::new(RefCell::new(Vec::new())) }
    }

    pub fn cost_history(&self) -> Vec<f64> {
        self.cost_history.borrow().clone()
    }
}

impl Default for CostHistoryObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Observe<I> for CostHistoryObserver
where
    I: State<Float = f64>,
{
    fn observe_init(&mut self, _name: &str, _state: &I, _kv: &KV) -> Result<(), ArgminError> {
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), ArgminError> {
        self.cost_history.borrow_mut().push(state.get_cost());
        Ok(())
    }
}
