use thiserror::Error;

/// Errors surfaced across the shooting-method trajectory optimization core.
///
/// Dimension mismatches, writes on a const rollout slice, and missing-mapping
/// lookups are program-contract violations and abort via
/// `debug_assert!`/`panic!` rather than appearing here (see `DESIGN.md`).
/// Only the genuinely recoverable / externally-caused outcomes are
/// represented as variants.
#[derive(Error, Debug)]
pub enum TrajOptError {
    #[error("simulator step failed at t={t}: {source}")]
    SimulatorStep {
        t: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown mapping {name:?}")]
    UnknownMapping { name: String },

    #[error("argmin solver error: {0}")]
    Argmin(#[from] argmin::core::Error),
}
