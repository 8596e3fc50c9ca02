pub mod argmin_adapter;
pub mod error;
pub mod loss;
pub mod mapping;
pub mod multi_shot;
pub mod opt_record;
pub mod problem;
pub mod rollout;
pub mod rollout_json;
pub mod simulator;
pub mod single_shot;

pub mod prelude {
    pub use crate::{
        argmin_adapter::*,
        error::*,
        loss::*,
        mapping::*,
        multi_shot::*,
        opt_record::*,
        problem::*,
        rollout::*,
        rollout_json::*,
        simulator::*,
        single_shot::*,
    };

    pub use argmin;
    pub use nalgebra;
}
