pub mod ridders;
pub mod toy_simulator;
