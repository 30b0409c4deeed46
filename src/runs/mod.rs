//! Code track: requirement → spec → code → review → publish.

pub mod controller;
pub mod stages;
pub mod state;

pub use controller::{RunController, StartRunParams};
pub use state::{initial_run_state, RunDelta, RunState};
