//! Instance state manager, dependency engine, Integrations runner and
//! top-level Controller orchestration (§4.5, §4.7, §4.8, §4.9).

pub mod controller;
pub mod dependency;
pub mod integrations;
pub mod result;
pub mod state;

pub use controller::{run, InteractStage, RunOptions, RunOutcome};
pub use result::{DataPoint, FullResult, LogLevel};
pub use state::{StateManager, WaitResult};
