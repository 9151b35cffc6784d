//! Application Loader and the built-in Applications run by the in-guest
//! Agent: `ping`, `iperf3-client`/`iperf3-server`, `procmon`, `run-program`
//! (§4.6).

pub mod interface;
pub mod iperf;
pub mod loader;
pub mod ping;
pub mod procmon;
pub mod run_program;

pub use interface::{AppEvent, AppInterface, LogLevel};
pub use loader::Application;
