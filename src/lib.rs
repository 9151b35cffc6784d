//! Root facade crate: re-exports the workspace libraries that make up the
//! testbed orchestrator so downstream consumers can depend on a single
//! `ptb` crate instead of each `ptb-*` member individually.

pub use ptb_cli as cli;
pub use ptb_core as core;
