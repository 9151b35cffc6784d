//! Command-line surface: argument parsing and one executor per subcommand,
//! wired into `ptb-manager`, `ptb-state` and `ptb-fabric`.

pub mod commands;
pub mod output;

pub use commands::{Cli, run};
