//! In-guest Agent: connects to the Controller's control endpoint, mounts the
//! 9p shares, runs the Instance's setup script, loads and supervises its
//! Applications, and exposes a local daemon for external processes to report
//! through.

pub mod apps;
pub mod clock;
pub mod daemon;
pub mod dispatch;
pub mod events;
pub mod marker;
pub mod mounts;
pub mod preserve;
pub mod setup;
pub mod transport;
