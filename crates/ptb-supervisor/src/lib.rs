//! Per-Instance supervisor (§4.3): cloud-init seed generation, hypervisor
//! spawn, control-stream ferry, and orderly shutdown.

pub mod ferry;
pub mod hypervisor;
pub mod seed;
pub mod supervisor;
pub mod transport;

pub use supervisor::{InstanceSpec, RunningInstance, start_instance};
pub use transport::ControlEndpoint;
