//! Backend implementations for different execution contexts
//!
//! Only the local host is supported: the container runtime, compose engine
//! and service manager are all driven through their CLIs on the same machine.

pub mod local;
pub use local::{LocalLauncher, LocalProcessHandle, ProcessEventStream};
