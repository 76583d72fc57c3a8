//! Runtime-agnostic command execution library
//!
//! This crate is the lowest layer of the deployment tooling: every external
//! collaborator (container runtime, compose engine, service manager, HTTP
//! probe) is reached by launching a host command through a [`Launcher`].
//! The crate does not pick an async runtime; callers drive the returned
//! futures and streams with whichever executor they use.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod event;
pub mod launcher;
pub mod process;

pub use backends::LocalLauncher;
pub use command::Command;
pub use error::{Error, Result};
pub use event::{ProcessEvent, ProcessEventType};
pub use launcher::Launcher;
pub use process::{ExitResult, ExitStatus, ProcessHandle};
