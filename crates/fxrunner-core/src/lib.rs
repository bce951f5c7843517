//! fxrunner core - platform-independent pieces of the server supervisor
//!
//! This crate provides the configuration, error types, process traits and
//! the pure building blocks (invocation, port lookup, lifecycle history,
//! status projection, telemetry decoding) shared by the platform crates.

mod config;
mod error;
mod hooks;
mod invocation;
mod ledger;
mod port;
mod process;
mod status;
mod trace;

pub use config::*;
pub use error::*;
pub use hooks::*;
pub use invocation::*;
pub use ledger::*;
pub use port::*;
pub use process::*;
pub use status::*;
pub use trace::*;
