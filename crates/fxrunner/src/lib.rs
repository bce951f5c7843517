//! fxrunner - supervisor for a single FXServer process
//!
//! [`ProcessSupervisor`] spawns the server with the launcher for the current
//! platform, routes its output streams, sends console commands and keeps the
//! lifecycle history its status is derived from.

mod bridge;
mod factory;
mod router;
mod supervisor;

pub use bridge::{
    CommandBridge, CommandWriter, DEFAULT_CAPTURE_WINDOW, STDIN_WRITE_TIMEOUT, format_command,
    strip_ansi,
};
pub use factory::{PlatformLauncherFactory, create_process_launcher};
pub use router::{CaptureBuffer, IpcRouter, RouterDiagnostics, Utf8ChunkDecoder};
pub use supervisor::{ProcessSupervisor, ServerEndpoint};

// Re-export core functionality
pub use fxrunner_core::*;
