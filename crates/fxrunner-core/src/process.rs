use anyhow::Result;
use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::invocation::InvocationSpec;

/// Unique identifier for a process
pub type ProcessId = u32;

pub type CommandPipe = Box<dyn AsyncWrite + Send + Unpin>;
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves once the process has exited, yielding its exit code when it has one
pub type ExitFuture = Pin<Box<dyn Future<Output = io::Result<Option<i32>>> + Send>>;

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Termination signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    PermissionDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// The process is gone or about to be
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Trait representing a handle to a running process
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> ProcessId;

    /// Check if the process is still running (non-blocking)
    fn is_running(&self) -> bool;

    /// Deliver a termination signal without waiting for the process to exit
    fn terminate(&self) -> TerminationResult;
}

/// Everything the supervisor needs from a freshly created child
pub struct LaunchedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub stdin: CommandPipe,
    pub stdout: OutputPipe,
    pub stderr: OutputPipe,
    /// Auxiliary telemetry channel (fd3); absent on platforms without it
    pub telemetry: Option<OutputPipe>,
    pub exit: ExitFuture,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.handle.pid())
            .field("telemetry", &self.telemetry.is_some())
            .finish_non_exhaustive()
    }
}

/// Creates child processes from an invocation.
///
/// Launching is synchronous so the supervisor can create the child and
/// record it without yielding in between. Implementations must be called
/// from within a tokio runtime.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &InvocationSpec) -> Result<LaunchedProcess>;
}

/// Factory trait for creating platform-specific launchers
pub trait ProcessLauncherFactory {
    /// The type of launcher this factory creates
    type Launcher: ProcessLauncher;

    /// Create a launcher for the current platform
    fn create_launcher() -> Self::Launcher;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
