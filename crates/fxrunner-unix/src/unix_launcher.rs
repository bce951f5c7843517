use anyhow::Result;
use fxrunner_core::{InvocationSpec, LaunchedProcess, ProcessLauncher};

/// File descriptor the server writes its telemetry stream to
pub const TELEMETRY_FD: i32 = 3;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use anyhow::Context;
    use fxrunner_core::{ProcessHandle, ProcessId, TerminationResult};
    use nix::fcntl::OFlag;
    use nix::libc;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{Pid as NixPid, pipe2};
    use std::os::fd::AsRawFd;
    use std::process::Stdio;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::unix::pipe;
    use tokio::process::Command;
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        pid: ProcessId,
        /// Set by the exit future once the child has been waited on
        reaped: Arc<AtomicBool>,
    }

    impl UnixProcessHandle {
        fn nix_pid(&self) -> NixPid {
            NixPid::from_raw(self.pid as i32)
        }
    }

    impl ProcessHandle for UnixProcessHandle {
        fn pid(&self) -> ProcessId {
            self.pid
        }

        fn is_running(&self) -> bool {
            if self.reaped.load(Ordering::SeqCst) {
                return false;
            }
            // Send signal 0 to check if process exists
            signal::kill(self.nix_pid(), None).is_ok()
        }

        fn terminate(&self) -> TerminationResult {
            // a reaped pid may already belong to another process
            if self.reaped.load(Ordering::SeqCst) {
                debug!("Process {} already reaped, not signalling", self.pid);
                return TerminationResult::ProcessNotFound;
            }

            match signal::kill(self.nix_pid(), Signal::SIGTERM) {
                Ok(()) => {
                    info!("Sent SIGTERM to process {}", self.pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!("Process {} not found (already terminated)", self.pid);
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to terminate process {}", self.pid);
                    TerminationResult::PermissionDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process {}: {}", self.pid, e);
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }
    }

    /// Launches the server with piped stdio and the telemetry pipe on fd 3
    #[derive(Debug, Default)]
    pub struct UnixProcessLauncher;

    impl UnixProcessLauncher {
        pub fn new() -> Self {
            Self
        }
    }

    impl ProcessLauncher for UnixProcessLauncher {
        fn launch(&self, spec: &InvocationSpec) -> Result<LaunchedProcess> {
            let (read_end, write_end) =
                pipe2(OFlag::O_CLOEXEC).context("Failed to create telemetry pipe")?;
            let write_fd = write_end.as_raw_fd();

            let mut cmd = Command::new(&spec.executable);
            cmd.args(&spec.args)
                .current_dir(&spec.working_directory)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            // Own process group so terminal signals reach only the supervisor
            cmd.process_group(0);

            // Only async-signal-safe calls between fork and exec
            unsafe {
                cmd.pre_exec(move || {
                    if write_fd == TELEMETRY_FD {
                        let flags = libc::fcntl(write_fd, libc::F_GETFD);
                        if flags < 0
                            || libc::fcntl(write_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                        {
                            return Err(std::io::Error::last_os_error());
                        }
                    } else if libc::dup2(write_fd, TELEMETRY_FD) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            let mut child = cmd.spawn().with_context(|| {
                format!("Failed to spawn {}", spec.executable.display())
            })?;
            // The child holds its own copy; ours must go for EOF to reach the reader
            drop(write_end);

            let pid = child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Spawned process has no PID"))?;
            info!(
                "Spawned Unix process: {} (PID: {}) with args: {:?}",
                spec.executable.display(),
                pid,
                spec.args
            );

            let stdin = child.stdin.take().context("Child stdin was not piped")?;
            let stdout = child.stdout.take().context("Child stdout was not piped")?;
            let stderr = child.stderr.take().context("Child stderr was not piped")?;
            let telemetry = pipe::Receiver::from_owned_fd(read_end)
                .context("Failed to register telemetry pipe")?;

            let reaped = Arc::new(AtomicBool::new(false));
            let exit_reaped = reaped.clone();
            let exit = Box::pin(async move {
                let status = child.wait().await;
                exit_reaped.store(true, Ordering::SeqCst);
                status.map(|s| s.code())
            });

            Ok(LaunchedProcess {
                handle: Box::new(UnixProcessHandle { pid, reaped }),
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
                telemetry: Some(Box::new(telemetry)),
                exit,
            })
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessLauncher};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
#[derive(Debug, Default)]
pub struct UnixProcessLauncher;

#[cfg(not(unix))]
impl UnixProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl ProcessLauncher for UnixProcessLauncher {
    fn launch(&self, _spec: &InvocationSpec) -> Result<LaunchedProcess> {
        anyhow::bail!("Unix launcher is not available on this platform")
    }
}
