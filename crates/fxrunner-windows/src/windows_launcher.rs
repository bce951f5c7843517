use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info};

use fxrunner_core::*;

/// Windows-specific process handle implementation.
///
/// The child itself is owned by the exit future; termination is requested
/// through a channel so the kill and the wait never race on the same handle.
pub struct WindowsProcessHandle {
    pid: ProcessId,
    exited: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle for WindowsProcessHandle {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> TerminationResult {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender.map(|tx| tx.send(())) {
            Some(Ok(())) => {
                info!(pid=%self.pid, "Requested termination of process");
                TerminationResult::Success
            }
            _ => {
                debug!(pid=%self.pid, "Process already exited or termination already requested");
                TerminationResult::ProcessNotFound
            }
        }
    }
}

/// Launches the server with piped stdio. There is no telemetry channel
/// on this platform.
#[derive(Debug, Default)]
pub struct WindowsProcessLauncher;

impl WindowsProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for WindowsProcessLauncher {
    fn launch(&self, spec: &InvocationSpec) -> Result<LaunchedProcess> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW (0x08000000) - Creates a process without a console window
            cmd.creation_flags(0x08000000);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.executable.display()))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Spawned process has no PID"))?;
        info!(
            pid = %pid,
            command = %spec.executable.display(),
            args = ?spec.args,
            "Spawned Windows process"
        );

        let stdin = child.stdin.take().context("Child stdin was not piped")?;
        let stdout = child.stdout.take().context("Child stdout was not piped")?;
        let stderr = child.stderr.take().context("Child stderr was not piped")?;

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_flag = exited.clone();
        let exit = Box::pin(async move {
            let status = tokio::select! {
                biased;
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    child.start_kill()?;
                    child.wait().await
                }
            };
            exit_flag.store(true, Ordering::SeqCst);
            status.map(|s| s.code())
        });

        Ok(LaunchedProcess {
            handle: Box::new(WindowsProcessHandle {
                pid,
                exited,
                kill_tx: Mutex::new(Some(kill_tx)),
            }),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            telemetry: None,
            exit,
        })
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn cmd(script: &str) -> InvocationSpec {
        InvocationSpec {
            executable: PathBuf::from("cmd"),
            args: vec!["/C".to_string(), script.to_string()],
            working_directory: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let launcher = WindowsProcessLauncher::new();
        let child = launcher.launch(&cmd("exit 3")).unwrap();
        assert!(child.telemetry.is_none());
        assert_eq!(child.exit.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let launcher = WindowsProcessLauncher::new();
        let child = launcher.launch(&cmd("ping -n 30 127.0.0.1 > NUL")).unwrap();
        assert!(child.handle.is_running());

        assert_eq!(child.handle.terminate(), TerminationResult::Success);
        tokio::time::timeout(Duration::from_secs(5), child.exit)
            .await
            .expect("process should exit after termination")
            .unwrap();

        assert!(!child.handle.is_running());
        assert_eq!(child.handle.terminate(), TerminationResult::ProcessNotFound);
    }
}
