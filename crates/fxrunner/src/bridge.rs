use fxrunner_core::{CommandPipe, ConsoleAudit, ConsoleTag, ProcessId};
use regex::Regex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::router::CaptureBuffer;

/// Capture window used when the caller does not pick one
pub const DEFAULT_CAPTURE_WINDOW: Duration = Duration::from_millis(1500);

/// Longest a console write may wait on a server that stopped reading stdin
pub const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

static ANSI_COLOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[\d+(;\d)?m").expect("invalid color pattern"));

/// Remove terminal color sequences from captured output
pub fn strip_ansi(text: &str) -> String {
    ANSI_COLOR.replace_all(text, "").into_owned()
}

/// Build a console command with every parameter quoted.
///
/// Double quotes inside parameters are replaced by a full-width quote so
/// they cannot end the argument early.
pub fn format_command(command: &str, params: &[&str]) -> String {
    let mut line = command.to_string();
    for param in params {
        line.push_str(" \"");
        line.push_str(&param.replace('"', "\u{FF02}"));
        line.push('"');
    }
    line
}

/// Shared writer for the child's stdin
#[derive(Clone)]
pub struct CommandWriter {
    pid: ProcessId,
    inner: Arc<Mutex<CommandPipe>>,
    disconnected: Arc<AtomicBool>,
}

impl CommandWriter {
    pub fn new(pid: ProcessId, pipe: CommandPipe) -> Self {
        Self {
            pid,
            inner: Arc::new(Mutex::new(pipe)),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Write `command` and a newline.
    ///
    /// Waiting for the pipe lock counts against [`STDIN_WRITE_TIMEOUT`], so
    /// a stalled writer cannot hold up the ones queued behind it.
    pub async fn write_line(&self, command: &str) -> io::Result<()> {
        let write = async {
            let mut pipe = self.inner.lock().await;
            pipe.write_all(command.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            pipe.flush().await
        };
        let result = match tokio::time::timeout(STDIN_WRITE_TIMEOUT, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("server did not read its console within {STDIN_WRITE_TIMEOUT:?}"),
            )),
        };

        match &result {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(_) if !self.disconnected.swap(true, Ordering::SeqCst) => {
                warn!(pid = %self.pid, ">> [{}] FXServer Disconnected.", self.pid);
            }
            _ => {}
        }
        result
    }
}

/// Sends console commands to the running server
#[derive(Clone)]
pub struct CommandBridge {
    console: Arc<dyn ConsoleAudit>,
    capture: Arc<CaptureBuffer>,
    verbose: bool,
}

impl CommandBridge {
    pub fn new(console: Arc<dyn ConsoleAudit>, capture: Arc<CaptureBuffer>, verbose: bool) -> Self {
        Self {
            console,
            capture,
            verbose,
        }
    }

    /// Write one command line. Failures are logged and reported as `false`.
    pub async fn send(&self, writer: Option<&CommandWriter>, command: &str) -> bool {
        let Some(writer) = writer else {
            debug!("No server running, dropping command: {}", command);
            return false;
        };

        match writer.write_line(command).await {
            Ok(()) => {
                self.console.record(command, ConsoleTag::Command);
                true
            }
            Err(e) => {
                if self.verbose {
                    warn!(pid = %writer.pid(), "Error writing to server stdin: {}", e);
                } else {
                    debug!(pid = %writer.pid(), "Error writing to server stdin: {}", e);
                }
                false
            }
        }
    }

    /// Send a command and return the stdout produced during `window`.
    ///
    /// Returns `None` without waiting when there is no server or the write
    /// fails.
    pub async fn send_and_capture(
        &self,
        writer: Option<&CommandWriter>,
        command: &str,
        window: Duration,
    ) -> Option<String> {
        let writer = writer?;
        self.capture.start();
        if !self.send(Some(writer), command).await {
            self.capture.cancel();
            return None;
        }
        tokio::time::sleep(window).await;
        Some(strip_ansi(&self.capture.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct AuditLog(StdMutex<Vec<(String, ConsoleTag)>>);

    impl ConsoleAudit for AuditLog {
        fn record(&self, text: &str, tag: ConsoleTag) {
            self.0.lock().unwrap().push((text.to_string(), tag));
        }
    }

    #[test]
    fn test_format_command_quotes_params() {
        assert_eq!(
            format_command("quit", &[r#"Server "restarting""#]),
            "quit \"Server \u{FF02}restarting\u{FF02}\""
        );
        assert_eq!(format_command("say", &["a", "b"]), r#"say "a" "b""#);
        assert_eq!(format_command("status", &[]), "status");
    }

    #[test]
    fn test_strip_ansi_colors() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m \x1b[1;3mbold"), "ok bold");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[tokio::test]
    async fn test_send_writes_line_and_audits() {
        let audit = Arc::new(AuditLog::default());
        let bridge = CommandBridge::new(audit.clone(), Arc::new(CaptureBuffer::default()), false);
        let (stdin_w, mut stdin_r) = tokio::io::duplex(64);
        let writer = CommandWriter::new(1, Box::new(stdin_w));

        assert!(bridge.send(Some(&writer), "status").await);
        let mut buf = [0u8; 7];
        stdin_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"status\n");
        assert_eq!(
            *audit.0.lock().unwrap(),
            [("status".to_string(), ConsoleTag::Command)]
        );
    }

    #[tokio::test]
    async fn test_send_to_closed_pipe_returns_false() {
        let audit = Arc::new(AuditLog::default());
        let capture = Arc::new(CaptureBuffer::default());
        let bridge = CommandBridge::new(audit.clone(), capture.clone(), true);
        let (stdin_w, stdin_r) = tokio::io::duplex(64);
        drop(stdin_r);
        let writer = CommandWriter::new(1, Box::new(stdin_w));

        assert!(!bridge.send(Some(&writer), "status").await);
        assert!(audit.0.lock().unwrap().is_empty());

        assert_eq!(
            bridge
                .send_and_capture(Some(&writer), "status", Duration::from_secs(60))
                .await,
            None
        );
        assert!(!capture.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_stalled_reader_gives_up() {
        let audit = Arc::new(AuditLog::default());
        let bridge = CommandBridge::new(audit.clone(), Arc::new(CaptureBuffer::default()), false);
        let (stdin_w, _stdin_r) = tokio::io::duplex(16);
        let writer = CommandWriter::new(1, Box::new(stdin_w));

        let long_line = "x".repeat(64);
        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(
            bridge.send(Some(&writer), &long_line),
            bridge.send(Some(&writer), "status"),
        );
        assert!(!first);
        assert!(!second);
        assert!(started.elapsed() >= STDIN_WRITE_TIMEOUT);
        assert!(started.elapsed() < STDIN_WRITE_TIMEOUT * 2);
        assert!(audit.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_writer_means_no_send() {
        let bridge = CommandBridge::new(
            Arc::new(AuditLog::default()),
            Arc::new(CaptureBuffer::default()),
            false,
        );
        assert!(!bridge.send(None, "status").await);
        assert_eq!(
            bridge.send_and_capture(None, "status", DEFAULT_CAPTURE_WINDOW).await,
            None
        );
    }
}
