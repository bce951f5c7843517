//! Wiring of the child's output streams to the output sink.
//!
//! Each inbound stream gets its own task. A read failure ends only that
//! stream; decode failures on the telemetry channel are logged and kept for
//! diagnostics without interrupting the stream.

use fxrunner_core::{
    ConsoleAudit, ConsoleTag, DecodeError, OutputPipe, OutputSink, ProcessId, TraceDecoder,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Buffer collecting stdout while a captured command is in flight
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    state: Mutex<CaptureState>,
}

#[derive(Debug, Default)]
struct CaptureState {
    enabled: bool,
    text: String,
}

impl CaptureBuffer {
    fn state(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset the buffer and start collecting
    pub fn start(&self) {
        let mut state = self.state();
        state.text.clear();
        state.enabled = true;
    }

    pub fn append(&self, chunk: &str) {
        let mut state = self.state();
        if state.enabled {
            state.text.push_str(chunk);
        }
    }

    /// Stop collecting and hand out what was captured
    pub fn finish(&self) -> String {
        let mut state = self.state();
        state.enabled = false;
        std::mem::take(&mut state.text)
    }

    /// Stop collecting and discard the buffer
    pub fn cancel(&self) {
        let mut state = self.state();
        state.enabled = false;
        state.text.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }
}

/// Diagnostics shared between the router tasks and the supervisor
#[derive(Debug, Default)]
pub struct RouterDiagnostics {
    last_trace_error: Mutex<Option<String>>,
}

impl RouterDiagnostics {
    pub fn last_trace_error(&self) -> Option<String> {
        self.last_trace_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_trace_error(&self, error: &DecodeError) {
        *self
            .last_trace_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }
}

/// Decodes a byte stream as UTF-8 without splitting multi-byte characters
/// across chunk boundaries. Invalid sequences are replaced.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let cut = incomplete_tail(&self.pending);
        let tail = self.pending.split_off(cut);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    /// Flush bytes held back at the end of the stream
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Index where an unfinished UTF-8 sequence starts, or the length if none
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let i = len - back;
        let width = match bytes[i] {
            0x80..=0xBF => continue,
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => 1,
        };
        return if width > back { i } else { len };
    }
    len
}

#[derive(Debug, Clone, Copy)]
enum TextChannel {
    Stdout,
    Stderr,
}

impl TextChannel {
    fn name(self) -> &'static str {
        match self {
            TextChannel::Stdout => "stdout",
            TextChannel::Stderr => "stderr",
        }
    }
}

/// Routes the inbound streams of one child
#[derive(Clone)]
pub struct IpcRouter {
    output: Arc<dyn OutputSink>,
    console: Arc<dyn ConsoleAudit>,
    capture: Arc<CaptureBuffer>,
    diagnostics: Arc<RouterDiagnostics>,
    verbose: bool,
}

impl IpcRouter {
    pub fn new(
        output: Arc<dyn OutputSink>,
        console: Arc<dyn ConsoleAudit>,
        capture: Arc<CaptureBuffer>,
        diagnostics: Arc<RouterDiagnostics>,
        verbose: bool,
    ) -> Self {
        Self {
            output,
            console,
            capture,
            diagnostics,
            verbose,
        }
    }

    /// Start one task per stream. The handles finish once every stream has
    /// reached end of file or failed.
    pub fn attach(
        &self,
        pid: ProcessId,
        stdout: OutputPipe,
        stderr: OutputPipe,
        telemetry: Option<OutputPipe>,
    ) -> Vec<JoinHandle<()>> {
        let mut readers = vec![
            tokio::spawn(self.clone().pump_text(pid, stdout, TextChannel::Stdout)),
            tokio::spawn(self.clone().pump_text(pid, stderr, TextChannel::Stderr)),
        ];
        if let Some(pipe) = telemetry {
            readers.push(tokio::spawn(self.clone().pump_telemetry(pid, pipe)));
        }
        readers
    }

    fn deliver(&self, channel: TextChannel, text: &str) {
        if text.is_empty() {
            return;
        }
        match channel {
            TextChannel::Stdout => {
                self.capture.append(text);
                self.output.write(text);
                self.console.record(text, ConsoleTag::Output);
            }
            TextChannel::Stderr => {
                self.output.write_error(text);
                self.console.record(text, ConsoleTag::Error);
            }
        }
    }

    async fn pump_text(self, pid: ProcessId, mut pipe: OutputPipe, channel: TextChannel) {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut decoder = Utf8ChunkDecoder::default();
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    self.deliver(channel, &text);
                }
                Err(e) => {
                    self.transport_error(pid, channel.name(), &e);
                    break;
                }
            }
        }
        let rest = decoder.finish();
        self.deliver(channel, &rest);
        debug!(pid = %pid, channel = channel.name(), "Stream closed");
    }

    async fn pump_telemetry(self, pid: ProcessId, mut pipe: OutputPipe) {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut decoder = TraceDecoder::new();
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for record in decoder.feed(&buf[..n]) {
                        self.handle_trace(pid, record);
                    }
                }
                Err(e) => {
                    self.transport_error(pid, "fd3", &e);
                    break;
                }
            }
        }
        for record in decoder.finish() {
            self.handle_trace(pid, record);
        }
        debug!(pid = %pid, channel = "fd3", "Stream closed");
    }

    fn handle_trace(&self, pid: ProcessId, record: Result<serde_json::Value, DecodeError>) {
        match record {
            Ok(value) => self.output.trace(value),
            Err(e) => {
                if self.verbose {
                    warn!(pid = %pid, "FD3 decode error: {}", e);
                } else {
                    debug!(pid = %pid, "FD3 decode error: {}", e);
                }
                self.diagnostics.record_trace_error(&e);
            }
        }
    }

    fn transport_error(&self, pid: ProcessId, channel: &str, error: &std::io::Error) {
        if self.verbose {
            warn!(pid = %pid, channel, "Read failed: {}", error);
        } else {
            debug!(pid = %pid, channel, "Read failed: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct RecordingSink {
        out: Mutex<String>,
        err: Mutex<String>,
        traces: Mutex<Vec<Value>>,
    }

    impl OutputSink for RecordingSink {
        fn write_header(&self) {}
        fn write(&self, chunk: &str) {
            self.out.lock().unwrap().push_str(chunk);
        }
        fn write_error(&self, chunk: &str) {
            self.err.lock().unwrap().push_str(chunk);
        }
        fn trace(&self, record: Value) {
            self.traces.lock().unwrap().push(record);
        }
    }

    #[derive(Default)]
    struct ConsoleMirror(Mutex<Vec<(String, ConsoleTag)>>);

    impl ConsoleAudit for ConsoleMirror {
        fn record(&self, text: &str, tag: ConsoleTag) {
            self.0.lock().unwrap().push((text.to_string(), tag));
        }
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut decoder = Utf8ChunkDecoder::default();
        let bytes = "olá €".as_bytes();
        // split inside the three-byte euro sign
        let (a, b) = bytes.split_at(bytes.len() - 1);
        assert_eq!(decoder.decode(a), "olá ");
        assert_eq!(decoder.decode(b), "€");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_utf8_invalid_bytes_are_replaced() {
        let mut decoder = Utf8ChunkDecoder::default();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"\xE2\x82"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_capture_only_while_enabled() {
        let capture = CaptureBuffer::default();
        capture.append("before");
        capture.start();
        capture.append("during");
        assert!(capture.is_enabled());
        assert_eq!(capture.finish(), "during");
        capture.append("after");
        assert_eq!(capture.finish(), "");
    }

    #[tokio::test]
    async fn test_streams_reach_their_sink_entry_points() {
        let sink = Arc::new(RecordingSink::default());
        let capture = Arc::new(CaptureBuffer::default());
        let console = Arc::new(ConsoleMirror::default());
        let diagnostics = Arc::new(RouterDiagnostics::default());
        let router = IpcRouter::new(
            sink.clone(),
            console.clone(),
            capture.clone(),
            diagnostics.clone(),
            false,
        );

        let (mut out_w, out_r) = tokio::io::duplex(64);
        let (mut err_w, err_r) = tokio::io::duplex(64);
        let (mut fd3_w, fd3_r) = tokio::io::duplex(64);
        capture.start();
        let readers = router.attach(7, Box::new(out_r), Box::new(err_r), Some(Box::new(fd3_r)));

        out_w.write_all(b"hello\n").await.unwrap();
        err_w.write_all(b"oops\n").await.unwrap();
        fd3_w.write_all(b"{\"t\":1}\n{bad}\n[2]").await.unwrap();
        drop((out_w, err_w, fd3_w));
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(*sink.out.lock().unwrap(), "hello\n");
        assert_eq!(*sink.err.lock().unwrap(), "oops\n");
        assert_eq!(*sink.traces.lock().unwrap(), [json!({"t":1}), json!([2])]);
        assert_eq!(capture.finish(), "hello\n");
        let mut mirrored = console.0.lock().unwrap().clone();
        mirrored.sort_by_key(|(_, tag)| *tag == ConsoleTag::Error);
        assert_eq!(
            mirrored,
            [
                ("hello\n".to_string(), ConsoleTag::Output),
                ("oops\n".to_string(), ConsoleTag::Error),
            ]
        );
        assert!(diagnostics.last_trace_error().is_some());
    }
}
