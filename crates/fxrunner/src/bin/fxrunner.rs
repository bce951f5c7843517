//! Minimal host for the supervisor.
//!
//! Reads `{ "runner": ..., "globals": ... }` from the JSON file given as the
//! first argument, optionally autostarts the server and forwards console
//! lines from stdin. Lines starting with `/` are supervisor commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fxrunner::{
    AdminGate, Capabilities, ConsoleAudit, ConsoleTag, Notifier, OutputSink, ProcessSupervisor,
    RunnerConfig, RuntimeGlobals, SupervisorError, TokenProvider, Translator, keys,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostConfig {
    runner: RunnerConfig,
    globals: RuntimeGlobals,
    #[serde(default)]
    api_token: String,
    #[serde(default)]
    admins: Vec<String>,
    /// Overrides for the built-in English messages
    #[serde(default)]
    messages: HashMap<String, String>,
}

impl HostConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config in {}", path.display()))
    }
}

struct StdioSink;

impl OutputSink for StdioSink {
    fn write_header(&self) {
        println!("\n=== FXServer output ===");
    }

    fn write(&self, chunk: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }

    fn write_error(&self, chunk: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(chunk.as_bytes());
        let _ = err.flush();
    }

    fn trace(&self, record: Value) {
        debug!(target: "fxrunner::trace", "{}", record);
    }
}

struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn announce(&self, message: &str) -> Result<()> {
        info!(target: "fxrunner::announce", "{}", message);
        Ok(())
    }
}

struct Messages(HashMap<String, String>);

impl Messages {
    fn with_overrides(overrides: HashMap<String, String>) -> Self {
        let mut messages: HashMap<String, String> = [
            (keys::SPAWNING_ANNOUNCEMENT, "{{servername}} is starting."),
            (keys::RESTARTING, "Server restarting ({{reason}})."),
            (keys::RESTARTING_ANNOUNCEMENT, "{{servername}} is restarting ({{reason}})."),
            (keys::STOPPING, "Server shutting down ({{reason}})."),
            (keys::STOPPING_ANNOUNCEMENT, "{{servername}} is shutting down ({{reason}})."),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        messages.extend(overrides);
        Self(messages)
    }
}

impl Translator for Messages {
    fn translate(&self, key: &str, vars: &[(&str, &str)]) -> String {
        let Some(template) = self.0.get(key) else {
            return key.to_string();
        };
        vars.iter().fold(template.clone(), |text, (name, value)| {
            text.replace(&format!("{{{{{name}}}}}"), value)
        })
    }
}

struct StaticToken(String);

impl TokenProvider for StaticToken {
    fn api_token(&self) -> String {
        self.0.clone()
    }
}

struct AdminList(Vec<String>);

impl AdminGate for AdminList {
    fn has_admins(&self) -> bool {
        !self.0.is_empty()
    }
}

struct ConsoleLog;

impl ConsoleAudit for ConsoleLog {
    fn record(&self, text: &str, tag: ConsoleTag) {
        debug!(target: "fxrunner::console", tag = ?tag, "{}", text);
    }
}

fn split_reason(rest: &str) -> Option<&str> {
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

/// Abort on errors the supervisor cannot recover from
fn check_fatal(result: Result<(), SupervisorError>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!("{}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

async fn handle_line(supervisor: &ProcessSupervisor, line: &str) -> Result<()> {
    let Some(control) = line.strip_prefix('/') else {
        if !supervisor.send(line).await {
            warn!("Command not sent, is the server running?");
        }
        return Ok(());
    };

    let (verb, rest) = control.split_once(' ').unwrap_or((control, ""));
    match verb {
        "start" => check_fatal(supervisor.spawn(true))?,
        "stop" => {
            supervisor.kill(split_reason(rest)).await;
        }
        "restart" => check_fatal(supervisor.restart(split_reason(rest)).await)?,
        "status" => info!(
            "status: {} | uptime: {}s | endpoint: {}",
            supervisor.status(),
            supervisor.uptime_seconds(),
            supervisor
                .endpoint()
                .map_or_else(|| "-".to_string(), |e| e.to_string())
        ),
        "capture" => match supervisor
            .send_and_capture(rest, Some(Duration::from_millis(1500)))
            .await
        {
            Some(text) => println!("{text}"),
            None => warn!("Command not sent, is the server running?"),
        },
        other => warn!("Unknown supervisor command: /{}", other),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: fxrunner <config.json>")?;
    let host = HostConfig::load(&path)?;

    let default_level = if host.globals.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting fxrunner for {}", host.globals.server_name);
    host.globals.ensure_host_os()?;

    let capabilities = Capabilities {
        notifier: Arc::new(LogNotifier),
        translator: Arc::new(Messages::with_overrides(host.messages)),
        tokens: Arc::new(StaticToken(host.api_token)),
        admins: Arc::new(AdminList(host.admins)),
        console: Arc::new(ConsoleLog),
        output: Arc::new(StdioSink),
    };
    let supervisor = Arc::new(ProcessSupervisor::new(host.runner, host.globals, capabilities)?);

    let mut autostart = supervisor.schedule_autostart();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping server");
                break;
            }
            Some(result) = async { autostart.as_mut()?.await.ok() } => {
                autostart = None;
                if let Err(e) = check_fatal(result) {
                    error!("{:#}", e);
                    supervisor.shutdown().await;
                    return Err(e);
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = handle_line(&supervisor, line.trim_end()).await {
                        error!("{:#}", e);
                        supervisor.shutdown().await;
                        return Err(e);
                    }
                }
                Ok(None) => {
                    info!("Console closed, stopping server");
                    break;
                }
                Err(e) => {
                    error!("Failed to read console: {}", e);
                    break;
                }
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}
