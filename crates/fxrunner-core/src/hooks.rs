//! Interfaces of the collaborators the supervisor talks to.
//!
//! All of them are resolved once by the host and handed to the supervisor
//! as a [`Capabilities`] bundle.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Receives everything the server process writes
pub trait OutputSink: Send + Sync {
    /// Called once per successful spawn, before any output
    fn write_header(&self);
    /// Decoded stdout chunk
    fn write(&self, chunk: &str);
    /// Decoded stderr chunk
    fn write_error(&self, chunk: &str);
    /// Decoded telemetry record from the auxiliary channel
    fn trace(&self, record: Value);
}

/// Outbound announcements (chat, webhooks, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn announce(&self, message: &str) -> Result<()>;
}

pub trait Translator: Send + Sync {
    fn translate(&self, key: &str, vars: &[(&str, &str)]) -> String;
}

/// Source of the token the server uses to call back into the admin API
pub trait TokenProvider: Send + Sync {
    fn api_token(&self) -> String;
}

pub trait AdminGate: Send + Sync {
    fn has_admins(&self) -> bool;
}

/// Tag distinguishing operator commands from other console lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleTag {
    /// Line written to the server's stdin
    Command,
    /// Chunk the server wrote to stdout
    Output,
    /// Chunk the server wrote to stderr
    Error,
}

/// Mirror of the console shown to operators
pub trait ConsoleAudit: Send + Sync {
    fn record(&self, text: &str, tag: ConsoleTag);
}

pub mod keys {
    pub const SPAWNING_ANNOUNCEMENT: &str = "server_actions.spawning_discord";
    pub const RESTARTING: &str = "server_actions.restarting";
    pub const RESTARTING_ANNOUNCEMENT: &str = "server_actions.restarting_discord";
    pub const STOPPING: &str = "server_actions.stopping";
    pub const STOPPING_ANNOUNCEMENT: &str = "server_actions.stopping_discord";
}

#[derive(Clone)]
pub struct Capabilities {
    pub notifier: Arc<dyn Notifier>,
    pub translator: Arc<dyn Translator>,
    pub tokens: Arc<dyn TokenProvider>,
    pub admins: Arc<dyn AdminGate>,
    pub console: Arc<dyn ConsoleAudit>,
    pub output: Arc<dyn OutputSink>,
}
