use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SupervisorError;

/// Smallest ledger that still lets the status projector compare two records
pub const MIN_HISTORY_LIMIT: usize = 2;

/// Value passed to the server's `onesync` flag
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSync {
    #[default]
    On,
    Legacy,
    Off,
}

impl fmt::Display for NetworkSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkSync::On => "on",
            NetworkSync::Legacy => "legacy",
            NetworkSync::Off => "off",
        })
    }
}

/// Per-spawn runner configuration, re-read before every spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into, strip_option))]
pub struct RunnerConfig {
    /// Extra command-line arguments, tokenized with shell quoting rules
    #[serde(default)]
    #[builder(default)]
    pub command_line: Option<String>,

    /// Server config file, absolute or relative to `server_data_path`
    #[serde(default)]
    #[builder(default)]
    pub cfg_path: Option<PathBuf>,

    /// Server data directory, also used as the working directory
    #[serde(default)]
    #[builder(default)]
    pub server_data_path: Option<PathBuf>,

    #[serde(default)]
    #[builder(default)]
    pub network_sync: NetworkSync,

    /// Delay between kill and respawn during a restart (in milliseconds)
    #[serde(default = "default_restart_delay_ms")]
    #[builder(default = "default_restart_delay_ms()")]
    pub restart_delay_ms: u64,

    #[serde(default)]
    #[builder(default)]
    pub autostart: bool,

    #[serde(default = "default_autostart_delay_secs")]
    #[builder(default = "default_autostart_delay_secs()")]
    pub autostart_delay_secs: u64,

    /// Port used when the config file does not declare a usable endpoint
    #[serde(default)]
    #[builder(default)]
    pub forced_port: Option<u16>,

    /// Number of lifecycle records kept in memory
    #[serde(default = "default_history_limit")]
    #[builder(default = "default_history_limit()")]
    pub history_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command_line: None,
            cfg_path: None,
            server_data_path: None,
            network_sync: NetworkSync::default(),
            restart_delay_ms: default_restart_delay_ms(),
            autostart: false,
            autostart_delay_secs: default_autostart_delay_secs(),
            forced_port: None,
            history_limit: default_history_limit(),
        }
    }
}

impl RunnerConfig {
    pub fn builder() -> RunnerConfigBuilder {
        RunnerConfigBuilder::default()
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn autostart_delay(&self) -> Duration {
        Duration::from_secs(self.autostart_delay_secs)
    }

    /// Both paths needed to launch are present
    pub fn has_server_paths(&self) -> bool {
        self.cfg_path.is_some() && self.server_data_path.is_some()
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.history_limit < MIN_HISTORY_LIMIT {
            return Err(SupervisorError::configuration(format!(
                "historyLimit must be at least {MIN_HISTORY_LIMIT}"
            )));
        }
        if self.forced_port == Some(0) {
            return Err(SupervisorError::configuration("forcedPort cannot be 0"));
        }
        Ok(())
    }
}

/// Operating system profile used to build the launch invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl OsFamily {
    /// Profile for the platform this binary was compiled for
    pub fn detect() -> Result<Self, SupervisorError> {
        std::env::consts::OS.parse()
    }
}

impl FromStr for OsFamily {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(OsFamily::Linux),
            "windows" => Ok(OsFamily::Windows),
            other => Err(SupervisorError::configuration(format!(
                "OS type not supported: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for OsFamily {
    type Error = SupervisorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OsFamily> for String {
    fn from(value: OsFamily) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
        })
    }
}

/// Which player checks the server must ask the admin API about on join
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCheck {
    #[serde(default)]
    pub ban: bool,
    #[serde(default)]
    pub whitelist: bool,
}

impl JoinCheck {
    pub fn enabled(&self) -> bool {
        self.ban || self.whitelist
    }
}

/// Process-wide values owned by the host, fixed for the lifetime of the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeGlobals {
    pub os: OsFamily,
    /// Directory holding the server installation
    pub fx_server_path: PathBuf,
    pub version: String,
    #[serde(default)]
    pub verbose: bool,
    /// Port of the admin API the server reports back to
    pub api_port: u16,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub force_interface: Option<String>,
    #[serde(default)]
    pub join_check: JoinCheck,
    #[serde(default)]
    pub server_name: String,
}

impl RuntimeGlobals {
    /// Interface used for both the admin API host and the server endpoint
    pub fn interface(&self) -> &str {
        self.force_interface.as_deref().unwrap_or("127.0.0.1")
    }

    /// Fail unless `os` is the family this binary was built for
    pub fn ensure_host_os(&self) -> Result<(), SupervisorError> {
        let host = OsFamily::detect()?;
        if host != self.os {
            return Err(SupervisorError::configuration(format!(
                "Configured OS {} does not match this build ({host})",
                self.os
            )));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_restart_delay_ms() -> u64 {
    750
}
fn default_autostart_delay_secs() -> u64 {
    2
}
fn default_history_limit() -> usize {
    64
}
fn default_locale() -> String {
    "en".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.restart_delay(), Duration::from_millis(750));
        assert!(!config.has_server_paths());
    }

    #[test]
    fn test_builder_matches_defaults() {
        let config = RunnerConfig::builder()
            .cfg_path("server.cfg")
            .server_data_path("/srv/data")
            .build()
            .unwrap();
        assert!(config.has_server_paths());
        assert_eq!(config.history_limit, 64);
        assert_eq!(config.network_sync, NetworkSync::On);
    }

    #[test]
    fn test_invalid_config() {
        let config = RunnerConfig {
            history_limit: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunnerConfig {
            forced_port: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let config: RunnerConfig = serde_json::from_str(
            r#"{"cfgPath":"server.cfg","serverDataPath":"/srv","networkSync":"legacy","restartDelayMs":0}"#,
        )
        .unwrap();
        assert_eq!(config.network_sync, NetworkSync::Legacy);
        assert_eq!(config.restart_delay_ms, 0);
        assert_eq!(config.autostart_delay_secs, 2);
    }

    #[test]
    fn test_os_family_parsing() {
        assert_eq!("linux".parse::<OsFamily>().unwrap(), OsFamily::Linux);
        assert_eq!("windows".parse::<OsFamily>().unwrap(), OsFamily::Windows);

        let error = "darwin".parse::<OsFamily>().unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("darwin"));

        let globals: Result<RuntimeGlobals, _> = serde_json::from_str(
            r#"{"os":"solaris","fxServerPath":"/opt","version":"1","apiPort":40120}"#,
        );
        assert!(globals.is_err());
    }

    #[cfg(any(target_os = "linux", target_os = "windows"))]
    #[test]
    fn test_host_os_must_match_globals() {
        let host = OsFamily::detect().unwrap();
        let other = match host {
            OsFamily::Linux => OsFamily::Windows,
            OsFamily::Windows => OsFamily::Linux,
        };
        let mut globals: RuntimeGlobals = serde_json::from_str(
            r#"{"os":"linux","fxServerPath":"/opt","version":"1","apiPort":40120}"#,
        )
        .unwrap();

        globals.os = host;
        assert!(globals.ensure_host_os().is_ok());

        globals.os = other;
        let error = globals.ensure_host_os().unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains(&other.to_string()));
    }

    #[test]
    fn test_globals_interface() {
        let mut globals: RuntimeGlobals = serde_json::from_str(
            r#"{"os":"linux","fxServerPath":"/opt","version":"1","apiPort":40120}"#,
        )
        .unwrap();
        assert_eq!(globals.locale, "en");
        assert_eq!(globals.interface(), "127.0.0.1");

        globals.force_interface = Some("10.0.0.2".to_string());
        assert_eq!(globals.interface(), "10.0.0.2");
    }
}
