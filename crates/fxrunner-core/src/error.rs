use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::process::ProcessId;

/// Core error types for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("server.cfg error: {0}")]
    ConfigFile(#[from] ConfigFileError),

    #[error("server.cfg error: {0}")]
    PortDirective(#[from] PortDirectiveError),

    #[error("The server is already started (PID: {pid})")]
    AlreadyRunning { pid: ProcessId },

    #[error("Failed to start FXServer: {0}")]
    Launch(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Couldn't restart the server: {0}")]
    Restart(Box<SupervisorError>),
}

impl SupervisorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SupervisorError::Configuration(message.into())
    }

    pub fn launch(message: impl Into<String>) -> Self {
        SupervisorError::Launch(message.into())
    }

    /// Check if this error should abort the host process
    pub fn is_fatal(&self) -> bool {
        match self {
            SupervisorError::Configuration(_) | SupervisorError::Launch(_) => true,
            SupervisorError::Restart(inner) => inner.is_fatal(),
            _ => false,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The supervisor never retries on its own; this only tells an external
    /// trigger whether calling again can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            SupervisorError::AlreadyRunning { .. } | SupervisorError::Cancelled => true,
            SupervisorError::Restart(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}

/// Which step of reading the server config file failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFileErrorKind {
    /// The path cannot be turned into a single absolute location
    Ambiguous,
    /// The file could not be opened or read from disk
    Unreadable,
    /// The file was read but its contents cannot be used
    Malformed,
}

#[derive(Error, Debug)]
#[error("{} ({}): {}", .kind.message(), .path.display(), .detail)]
pub struct ConfigFileError {
    pub path: PathBuf,
    pub kind: ConfigFileErrorKind,
    pub detail: String,
}

impl ConfigFileErrorKind {
    fn message(self) -> &'static str {
        match self {
            ConfigFileErrorKind::Ambiguous => "Ambiguous config file path",
            ConfigFileErrorKind::Unreadable => "Config file is unreadable",
            ConfigFileErrorKind::Malformed => "Malformed config file",
        }
    }
}

impl ConfigFileError {
    pub fn new(path: impl Into<PathBuf>, kind: ConfigFileErrorKind, detail: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_unreadable(&self) -> bool {
        self.kind == ConfigFileErrorKind::Unreadable
    }

    /// Guidance for the operator, only given when the file system itself is the problem
    pub fn remediation(&self) -> Option<[&'static str; 2]> {
        self.is_unreadable().then_some([
            "You likely copied the data folder from another server, or moved/deleted your server files.",
            "Please fix the \"Server Data Folder\" and \"CFG File Path\" settings.",
        ])
    }
}

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?code>|<br\s*/?>").expect("invalid markup pattern"));

/// Strip the inline markup used to highlight config snippets
pub fn strip_markup(text: &str) -> String {
    MARKUP.replace_all(text, "").into_owned()
}

/// The endpoint port could not be derived from the config file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", strip_markup(.raw))]
pub struct PortDirectiveError {
    pub raw: String,
}

impl PortDirectiveError {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn plain(&self) -> String {
        strip_markup(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert!(SupervisorError::configuration("bad os").is_fatal());
        assert!(SupervisorError::launch("missing binary").is_fatal());
        assert!(!SupervisorError::AlreadyRunning { pid: 7 }.is_fatal());
        assert!(SupervisorError::AlreadyRunning { pid: 7 }.is_retryable());

        let nested = SupervisorError::Restart(Box::new(SupervisorError::launch("x")));
        assert!(nested.is_fatal());
        assert!(!nested.is_retryable());
    }

    #[test]
    fn test_unreadable_display_and_remediation() {
        let error = ConfigFileError::new("/srv/server.cfg", ConfigFileErrorKind::Unreadable, "No such file");
        let display = SupervisorError::from(error).to_string();
        assert!(display.contains("is unreadable"));
        assert!(display.to_lowercase().contains("unreadable"));

        let malformed = ConfigFileError::new("/srv/server.cfg", ConfigFileErrorKind::Malformed, "empty");
        assert!(malformed.remediation().is_none());
        let unreadable = ConfigFileError::new("/srv/server.cfg", ConfigFileErrorKind::Unreadable, "");
        assert!(unreadable.remediation().is_some());
    }

    #[test]
    fn test_port_directive_markup_stripped() {
        let error = PortDirectiveError::new(
            "Invalid port in line:<br><code>endpoint_add_tcp \"0.0.0.0:abc\"</code>",
        );
        assert_eq!(
            error.to_string(),
            "Invalid port in line:endpoint_add_tcp \"0.0.0.0:abc\""
        );
        assert!(error.raw.contains("<code>"));
    }
}
