//! Locates the endpoint port declared in the server config file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ConfigFileError, ConfigFileErrorKind, PortDirectiveError};

/// One non-empty, non-comment line of the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub line: String,
    pub name: String,
    pub args: Vec<String>,
}

/// An `endpoint_add_*` declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDirective {
    pub protocol: EndpointProtocol,
    pub interface: IpAddr,
    pub port: u16,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointProtocol {
    Tcp,
    Udp,
}

/// Resolve the config file against the data directory
pub fn resolve_cfg_path(cfg_path: &Path, data_path: &Path) -> Result<PathBuf, ConfigFileError> {
    if cfg_path.as_os_str().is_empty() {
        return Err(ConfigFileError::new(
            cfg_path,
            ConfigFileErrorKind::Ambiguous,
            "empty config file path",
        ));
    }
    let resolved = if cfg_path.is_absolute() {
        cfg_path.to_path_buf()
    } else {
        data_path.join(cfg_path)
    };
    if !resolved.is_absolute() {
        return Err(ConfigFileError::new(
            resolved,
            ConfigFileErrorKind::Ambiguous,
            "config file path is relative to a relative data directory",
        ));
    }
    Ok(resolved)
}

/// Read the raw config file text
pub fn read_cfg_file(path: &Path) -> Result<String, ConfigFileError> {
    let bytes = std::fs::read(path).map_err(|e| {
        ConfigFileError::new(path, ConfigFileErrorKind::Unreadable, e.to_string())
    })?;
    let text = String::from_utf8(bytes).map_err(|e| {
        ConfigFileError::new(path, ConfigFileErrorKind::Malformed, format!("not valid UTF-8: {e}"))
    })?;
    if text.trim().is_empty() {
        return Err(ConfigFileError::new(
            path,
            ConfigFileErrorKind::Malformed,
            "the file is empty",
        ));
    }
    Ok(text)
}

/// Cut a line at the first `#` or `//` that is not inside quotes
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    let mut chars = line.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '#') => return &line[..idx],
            (None, '/') if matches!(chars.peek(), Some((_, '/'))) => return &line[..idx],
            _ => {}
        }
    }
    line
}

/// Split the config text into directives, skipping lines that do not tokenize
pub fn parse_directives(text: &str) -> Vec<Directive> {
    text.lines()
        .filter_map(|raw| {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                return None;
            }
            match shell_words::split(line) {
                Ok(mut tokens) if !tokens.is_empty() => {
                    let name = tokens.remove(0);
                    Some(Directive {
                        line: line.to_string(),
                        name,
                        args: tokens,
                    })
                }
                Ok(_) => None,
                Err(e) => {
                    debug!("Skipping config line that does not tokenize ({e}): {line}");
                    None
                }
            }
        })
        .collect()
}

fn parse_endpoint(directive: &Directive) -> Result<Option<EndpointDirective>, PortDirectiveError> {
    let protocol = match directive.name.to_ascii_lowercase().as_str() {
        "endpoint_add_tcp" => EndpointProtocol::Tcp,
        "endpoint_add_udp" => EndpointProtocol::Udp,
        _ => return Ok(None),
    };
    let invalid = || {
        PortDirectiveError::new(format!(
            "Invalid endpoint in line:<br><code>{}</code>",
            directive.line
        ))
    };

    let address = directive.args.first().ok_or_else(invalid)?;
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let interface: IpAddr = host.parse().map_err(|_| invalid())?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }

    Ok(Some(EndpointDirective {
        protocol,
        interface,
        port,
        line: directive.line.clone(),
    }))
}

/// Scan directives for the endpoint port.
///
/// Requires at least one TCP and one UDP endpoint, all on the same port.
pub fn find_endpoint_port(directives: &[Directive]) -> Result<u16, PortDirectiveError> {
    let endpoints = directives
        .iter()
        .filter_map(|d| parse_endpoint(d).transpose())
        .collect::<Result<Vec<_>, _>>()?;

    if endpoints.is_empty() {
        return Err(PortDirectiveError::new(
            "Your config file does not declare any endpoint.<br>\
             Add <code>endpoint_add_tcp \"0.0.0.0:30120\"</code> and \
             <code>endpoint_add_udp \"0.0.0.0:30120\"</code>.",
        ));
    }

    let Some(tcp) = endpoints.iter().find(|e| e.protocol == EndpointProtocol::Tcp) else {
        return Err(PortDirectiveError::new(
            "Your config file is missing the <code>endpoint_add_tcp</code> directive.",
        ));
    };
    if !endpoints.iter().any(|e| e.protocol == EndpointProtocol::Udp) {
        return Err(PortDirectiveError::new(
            "Your config file is missing the <code>endpoint_add_udp</code> directive.",
        ));
    }
    if let Some(other) = endpoints.iter().find(|e| e.port != tcp.port) {
        return Err(PortDirectiveError::new(format!(
            "All endpoints must use the same port.<br>\
             <code>{}</code> does not match <code>{}</code>",
            other.line, tcp.line
        )));
    }

    Ok(tcp.port)
}

/// Reads the config file and derives the endpoint port
#[derive(Debug, Clone, Copy, Default)]
pub struct PortResolver;

impl PortResolver {
    /// Resolve and read the config file, returning its directives
    pub fn load(&self, cfg_path: &Path, data_path: &Path) -> Result<Vec<Directive>, ConfigFileError> {
        let path = resolve_cfg_path(cfg_path, data_path)?;
        let text = read_cfg_file(&path)?;
        Ok(parse_directives(&text))
    }

    pub fn port(&self, directives: &[Directive]) -> Result<u16, PortDirectiveError> {
        find_endpoint_port(directives)
    }
}
