//! Builds the command line used to launch the server binary.
//!
//! The result is a pure function of the runner configuration, the runtime
//! globals and the admin API token, so it is rebuilt on every spawn.

use std::path::{Path, PathBuf};

use crate::config::{OsFamily, RunnerConfig, RuntimeGlobals};
use crate::error::SupervisorError;

/// Everything needed to create the server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
}

impl InvocationSpec {
    /// Space-joined arguments, for verbose logging
    pub fn args_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Build the launch invocation for the configured OS profile
pub fn build_invocation(
    config: &RunnerConfig,
    globals: &RuntimeGlobals,
    api_token: &str,
) -> Result<InvocationSpec, SupervisorError> {
    let (Some(cfg_path), Some(data_path)) = (&config.cfg_path, &config.server_data_path) else {
        return Err(SupervisorError::configuration(
            "Cannot start the server with missing configuration (serverDataPath || cfgPath).",
        ));
    };

    let server_args = server_arguments(config, globals, api_token, cfg_path)?;

    let (executable, args) = match globals.os {
        OsFamily::Linux => {
            let root = alpine_root(&globals.fx_server_path)?;
            let root = root.display();
            let mut args = vec![
                "--library-path".to_string(),
                format!("{root}/usr/lib/v8/:{root}/lib/:{root}/usr/lib/"),
                "--".to_string(),
                format!("{root}/opt/cfx-server/FXServer"),
                "+set".to_string(),
                "citizen_dir".to_string(),
                format!("{root}/opt/cfx-server/citizen/"),
            ];
            args.extend(server_args);
            (
                PathBuf::from(format!("{root}/opt/cfx-server/ld-musl-x86_64.so.1")),
                args,
            )
        }
        OsFamily::Windows => (globals.fx_server_path.join("FXServer.exe"), server_args),
    };

    Ok(InvocationSpec {
        executable,
        args,
        working_directory: data_path.clone(),
    })
}

/// User arguments first, then the fixed block the admin layer relies on
fn server_arguments(
    config: &RunnerConfig,
    globals: &RuntimeGlobals,
    api_token: &str,
    cfg_path: &Path,
) -> Result<Vec<String>, SupervisorError> {
    let mut args = match config.command_line.as_deref() {
        Some(line) if !line.trim().is_empty() => shell_words::split(line).map_err(|e| {
            SupervisorError::configuration(format!("Invalid extra command line arguments: {e}"))
        })?,
        _ => Vec::new(),
    };

    let api_host = format!("{}:{}", globals.interface(), globals.api_port);
    let fixed = [
        ["+sets", "txAdmin-version", globals.version.as_str()],
        ["+setr", "txAdmin-locale", globals.locale.as_str()],
        ["+set", "txAdmin-apiHost", api_host.as_str()],
        ["+set", "txAdmin-apiToken", api_token],
        [
            "+set",
            "txAdmin-checkPlayerJoin",
            if globals.join_check.enabled() { "true" } else { "false" },
        ],
        ["+set", "txAdminServerMode", "true"],
    ];
    args.extend(fixed.iter().flatten().map(|s| s.to_string()));
    args.extend([
        "+set".to_string(),
        "onesync".to_string(),
        config.network_sync.to_string(),
        "+exec".to_string(),
        cfg_path.display().to_string(),
    ]);

    Ok(args)
}

/// The Linux build ships as an Alpine root two levels above the server path
fn alpine_root(fx_server_path: &Path) -> Result<&Path, SupervisorError> {
    fx_server_path
        .ancestors()
        .nth(2)
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            SupervisorError::configuration(format!(
                "Server path {} is too shallow to contain the runtime root",
                fx_server_path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JoinCheck, NetworkSync};

    fn globals(os: OsFamily) -> RuntimeGlobals {
        RuntimeGlobals {
            os,
            fx_server_path: PathBuf::from("/home/fx/alpine/opt/cfx-server"),
            version: "5.0.0".to_string(),
            verbose: false,
            api_port: 40120,
            locale: "pt-BR".to_string(),
            force_interface: None,
            join_check: JoinCheck::default(),
            server_name: "test".to_string(),
        }
    }

    fn config() -> RunnerConfig {
        RunnerConfig::builder()
            .cfg_path("server.cfg")
            .server_data_path("/srv/data")
            .command_line("+set sv_hostname \"My Server\" +set sv_maxclients 48")
            .network_sync(NetworkSync::Legacy)
            .build()
            .unwrap()
    }

    #[test]
    fn test_linux_profile_uses_loader_shim() {
        let spec = build_invocation(&config(), &globals(OsFamily::Linux), "tok").unwrap();

        assert_eq!(
            spec.executable,
            PathBuf::from("/home/fx/alpine/opt/cfx-server/ld-musl-x86_64.so.1")
        );
        assert_eq!(spec.args[0], "--library-path");
        assert_eq!(
            spec.args[1],
            "/home/fx/alpine/usr/lib/v8/:/home/fx/alpine/lib/:/home/fx/alpine/usr/lib/"
        );
        assert_eq!(spec.args[2], "--");
        assert_eq!(spec.args[3], "/home/fx/alpine/opt/cfx-server/FXServer");
        assert_eq!(&spec.args[4..7], ["+set", "citizen_dir", "/home/fx/alpine/opt/cfx-server/citizen/"]);
        assert_eq!(spec.working_directory, PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_windows_profile_launches_binary_directly() {
        let mut globals = globals(OsFamily::Windows);
        globals.fx_server_path = PathBuf::from("C:/fx");
        let spec = build_invocation(&config(), &globals, "tok").unwrap();

        assert_eq!(spec.executable, PathBuf::from("C:/fx").join("FXServer.exe"));
        assert_eq!(spec.args[0], "+set");
        assert_eq!(spec.args[1], "sv_hostname");
        assert_eq!(spec.args[2], "My Server");
    }

    #[test]
    fn test_required_flags_follow_user_flags() {
        let mut globals = globals(OsFamily::Windows);
        globals.join_check.whitelist = true;
        globals.force_interface = Some("10.0.0.5".to_string());
        let spec = build_invocation(&config(), &globals, "secret").unwrap();

        let user_end = spec.args.iter().position(|a| a == "48").unwrap();
        let version = spec.args.iter().position(|a| a == "txAdmin-version").unwrap();
        assert!(version > user_end);

        let tail: Vec<&str> = spec.args[user_end + 1..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            [
                "+sets", "txAdmin-version", "5.0.0",
                "+setr", "txAdmin-locale", "pt-BR",
                "+set", "txAdmin-apiHost", "10.0.0.5:40120",
                "+set", "txAdmin-apiToken", "secret",
                "+set", "txAdmin-checkPlayerJoin", "true",
                "+set", "txAdminServerMode", "true",
                "+set", "onesync", "legacy",
                "+exec", "server.cfg",
            ]
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = config();
        let globals = globals(OsFamily::Linux);
        assert_eq!(
            build_invocation(&config, &globals, "tok").unwrap(),
            build_invocation(&config, &globals, "tok").unwrap()
        );
    }

    #[test]
    fn test_missing_paths_are_configuration_errors() {
        let config = RunnerConfig::default();
        let error = build_invocation(&config, &globals(OsFamily::Linux), "tok").unwrap_err();
        assert!(matches!(error, SupervisorError::Configuration(_)));
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        let mut config = config();
        config.command_line = Some("+set sv_hostname \"broken".to_string());
        let error = build_invocation(&config, &globals(OsFamily::Linux), "tok").unwrap_err();
        assert!(error.to_string().contains("extra command line"));
    }

    #[test]
    fn test_blank_command_line_adds_nothing() {
        let mut config = config();
        config.command_line = Some("   ".to_string());
        let spec = build_invocation(&config, &globals(OsFamily::Windows), "tok").unwrap();
        assert_eq!(spec.args[0], "+sets");
    }
}
