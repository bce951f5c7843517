mod unix_launcher;

use fxrunner_core::ProcessLauncherFactory;

pub use unix_launcher::{TELEMETRY_FD, UnixProcessLauncher};

#[cfg(unix)]
pub use unix_launcher::UnixProcessHandle;

pub struct UnixLauncherFactory;

impl ProcessLauncherFactory for UnixLauncherFactory {
    type Launcher = UnixProcessLauncher;

    fn create_launcher() -> UnixProcessLauncher {
        UnixProcessLauncher::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
