//! Windows-specific process launching

mod windows_launcher;

use fxrunner_core::ProcessLauncherFactory;

pub use windows_launcher::{WindowsProcessHandle, WindowsProcessLauncher};

/// Windows-specific launcher factory
pub struct WindowsLauncherFactory;

impl ProcessLauncherFactory for WindowsLauncherFactory {
    type Launcher = WindowsProcessLauncher;

    fn create_launcher() -> WindowsProcessLauncher {
        WindowsProcessLauncher::new()
    }

    fn platform_name() -> &'static str {
        "Windows"
    }
}
