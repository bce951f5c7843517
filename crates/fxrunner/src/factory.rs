use fxrunner_core::{ProcessLauncher, ProcessLauncherFactory};
use std::sync::Arc;
use tracing::info;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformLauncherFactory;

impl ProcessLauncherFactory for PlatformLauncherFactory {
    #[cfg(unix)]
    type Launcher = fxrunner_unix::UnixProcessLauncher;

    #[cfg(windows)]
    type Launcher = fxrunner_windows::WindowsProcessLauncher;

    fn create_launcher() -> Self::Launcher {
        #[cfg(unix)]
        return fxrunner_unix::UnixLauncherFactory::create_launcher();

        #[cfg(windows)]
        return fxrunner_windows::WindowsLauncherFactory::create_launcher();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return fxrunner_unix::UnixLauncherFactory::platform_name();

        #[cfg(windows)]
        return fxrunner_windows::WindowsLauncherFactory::platform_name();
    }
}

/// Convenience function to create the launcher for the current platform
pub fn create_process_launcher() -> Arc<dyn ProcessLauncher> {
    info!(
        "Created process launcher with platform: {}",
        PlatformLauncherFactory::platform_name()
    );
    Arc::new(PlatformLauncherFactory::create_launcher())
}
