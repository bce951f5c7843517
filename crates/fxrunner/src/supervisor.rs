use fxrunner_core::{
    Capabilities, ExitFuture, HistoryLedger, LaunchedProcess, LifecycleEvent, LifecycleRecord,
    PortResolver, ProcessHandle, ProcessId, ProcessLauncher, RecordId, RunnerConfig,
    RuntimeGlobals, Status, SupervisorError, build_invocation, keys,
};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{CommandBridge, CommandWriter, DEFAULT_CAPTURE_WINDOW, format_command};
use crate::factory::create_process_launcher;
use crate::router::{CaptureBuffer, IpcRouter, RouterDiagnostics};

/// Exits this soon after start usually mean the server never booted
const QUICK_EXIT: Duration = Duration::from_secs(5);
const QUICK_EXIT_NOTICE_DELAY: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Address the running server listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownKind {
    Stop,
    Restart,
}

impl ShutdownKind {
    fn grace(self) -> Duration {
        match self {
            ShutdownKind::Stop => Duration::from_millis(500),
            ShutdownKind::Restart => Duration::from_millis(750),
        }
    }

    fn kick_key(self) -> &'static str {
        match self {
            ShutdownKind::Stop => keys::STOPPING,
            ShutdownKind::Restart => keys::RESTARTING,
        }
    }

    fn announcement_key(self) -> &'static str {
        match self {
            ShutdownKind::Stop => keys::STOPPING_ANNOUNCEMENT,
            ShutdownKind::Restart => keys::RESTARTING_ANNOUNCEMENT,
        }
    }
}

/// The one live child and what is needed to talk to it
struct ActiveChild {
    handle: Box<dyn ProcessHandle>,
    commands: CommandWriter,
    record: RecordId,
}

/// Owns the server process: spawn, kill, restart and console access.
///
/// At most one child is tracked at a time. The handle is created and
/// recorded in the history without yielding, and dropped as soon as a kill
/// is issued, so a second spawn can never replace a live child.
pub struct ProcessSupervisor {
    config: RwLock<RunnerConfig>,
    globals: RuntimeGlobals,
    capabilities: Capabilities,
    launcher: Arc<dyn ProcessLauncher>,
    child: Mutex<Option<ActiveChild>>,
    ledger: Arc<Mutex<HistoryLedger>>,
    endpoint: Mutex<Option<ServerEndpoint>>,
    router: IpcRouter,
    bridge: CommandBridge,
    diagnostics: Arc<RouterDiagnostics>,
    shutdown: CancellationToken,
    restart_delay_override: Mutex<Option<Duration>>,
}

impl ProcessSupervisor {
    /// Create a supervisor using the launcher for the current platform
    pub fn new(
        config: RunnerConfig,
        globals: RuntimeGlobals,
        capabilities: Capabilities,
    ) -> Result<Self, SupervisorError> {
        Self::with_launcher(config, globals, capabilities, create_process_launcher())
    }

    pub fn with_launcher(
        config: RunnerConfig,
        globals: RuntimeGlobals,
        capabilities: Capabilities,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;

        let capture = Arc::new(CaptureBuffer::default());
        let diagnostics = Arc::new(RouterDiagnostics::default());
        let router = IpcRouter::new(
            capabilities.output.clone(),
            capabilities.console.clone(),
            capture.clone(),
            diagnostics.clone(),
            globals.verbose,
        );
        let bridge = CommandBridge::new(capabilities.console.clone(), capture, globals.verbose);

        Ok(Self {
            ledger: Arc::new(Mutex::new(HistoryLedger::new(config.history_limit))),
            config: RwLock::new(config),
            globals,
            capabilities,
            launcher,
            child: Mutex::new(None),
            endpoint: Mutex::new(None),
            router,
            bridge,
            diagnostics,
            shutdown: CancellationToken::new(),
            restart_delay_override: Mutex::new(None),
        })
    }

    pub fn config(&self) -> RunnerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration used by the next spawn
    pub fn refresh_config(&self, config: RunnerConfig) -> Result<(), SupervisorError> {
        config.validate()?;
        lock(&self.ledger).set_limit(config.history_limit);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        info!("Runner configuration refreshed");
        Ok(())
    }

    pub fn globals(&self) -> &RuntimeGlobals {
        &self.globals
    }

    /// Delay used by restarts instead of the configured one
    pub fn set_restart_delay_override(&self, delay: Option<Duration>) {
        *lock(&self.restart_delay_override) = delay;
    }

    /// Start the server.
    ///
    /// Either the child, its history record and its stream wiring are all
    /// created, or nothing changes. Must be called from within a tokio
    /// runtime.
    pub fn spawn(&self, announce: bool) -> Result<(), SupervisorError> {
        let config = self.config();
        let mut slot = lock(&self.child);

        if let Some(active) = slot.as_ref() {
            let err = SupervisorError::AlreadyRunning {
                pid: active.handle.pid(),
            };
            error!("{}", err);
            return Err(err);
        }

        let (Some(cfg_path), Some(data_path)) =
            (config.cfg_path.as_deref(), config.server_data_path.as_deref())
        else {
            let err = SupervisorError::configuration(
                "Cannot start the server with missing configuration (serverDataPath || cfgPath).",
            );
            error!("{}", err);
            return Err(err);
        };

        let token = self.capabilities.tokens.api_token();
        let invocation = build_invocation(&config, &self.globals, &token)
            .inspect_err(|e| error!("{}", e))?;
        if self.globals.verbose {
            info!("Spawn Variables: {}", invocation.args_line());
        }

        let port = Self::resolve_port(&config, cfg_path, data_path)?;
        let endpoint = ServerEndpoint {
            host: self.globals.interface().to_string(),
            port,
        };

        if announce {
            let vars = [("servername", self.globals.server_name.as_str())];
            let message = self
                .capabilities
                .translator
                .translate(keys::SPAWNING_ANNOUNCEMENT, &vars);
            self.announce(message);
        }

        let LaunchedProcess {
            handle,
            stdin,
            stdout,
            stderr,
            telemetry,
            exit,
        } = self.launcher.launch(&invocation).map_err(|e| {
            error!("Failed to start FXServer with the following error: {:#}", e);
            SupervisorError::launch(format!("{e:#}"))
        })?;

        let pid = handle.pid();
        info!(pid = %pid, ">> [{}] FXServer Started!", pid);
        self.capabilities.output.write_header();

        let record = lock(&self.ledger).start(pid.to_string(), Instant::now());
        *lock(&self.endpoint) = Some(endpoint);

        let readers = self.router.attach(pid, stdout, stderr, telemetry);
        tokio::spawn(watch_lifecycle(
            pid,
            record,
            exit,
            readers,
            self.ledger.clone(),
        ));

        *slot = Some(ActiveChild {
            handle,
            commands: CommandWriter::new(pid, stdin),
            record,
        });
        Ok(())
    }

    fn resolve_port(
        config: &RunnerConfig,
        cfg_path: &Path,
        data_path: &Path,
    ) -> Result<u16, SupervisorError> {
        let resolver = PortResolver;
        let directives = resolver.load(cfg_path, data_path).map_err(|e| {
            error!("server.cfg error: {}", e);
            for line in e.remediation().into_iter().flatten() {
                error!("{}", line);
            }
            SupervisorError::from(e)
        })?;

        match resolver.port(&directives) {
            Ok(port) => Ok(port),
            Err(e) => {
                error!("server.cfg error: \n{}", e);
                match config.forced_port {
                    Some(port) => {
                        warn!("Ignoring endpoint error, using forced port {}", port);
                        Ok(port)
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Stop the server, kicking players with `reason` first when given.
    ///
    /// Returns `false` when the termination signal could not be delivered;
    /// the child is forgotten either way.
    pub async fn kill(&self, reason: Option<&str>) -> bool {
        self.stop_child(reason, ShutdownKind::Stop).await
    }

    /// Kill, wait for the restart delay, then spawn again without announcing
    pub async fn restart(&self, reason: Option<&str>) -> Result<(), SupervisorError> {
        if !self.stop_child(reason, ShutdownKind::Restart).await {
            warn!("Previous instance may still be running, restarting anyway");
        }

        let delay_override = *lock(&self.restart_delay_override);
        let delay = match delay_override {
            Some(delay) => {
                warn!("Restarting the fxserver with delay override {:?}", delay);
                delay
            }
            None => self.config().restart_delay(),
        };
        if !self.pause(delay).await {
            warn!("Restart cancelled by shutdown");
            return Err(SupervisorError::Cancelled);
        }

        self.spawn(false).map_err(|e| {
            error!("Couldn't restart the server.");
            SupervisorError::Restart(Box::new(e))
        })
    }

    async fn stop_child(&self, reason: Option<&str>, kind: ShutdownKind) -> bool {
        if let Some(reason) = reason {
            let vars = [
                ("servername", self.globals.server_name.as_str()),
                ("reason", reason),
            ];
            let translator = &self.capabilities.translator;
            let kick_message = translator.translate(kind.kick_key(), &vars);
            self.announce(translator.translate(kind.announcement_key(), &vars));
            if !self.send(&format_command("quit", &[&kick_message])).await {
                warn!("Quit command not delivered, terminating anyway");
            }
            if !self.pause(kind.grace()).await {
                debug!("Grace delay interrupted by shutdown");
            }
        }

        let Some(active) = lock(&self.child).take() else {
            debug!("No server running, nothing to kill");
            return true;
        };

        let pid = active.handle.pid();
        lock(&self.ledger).mark(active.record, LifecycleEvent::KillRequested, Instant::now());
        let result = active.handle.terminate();
        if result.is_terminated() {
            info!(pid = %pid, "Server process terminated ({:?})", result);
            true
        } else {
            error!(
                pid = %pid,
                "Couldn't kill the server. Perhaps What Is Dead May Never Die. ({:?})",
                result
            );
            false
        }
    }

    /// Cancel pending delays and stop the server
    pub async fn shutdown(&self) -> bool {
        info!("Shutting down supervisor");
        self.shutdown.cancel();
        self.kill(None).await
    }

    /// Spawn once after the configured delay, if autostart is enabled.
    ///
    /// The task resolves with the spawn result; skipped or cancelled
    /// autostarts resolve with `Ok(())`.
    pub fn schedule_autostart(
        self: &Arc<Self>,
    ) -> Option<JoinHandle<Result<(), SupervisorError>>> {
        let config = self.config();
        if !config.autostart || !config.has_server_paths() {
            return None;
        }

        let supervisor = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let delay = config.autostart_delay();
        Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(supervisor) = supervisor.upgrade() else {
                return Ok(());
            };
            if !supervisor.capabilities.admins.has_admins() {
                warn!("The server will not auto start because there are no admins configured.");
                return Ok(());
            }
            supervisor.spawn(true)
        }))
    }

    pub async fn send(&self, command: &str) -> bool {
        let writer = self.command_writer();
        self.bridge.send(writer.as_ref(), command).await
    }

    /// Send a command and collect the stdout it produces within `window`
    /// (1.5 s when `None`)
    pub async fn send_and_capture(&self, command: &str, window: Option<Duration>) -> Option<String> {
        let writer = self.command_writer();
        self.bridge
            .send_and_capture(
                writer.as_ref(),
                command,
                window.unwrap_or(DEFAULT_CAPTURE_WINDOW),
            )
            .await
    }

    fn command_writer(&self) -> Option<CommandWriter> {
        lock(&self.child).as_ref().map(|c| c.commands.clone())
    }

    pub fn status(&self) -> Status {
        Status::of(&lock(&self.ledger))
    }

    /// Seconds since the latest spawn, 0 if there was none
    pub fn uptime_seconds(&self) -> u64 {
        lock(&self.ledger)
            .latest()
            .and_then(|r| r.started_at)
            .map_or(0, |started| started.elapsed().as_secs())
    }

    pub fn pid(&self) -> Option<ProcessId> {
        lock(&self.child).as_ref().map(|c| c.handle.pid())
    }

    /// Endpoint of the latest spawn
    pub fn endpoint(&self) -> Option<ServerEndpoint> {
        lock(&self.endpoint).clone()
    }

    pub fn history(&self) -> Vec<LifecycleRecord> {
        lock(&self.ledger).iter().cloned().collect()
    }

    /// Last decode error seen on the telemetry channel
    pub fn last_trace_error(&self) -> Option<String> {
        self.diagnostics.last_trace_error()
    }

    /// Sleep unless shutdown is requested first. Returns `false` if cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn announce(&self, message: String) {
        let notifier = self.capabilities.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.announce(&message).await {
                warn!("Failed to send announcement: {:#}", e);
            }
        });
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let active = self
            .child
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active.filter(|a| a.handle.is_running()) {
            let pid = active.handle.pid();
            warn!(pid = %pid, "Supervisor dropped with a live server - attempting emergency cleanup");
            let result = active.handle.terminate();
            if !result.is_terminated() {
                warn!(pid = %pid, "Emergency cleanup failed: {:?}", result);
            }
        }
    }
}

/// Records exit and close of one child. Close is the point where every
/// output stream has been drained.
async fn watch_lifecycle(
    pid: ProcessId,
    record: RecordId,
    exit: ExitFuture,
    readers: Vec<JoinHandle<()>>,
    ledger: Arc<Mutex<HistoryLedger>>,
) {
    let code = match exit.await {
        Ok(code) => {
            warn!(pid = %pid, ">> [{}] FXServer Exited.", pid);
            let now = Instant::now();
            let quick = {
                let mut ledger = lock(&ledger);
                ledger.mark(record, LifecycleEvent::Exited, now);
                ledger
                    .get(record)
                    .and_then(|r| r.started_at)
                    .is_some_and(|started| now.saturating_duration_since(started) <= QUICK_EXIT)
            };
            if quick {
                tokio::spawn(async {
                    tokio::time::sleep(QUICK_EXIT_NOTICE_DELAY).await;
                    warn!("FXServer didn't start. This is not an issue with fxrunner.");
                });
            }
            code
        }
        Err(e) => {
            warn!(pid = %pid, ">> [{}] FXServer Errored: {}", pid, e);
            None
        }
    };

    for reader in readers {
        if let Err(e) = reader.await {
            debug!(pid = %pid, "Stream task ended abnormally: {}", e);
        }
    }

    lock(&ledger).mark(record, LifecycleEvent::Closed, Instant::now());
    let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
    warn!(pid = %pid, ">> [{}] FXServer Closed. (code {})", pid, code);
}
