use crate::config::SidecarConfig;
use crate::error::SupervisorError;
use crate::platform;
use crate::records::{decode_records, startup_level_override, LogChunk, LogLevel};
use crate::router::EngineRouter;
use crate::state::{RouteState, SharedRouteState};
use crate::synthesis::{synthesize, EffectiveConfig, SynthesisInput};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Exit code the engine uses when it rejects its configuration (EX_CONFIG)
pub const CONFIG_REJECTED_EXIT_CODE: i32 = 78;

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 64;

/// Lifecycle state of the supervised engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// `start()` has not been called yet
    Idle,
    /// A child is running but has not reported readiness
    Starting,
    /// The engine is serving and its URI is published
    Ready,
    /// The child exited unexpectedly; a respawn follows immediately
    Crashed,
    /// `stop()` is waiting for the child to exit
    Stopping,
    /// The engine was stopped (or a start timed out)
    Stopped,
    /// The engine rejected its configuration or could not be respawned
    Failed,
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitCause {
    fn from_status(status: &ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitCause::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitCause::Signal(signal);
            }
        }
        ExitCause::Unknown
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Code(code) => write!(f, "exit code {}", code),
            ExitCause::Signal(signal) => write!(f, "signal {}", signal),
            ExitCause::Unknown => f.write_str("unknown cause"),
        }
    }
}

/// Lifecycle notifications, delivered through [`EngineSupervisor::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned { generation: u64, pid: Option<u32> },
    Ready { generation: u64, port: u16 },
    Crashed { generation: u64, cause: ExitCause },
    ConfigurationRejected { generation: u64, code: i32 },
    RestartFailed { generation: u64, error: String },
    Stopped,
}

/// Everything needed to spawn one generation of the engine
#[derive(Debug)]
struct LaunchPlan {
    binary: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    /// First config line written to stdin
    initial_line: String,
    /// User's config, re-sent after readiness when the level was lowered
    reissue_line: Option<String>,
    /// Level the user asked for, when it was lowered for startup
    requested_level: Option<LogLevel>,
}

enum KillMode {
    /// SIGTERM, then SIGKILL after the grace period
    Terminate(Duration),
    /// SIGKILL right away
    Kill,
}

struct ChildSlot {
    generation: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<KillMode>>,
    exited: watch::Receiver<bool>,
}

struct Lifecycle {
    state: SupervisorState,
    running: bool,
    generation: u64,
    child: Option<ChildSlot>,
    plan: Option<Arc<LaunchPlan>>,
    pending_start: Option<oneshot::Sender<Result<u16, SupervisorError>>>,
}

struct Inner {
    sidecar: SidecarConfig,
    engine_config: Value,
    backend_uri: String,
    route: SharedRouteState,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Launches, configures, watches and restarts the engine process.
///
/// The supervisor is the only writer of the shared [`RouteState`]: it
/// publishes `http://<address>` when the engine logs its startup record and
/// clears it as soon as the engine exits. Routers built with
/// [`router`](EngineSupervisor::router) read that state on every request.
///
/// Each spawned child is a *generation*. Four tasks serve a generation (stdin
/// writer, stdout decoder, stderr copier and the exit watcher owning the
/// [`Child`]) and all of them end when the child exits. Exits of superseded
/// generations are ignored.
///
/// ```ignore
/// let supervisor = EngineSupervisor::new(SidecarConfig::for_backend(4000), engine)?;
/// let router = supervisor.router();
/// let port = supervisor.start().await?;
/// ```
#[derive(Clone)]
pub struct EngineSupervisor {
    inner: Arc<Inner>,
}

impl EngineSupervisor {
    /// Create an idle supervisor. Nothing is spawned until [`start`](Self::start).
    pub fn new(sidecar: SidecarConfig, engine_config: Value) -> Result<Self, SupervisorError> {
        sidecar.validate()?;
        let backend_uri = sidecar.backend_uri()?;
        let route = Arc::new(RouteState::new(
            sidecar.endpoint.clone(),
            sidecar.dump_traffic,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                sidecar,
                engine_config,
                backend_uri,
                route,
                lifecycle: Mutex::new(Lifecycle {
                    state: SupervisorState::Idle,
                    running: false,
                    generation: 0,
                    child: None,
                    plan: None,
                    pending_start: None,
                }),
                events,
            }),
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lifecycle.lock().state
    }

    /// Whether the supervisor still intends to keep the engine alive
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().running
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.inner
            .lifecycle
            .lock()
            .child
            .as_ref()
            .and_then(|slot| slot.pid)
    }

    /// Number of children spawned so far
    pub fn generation(&self) -> u64 {
        self.inner.lifecycle.lock().generation
    }

    pub fn route_state(&self) -> SharedRouteState {
        Arc::clone(&self.inner.route)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Build a router reading this supervisor's route state
    pub fn router(&self) -> EngineRouter {
        EngineRouter::new(self.route_state())
    }

    /// Launch the engine and wait until it reports readiness.
    ///
    /// Resolves with the port the engine bound. Valid once per supervisor.
    pub async fn start(&self) -> Result<u16, SupervisorError> {
        if self.state() != SupervisorState::Idle {
            return Err(SupervisorError::AlreadyStarted);
        }

        let plan = self.inner.launch_plan()?;

        let rx = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state != SupervisorState::Idle {
                return Err(SupervisorError::AlreadyStarted);
            }

            let (tx, rx) = oneshot::channel();
            lifecycle.running = true;
            lifecycle.pending_start = Some(tx);

            if let Err(e) = self.inner.spawn_generation(&mut lifecycle, &plan) {
                lifecycle.running = false;
                lifecycle.pending_start = None;
                error!(binary = %plan.binary.display(), error = %e, "Failed to spawn engine");
                return Err(e);
            }

            lifecycle.state = SupervisorState::Starting;
            lifecycle.plan = Some(plan);
            rx
        };

        let outcome = match self.inner.sidecar.startup_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => return self.abort_start(timeout).await,
            },
            None => rx.await,
        };

        // A dropped sender means stop() discarded the pending start
        outcome.unwrap_or(Err(SupervisorError::Stopped))
    }

    async fn abort_start(&self, timeout: Duration) -> Result<u16, SupervisorError> {
        let exited = {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.running = false;
            lifecycle.pending_start = None;
            lifecycle.state = SupervisorState::Stopped;
            lifecycle.child.as_mut().map(|slot| {
                if let Some(kill) = slot.kill_tx.take() {
                    let _ = kill.send(KillMode::Kill);
                }
                slot.exited.clone()
            })
        };
        self.inner.route.clear();

        let timeout_ms = timeout.as_millis() as u64;
        error!(timeout_ms, "Engine did not report readiness in time, killing it");

        if let Some(mut exited) = exited {
            let _ = exited.wait_for(|done| *done).await;
        }
        Err(SupervisorError::StartupTimeout(timeout_ms))
    }

    /// Stop the engine and wait for it to exit.
    ///
    /// Sends SIGTERM, escalating to SIGKILL after the configured grace period.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let grace_period = self.inner.sidecar.shutdown_grace_period();

        let (pid, mut exited) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let Some(slot) = lifecycle.child.as_mut() else {
                return Err(SupervisorError::NotRunning);
            };
            if let Some(kill) = slot.kill_tx.take() {
                let _ = kill.send(KillMode::Terminate(grace_period));
            }
            let handle = (slot.pid, slot.exited.clone());

            lifecycle.running = false;
            lifecycle.state = SupervisorState::Stopping;
            if let Some(pending) = lifecycle.pending_start.take() {
                let _ = pending.send(Err(SupervisorError::Stopped));
            }
            handle
        };
        self.inner.route.clear();

        info!(?pid, "Stopping engine");
        let _ = exited.wait_for(|done| *done).await;

        self.inner.lifecycle.lock().state = SupervisorState::Stopped;
        info!(?pid, "Engine stopped");
        let _ = self.inner.events.send(SupervisorEvent::Stopped);
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Routers can outlive the supervisor
        self.route.clear();
    }
}

impl Inner {
    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn launch_plan(&self) -> Result<Arc<LaunchPlan>, SupervisorError> {
        let binary = platform::resolve_binary(&self.sidecar)?;

        let effective = synthesize(
            &self.engine_config,
            &SynthesisInput {
                mount_path: self.route.mount_path(),
                backend_uri: &self.backend_uri,
                loop_secret: self.route.loop_secret(),
                frontend_params: &self.sidecar.frontend,
                origin_params: &self.sidecar.origin,
            },
        )?;
        for warning in &effective.warnings {
            warn!(%warning, "Engine configuration adjusted");
        }

        let mut document = effective.document;
        let user_line = EffectiveConfig::to_line(&document);
        let requested_level = startup_level_override(&mut document);

        let (initial_line, reissue_line) = match requested_level {
            Some(level) => {
                debug!(%level, "Lowering engine log level until startup");
                (EffectiveConfig::to_line(&document), Some(user_line))
            }
            None => (user_line, None),
        };

        let mut args = vec!["-config=stdin".to_string()];
        if self.sidecar.engine_restart {
            args.push("-restart=true".to_string());
        }
        args.extend(self.sidecar.extra_args.iter().cloned());

        Ok(Arc::new(LaunchPlan {
            binary,
            args,
            env: self.sidecar.env.clone(),
            initial_line,
            reissue_line,
            requested_level,
        }))
    }

    /// Spawn the next generation and its watcher tasks.
    ///
    /// Runs under the lifecycle lock so exits and stops see a consistent slot.
    /// The tasks only hold a [`Weak`] handle: once the last supervisor handle
    /// is dropped the slot's kill channel closes and the child is killed.
    fn spawn_generation(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        plan: &Arc<LaunchPlan>,
    ) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&plan.binary);
        cmd.args(&plan.args);
        cmd.envs(&plan.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let generation = lifecycle.generation + 1;
        lifecycle.generation = generation;
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (reissue_tx, reissue_rx) = oneshot::channel();
        let filter = Arc::new(AtomicBool::new(plan.requested_level.is_some()));

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed_config(
                stdin,
                Arc::clone(plan),
                reissue_rx,
                Arc::clone(&filter),
                self.sidecar.config_reissue_delay(),
                exited_rx.clone(),
            ));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Inner::watch_stdout(
                Arc::downgrade(self),
                generation,
                stdout,
                reissue_tx,
                filter,
                plan.requested_level,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(copy_stderr(stderr));
        }
        tokio::spawn(Inner::watch_exit(
            Arc::downgrade(self),
            generation,
            child,
            kill_rx,
            exited_tx,
        ));

        lifecycle.child = Some(ChildSlot {
            generation,
            pid,
            kill_tx: Some(kill_tx),
            exited: exited_rx,
        });

        info!(generation, ?pid, binary = %plan.binary.display(), "Engine process spawned");
        self.emit(SupervisorEvent::Spawned { generation, pid });
        Ok(())
    }

    async fn watch_stdout(
        inner: Weak<Self>,
        generation: u64,
        stdout: ChildStdout,
        reissue: oneshot::Sender<()>,
        filter: Arc<AtomicBool>,
        requested_level: Option<LogLevel>,
    ) {
        let mut reissue = Some(reissue);
        let mut diagnostics = tokio::io::stderr();
        let chunks = decode_records(stdout);
        futures::pin_mut!(chunks);

        while let Some(chunk) = chunks.next().await {
            let record = match chunk {
                LogChunk::Raw(bytes) => {
                    let _ = diagnostics.write_all(&bytes).await;
                    continue;
                }
                LogChunk::Record(record) => record,
            };

            let filtered = filter.load(Ordering::Relaxed)
                && requested_level.is_some_and(|min| record.level() < min);
            if !filtered {
                record.emit();
            }

            if let Some(address) = record.startup_address() {
                if let Some(inner) = inner.upgrade() {
                    inner.mark_ready(generation, address);
                }
                if let Some(signal) = reissue.take() {
                    let _ = signal.send(());
                }
            }
        }

        debug!(generation, "Engine stdout closed");
    }

    fn mark_ready(&self, generation: u64, address: &str) {
        let Some(port) = address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        else {
            warn!(generation, address, "Engine reported an address without a port");
            return;
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            let current = lifecycle.child.as_ref().map(|slot| slot.generation) == Some(generation);
            if !current || !lifecycle.running || lifecycle.state != SupervisorState::Starting {
                return;
            }

            self.route.publish(format!("http://{}", address));
            lifecycle.state = SupervisorState::Ready;
            if let Some(pending) = lifecycle.pending_start.take() {
                let _ = pending.send(Ok(port));
            }
        }

        info!(generation, address, "Engine is ready");
        self.emit(SupervisorEvent::Ready { generation, port });
    }

    async fn watch_exit(
        inner: Weak<Self>,
        generation: u64,
        mut child: Child,
        mut kill_rx: oneshot::Receiver<KillMode>,
        exited: watch::Sender<bool>,
    ) {
        enum Wake {
            Exited(std::io::Result<ExitStatus>),
            Kill(Option<KillMode>),
        }

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            mode = &mut kill_rx => Wake::Kill(mode.ok()),
        };

        let status = match wake {
            Wake::Exited(status) => status,
            Wake::Kill(Some(mode)) => terminate(&mut child, mode).await,
            // The slot went away with the last supervisor handle
            Wake::Kill(None) => terminate(&mut child, KillMode::Kill).await,
        };

        match inner.upgrade() {
            Some(inner) => inner.handle_exit(generation, status),
            None => debug!(generation, "Engine process reaped after supervisor was dropped"),
        }
        let _ = exited.send(true);
    }

    fn handle_exit(self: &Arc<Self>, generation: u64, status: std::io::Result<ExitStatus>) {
        let cause = match status {
            Ok(ref status) => ExitCause::from_status(status),
            Err(ref e) => {
                warn!(generation, error = %e, "Failed to wait for engine process");
                ExitCause::Unknown
            }
        };

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.child.as_ref().map(|slot| slot.generation) != Some(generation) {
            debug!(generation, %cause, "Ignoring exit of superseded engine process");
            return;
        }
        lifecycle.child = None;
        self.route.clear();

        if !lifecycle.running {
            lifecycle.state = SupervisorState::Stopped;
            info!(generation, %cause, "Engine process exited");
            return;
        }

        if cause == ExitCause::Code(CONFIG_REJECTED_EXIT_CODE) {
            lifecycle.running = false;
            lifecycle.state = SupervisorState::Failed;
            if let Some(pending) = lifecycle.pending_start.take() {
                let _ = pending.send(Err(SupervisorError::ConfigurationRejected(
                    CONFIG_REJECTED_EXIT_CODE,
                )));
            }
            drop(lifecycle);

            error!(generation, "Engine rejected its configuration, not restarting");
            self.emit(SupervisorEvent::ConfigurationRejected {
                generation,
                code: CONFIG_REJECTED_EXIT_CODE,
            });
            return;
        }

        lifecycle.state = SupervisorState::Crashed;
        warn!(generation, %cause, "Engine process exited unexpectedly, restarting");
        self.emit(SupervisorEvent::Crashed { generation, cause });

        let Some(plan) = lifecycle.plan.clone() else {
            return;
        };
        match self.spawn_generation(&mut lifecycle, &plan) {
            Ok(()) => lifecycle.state = SupervisorState::Starting,
            Err(e) => {
                lifecycle.running = false;
                lifecycle.state = SupervisorState::Failed;
                error!(generation, error = %e, "Failed to restart engine");
                self.emit(SupervisorEvent::RestartFailed {
                    generation,
                    error: e.to_string(),
                });
                if let Some(pending) = lifecycle.pending_start.take() {
                    let _ = pending.send(Err(e));
                }
            }
        }
    }
}

/// Write the configuration to the engine and keep stdin open for its lifetime
async fn feed_config(
    mut stdin: ChildStdin,
    plan: Arc<LaunchPlan>,
    reissue: oneshot::Receiver<()>,
    filter: Arc<AtomicBool>,
    reissue_delay: Duration,
    mut exited: watch::Receiver<bool>,
) {
    if let Err(e) = write_line(&mut stdin, &plan.initial_line).await {
        warn!(error = %e, "Failed to write configuration to engine");
        return;
    }

    if let Some(ref line) = plan.reissue_line {
        let signalled = tokio::select! {
            signal = reissue => signal.is_ok(),
            _ = exited.wait_for(|done| *done) => false,
        };

        if signalled {
            match write_line(&mut stdin, line).await {
                Ok(()) => debug!("Re-sent configuration with the requested log level"),
                Err(e) => warn!(error = %e, "Failed to re-send configuration to engine"),
            }
            tokio::time::sleep(reissue_delay).await;
            filter.store(false, Ordering::Relaxed);
        }
    }

    let _ = exited.wait_for(|done| *done).await;
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn copy_stderr(mut stderr: ChildStderr) {
    let mut host = tokio::io::stderr();
    if let Err(e) = tokio::io::copy(&mut stderr, &mut host).await {
        debug!(error = %e, "Engine stderr copy ended");
    }
}

async fn terminate(child: &mut Child, mode: KillMode) -> std::io::Result<ExitStatus> {
    match mode {
        KillMode::Kill => {
            let _ = child.start_kill();
        }
        KillMode::Terminate(grace_period) => {
            send_sigterm(child);
            match tokio::time::timeout(grace_period, child.wait()).await {
                Ok(status) => return status,
                Err(_) => {
                    warn!(
                        grace_period_secs = grace_period.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = child.start_kill();
                }
            }
        }
    }
    child.wait().await
}

fn send_sigterm(child: &mut Child) {
    // SIGTERM on Unix, a hard kill elsewhere
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}
