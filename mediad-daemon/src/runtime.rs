//! Service lifecycle: startup sequence, cooperative loop and shutdown.
//!
//! The calling thread runs a current-thread tokio runtime that consumes
//! [`LoopTask`]s. The request server lives on its own `request-server` thread
//! and only talks to the loop through a [`LoopHandle`].

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use mediad_core::{config, descriptor};

use crate::context::{DaemonContext, VERSION};
use crate::diagnostics::{self, signals};
use crate::error::{io_err, DaemonError};
use crate::readiness::{ParentNotifier, ReadinessProtocol, SigCont};
use crate::server::{BoundServer, JsonLineServer, RequestServer, ShutdownHandle};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Lifecycle state and loop tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Quitting,
    Stopped,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Starting, Running) | (Starting, Quitting) | (Running, Quitting) | (Quitting, Stopped)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitReason {
    Signal(&'static str),
    ServerFailed(String),
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopTask {
    Quit(QuitReason),
    ServerBound(SocketAddr),
    ServerFailed(String),
    BrokenPipe,
}

/// Posts tasks onto the loop from any thread. Inert once the loop has stopped.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopTask>,
}

impl LoopHandle {
    /// Returns `false` when the loop no longer accepts tasks.
    pub fn post(&self, task: LoopTask) -> bool {
        self.tx.send(task).is_ok()
    }

    pub fn request_quit(&self) -> bool {
        self.post(LoopTask::Quit(QuitReason::Requested))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    ServerFailed,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::ServerFailed => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    /// Install the fault handlers and crash reporter.
    pub install_diagnostics: bool,
    /// Watch SIGINT, SIGTERM and SIGPIPE.
    pub trap_signals: bool,
    pub join_timeout: Duration,
    pub heartbeat: Duration,
}

impl DaemonOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            install_diagnostics: true,
            trap_signals: true,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon<S = JsonLineServer, N = SigCont> {
    options: DaemonOptions,
    server: S,
    readiness: ReadinessProtocol<N>,
    loop_tx: mpsc::UnboundedSender<LoopTask>,
    loop_rx: mpsc::UnboundedReceiver<LoopTask>,
    state_tx: watch::Sender<LifecycleState>,
}

impl Daemon<JsonLineServer, SigCont> {
    pub fn new(options: DaemonOptions) -> Self {
        Self::with_parts(options, JsonLineServer, ReadinessProtocol::for_parent_process())
    }
}

impl<S: RequestServer, N: ParentNotifier> Daemon<S, N> {
    pub fn with_parts(options: DaemonOptions, server: S, readiness: ReadinessProtocol<N>) -> Self {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        Self {
            options,
            server,
            readiness,
            loop_tx,
            loop_rx,
            state_tx,
        }
    }

    pub fn loop_handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.loop_tx.clone(),
        }
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Run the whole lifecycle on the calling thread and return once stopped.
    ///
    /// Errors are startup failures (diagnostics, config I/O, runtime). A
    /// request server that fails later is reported as
    /// [`ExitStatus::ServerFailed`].
    pub fn start(self) -> Result<ExitStatus, DaemonError> {
        let Daemon {
            options,
            server,
            readiness,
            loop_tx,
            loop_rx,
            state_tx,
        } = self;

        if options.install_diagnostics {
            diagnostics::install()?;
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| io_err("loop runtime", e))?;
        let handle = LoopHandle { tx: loop_tx };
        // Before config and bind, so an interrupt during startup is a clean quit.
        if options.trap_signals {
            let _entered = runtime.enter();
            signals::spawn_watchers(&handle)?;
        }

        let config = config::load(&options.config_path)?;
        let descriptor = if config.codecs_enabled() {
            descriptor::load(&config.descriptor_path())
        } else {
            tracing::warn!("configuration unreadable, codecs disabled");
            None
        };
        let context = Arc::new(DaemonContext::new(config, descriptor));
        let addr = context.config.server().bind_addr();
        tracing::info!(version = VERSION, %addr, parent = readiness.parent(), "mediad starting");

        let shutdown = ShutdownHandle::new();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        let worker = spawn_worker(
            server,
            context.clone(),
            addr,
            shutdown.clone(),
            handle.clone(),
            done_tx,
        )?;
        drop(handle);

        let mut event_loop = EventLoop::new(loop_rx, &state_tx, &readiness, &context, options.heartbeat);
        runtime.block_on(event_loop.run());
        let exit = event_loop.exit;
        drop(event_loop);

        // Queue is closed; stop the server without blocking the loop thread.
        shutdown.trigger();
        match done_rx.recv_timeout(options.join_timeout) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = options.join_timeout.as_millis() as u64,
                    "request server did not stop in time, abandoning it"
                );
            }
            _ => {
                if worker.join().is_err() {
                    tracing::warn!("request server thread panicked during shutdown");
                }
            }
        }
        drop(runtime);

        transition(&state_tx, LifecycleState::Stopped);
        tracing::info!(code = exit.code(), "mediad stopped");
        Ok(exit)
    }
}

// ---------------------------------------------------------------------------
// Cooperative loop
// ---------------------------------------------------------------------------

struct EventLoop<'a, N> {
    rx: mpsc::UnboundedReceiver<LoopTask>,
    state: &'a watch::Sender<LifecycleState>,
    readiness: &'a ReadinessProtocol<N>,
    context: &'a Arc<DaemonContext>,
    heartbeat: Duration,
    beats: u64,
    exit: ExitStatus,
}

impl<'a, N: ParentNotifier> EventLoop<'a, N> {
    fn new(
        rx: mpsc::UnboundedReceiver<LoopTask>,
        state: &'a watch::Sender<LifecycleState>,
        readiness: &'a ReadinessProtocol<N>,
        context: &'a Arc<DaemonContext>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            rx,
            state,
            readiness,
            context,
            heartbeat,
            beats: 0,
            exit: ExitStatus::Clean,
        }
    }

    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                task = self.rx.recv() => match task {
                    Some(task) => {
                        if self.handle(task).is_break() {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!("loop queue closed, quitting");
                        transition(self.state, LifecycleState::Quitting);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.beats += 1;
                    let state = *self.state.borrow();
                    tracing::debug!(
                        ?state,
                        beats = self.beats,
                        uptime_secs = self.context.uptime().as_secs(),
                        "heartbeat"
                    );
                }
            }
        }
        self.rx.close();
    }

    fn handle(&mut self, task: LoopTask) -> ControlFlow<()> {
        match task {
            LoopTask::ServerBound(addr) => {
                if transition(self.state, LifecycleState::Running) {
                    tracing::info!(%addr, "request server listening");
                    self.readiness.signal_ready();
                }
                ControlFlow::Continue(())
            }
            LoopTask::ServerFailed(reason) => {
                tracing::error!(%reason, "request server failed");
                self.exit = ExitStatus::ServerFailed;
                self.quit(QuitReason::ServerFailed(reason))
            }
            LoopTask::Quit(reason) => self.quit(reason),
            LoopTask::BrokenPipe => {
                tracing::debug!("SIGPIPE received, ignoring");
                ControlFlow::Continue(())
            }
        }
    }

    fn quit(&mut self, reason: QuitReason) -> ControlFlow<()> {
        tracing::info!(?reason, "quitting");
        transition(self.state, LifecycleState::Quitting);
        ControlFlow::Break(())
    }
}

fn transition(state: &watch::Sender<LifecycleState>, next: LifecycleState) -> bool {
    let current = *state.borrow();
    if !current.can_transition_to(next) {
        tracing::warn!(from = ?current, to = ?next, "rejected lifecycle transition");
        return false;
    }
    state.send_replace(next);
    tracing::debug!(from = ?current, to = ?next, "lifecycle transition");
    true
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

/// Reports a worker that ends without saying why. Dropping `_done` tells the
/// loop thread the worker is gone.
struct WorkerGuard {
    handle: LoopHandle,
    reported: bool,
    _done: std_mpsc::Sender<()>,
}

impl WorkerGuard {
    fn fail(mut self, reason: String) {
        self.reported = true;
        self.handle.post(LoopTask::ServerFailed(reason));
    }

    fn finish(mut self) {
        self.reported = true;
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.reported {
            let reason = if thread::panicking() {
                "request server thread panicked"
            } else {
                "request server thread died"
            };
            self.handle.post(LoopTask::ServerFailed(reason.to_string()));
        }
    }
}

fn spawn_worker<S: RequestServer>(
    server: S,
    context: Arc<DaemonContext>,
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    handle: LoopHandle,
    done: std_mpsc::Sender<()>,
) -> Result<thread::JoinHandle<()>, DaemonError> {
    thread::Builder::new()
        .name("request-server".to_string())
        .spawn(move || {
            let guard = WorkerGuard {
                handle: handle.clone(),
                reported: false,
                _done: done,
            };

            let bound = match server.bind(&context, addr) {
                Ok(bound) => bound,
                Err(err) => return guard.fail(err.to_string()),
            };
            handle.post(LoopTask::ServerBound(bound.local_addr()));

            match bound.serve(shutdown.clone()) {
                Ok(()) if shutdown.is_triggered() => guard.finish(),
                Ok(()) => guard.fail("request server returned without a shutdown request".into()),
                Err(err) => guard.fail(err.to_string()),
            }
        })
        .map_err(|e| io_err("request-server thread", e))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Run the daemon with default collaborators, blocking until it stops.
pub fn start_blocking(config_path: &Path) -> Result<ExitStatus, DaemonError> {
    init_tracing();
    Daemon::new(DaemonOptions::new(config_path)).start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeServer {
        fail_bind: bool,
        ignore_shutdown: bool,
    }

    struct FakeBound {
        ignore_shutdown: bool,
    }

    impl RequestServer for FakeServer {
        type Bound = FakeBound;

        fn bind(&self, _: &Arc<DaemonContext>, addr: SocketAddr) -> Result<FakeBound, DaemonError> {
            if self.fail_bind {
                return Err(DaemonError::Bind {
                    addr,
                    source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
                });
            }
            Ok(FakeBound {
                ignore_shutdown: self.ignore_shutdown,
            })
        }
    }

    impl BoundServer for FakeBound {
        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:9090".parse().expect("addr")
        }

        fn serve(self, shutdown: ShutdownHandle) -> Result<(), DaemonError> {
            if self.ignore_shutdown {
                thread::sleep(Duration::from_secs(30));
                return Ok(());
            }
            while !shutdown.is_triggered() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl ParentNotifier for Counting {
        fn notify_parent(&self, _parent: u32) -> std::io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options(dir: &TempDir) -> DaemonOptions {
        DaemonOptions {
            install_diagnostics: false,
            trap_signals: false,
            join_timeout: Duration::from_millis(200),
            ..DaemonOptions::new(dir.path().join("mediad.conf"))
        }
    }

    fn wait_for(state: &watch::Receiver<LifecycleState>, want: LifecycleState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while *state.borrow() != want {
            assert!(Instant::now() < deadline, "state never became {want:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ticks_without_changing_state() {
        let dir = TempDir::new().expect("tempdir");
        let context = Arc::new(DaemonContext::new(
            mediad_core::Config::defaults(dir.path().join("mediad.conf")),
            None,
        ));
        let readiness = ReadinessProtocol::new(1, Counting::default());
        let (state_tx, state_rx) = watch::channel(LifecycleState::Running);
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut event_loop =
            EventLoop::new(rx, &state_tx, &readiness, &context, Duration::from_secs(60));

        {
            let run = event_loop.run();
            tokio::pin!(run);
            tokio::select! {
                _ = &mut run => panic!("loop stopped without a task"),
                _ = tokio::time::sleep(Duration::from_secs(181)) => {}
            }
        }

        assert_eq!(event_loop.beats, 3);
        assert_eq!(*state_rx.borrow(), LifecycleState::Running);
    }

    #[test]
    fn transitions_only_move_forward() {
        use LifecycleState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Quitting));
        assert!(Quitting.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Stopped));
    }

    #[test]
    fn quit_stops_cleanly_after_one_readiness_signal() {
        let dir = TempDir::new().expect("tempdir");
        let counter = Counting::default();
        let daemon = Daemon::with_parts(
            options(&dir),
            FakeServer::default(),
            ReadinessProtocol::new(1, counter.clone()),
        );
        let handle = daemon.loop_handle();
        let state = daemon.state();
        let runner = thread::spawn(move || daemon.start());

        wait_for(&state, LifecycleState::Running);
        assert!(handle.request_quit());
        let exit = runner.join().expect("join").expect("start");

        assert_eq!(exit, ExitStatus::Clean);
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!handle.request_quit(), "handle is inert after stop");
        assert!(dir.path().join("mediad.conf").exists());
    }

    #[test]
    fn broken_pipe_keeps_running() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = Daemon::with_parts(
            options(&dir),
            FakeServer::default(),
            ReadinessProtocol::new(1, Counting::default()),
        );
        let handle = daemon.loop_handle();
        let state = daemon.state();
        let runner = thread::spawn(move || daemon.start());

        wait_for(&state, LifecycleState::Running);
        assert!(handle.post(LoopTask::BrokenPipe));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*state.borrow(), LifecycleState::Running);

        handle.request_quit();
        assert_eq!(runner.join().expect("join").expect("start"), ExitStatus::Clean);
    }

    #[test]
    fn bind_failure_never_signals_readiness() {
        let dir = TempDir::new().expect("tempdir");
        let counter = Counting::default();
        let daemon = Daemon::with_parts(
            options(&dir),
            FakeServer {
                fail_bind: true,
                ..FakeServer::default()
            },
            ReadinessProtocol::new(1, counter.clone()),
        );
        let state = daemon.state();

        let exit = daemon.start().expect("start");
        assert_eq!(exit, ExitStatus::ServerFailed);
        assert_eq!(exit.code(), 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }

    #[test]
    fn unresponsive_worker_is_abandoned() {
        let dir = TempDir::new().expect("tempdir");
        let daemon = Daemon::with_parts(
            options(&dir),
            FakeServer {
                ignore_shutdown: true,
                ..FakeServer::default()
            },
            ReadinessProtocol::new(1, Counting::default()),
        );
        let handle = daemon.loop_handle();
        let state = daemon.state();
        let runner = thread::spawn(move || daemon.start());

        wait_for(&state, LifecycleState::Running);
        let started = Instant::now();
        handle.request_quit();
        assert_eq!(runner.join().expect("join").expect("start"), ExitStatus::Clean);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn quit_before_bind_skips_readiness() {
        let dir = TempDir::new().expect("tempdir");
        let counter = Counting::default();
        let daemon = Daemon::with_parts(
            options(&dir),
            FakeServer::default(),
            ReadinessProtocol::new(1, counter.clone()),
        );
        daemon.loop_handle().request_quit();

        assert_eq!(daemon.start().expect("start"), ExitStatus::Clean);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
