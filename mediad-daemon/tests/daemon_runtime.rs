use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use mediad_daemon::{
    ping, request_status, Daemon, DaemonError, DaemonOptions, ExitStatus, JsonLineServer,
    LifecycleState, ParentNotifier, ReadinessProtocol,
};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Counting(Arc<AtomicUsize>);

impl ParentNotifier for Counting {
    fn notify_parent(&self, _parent: u32) -> io::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn options(conf: &std::path::Path) -> DaemonOptions {
    DaemonOptions {
        install_diagnostics: false,
        trap_signals: false,
        ..DaemonOptions::new(conf)
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn serves_requests_until_quit() {
    let dir = TempDir::new().expect("tempdir");
    let port = free_port();
    let conf = dir.path().join("mediad.conf");
    fs::write(&conf, format!("[server]\naddress = \"127.0.0.1\"\nport = {port}\n")).expect("write");

    let counter = Counting::default();
    let daemon = Daemon::with_parts(
        options(&conf),
        JsonLineServer,
        ReadinessProtocol::new(1, counter.clone()),
    );
    let handle = daemon.loop_handle();
    let state = daemon.state();
    let runner = thread::spawn(move || daemon.start());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    assert!(wait_until(Duration::from_secs(5), || ping(addr).is_ok()));
    assert_eq!(*state.borrow(), LifecycleState::Running);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    // No descriptor file next to the config: the daemon still serves.
    let status = request_status(addr).expect("status");
    assert_eq!(status["descriptor"]["loaded"], serde_json::json!(false));

    handle.request_quit();
    assert_eq!(runner.join().expect("join").expect("start"), ExitStatus::Clean);
    assert_eq!(*state.borrow(), LifecycleState::Stopped);
    assert!(ping(addr).is_err(), "listener must be closed after stop");
}

#[test]
fn occupied_port_exits_with_failure() {
    let dir = TempDir::new().expect("tempdir");
    let taken = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = taken.local_addr().expect("addr").port();
    let conf = dir.path().join("mediad.conf");
    fs::write(&conf, format!("[server]\naddress = \"127.0.0.1\"\nport = {port}\n")).expect("write");

    let counter = Counting::default();
    let exit = Daemon::with_parts(
        options(&conf),
        JsonLineServer,
        ReadinessProtocol::new(1, counter.clone()),
    )
    .start()
    .expect("start");

    assert_eq!(exit, ExitStatus::ServerFailed);
    assert_eq!(counter.0.load(Ordering::SeqCst), 0);
}

#[test]
fn unreadable_config_is_a_startup_error() {
    let dir = TempDir::new().expect("tempdir");
    // A directory cannot be read as a file.
    let err = Daemon::with_parts(
        options(dir.path()),
        JsonLineServer,
        ReadinessProtocol::new(1, Counting::default()),
    )
    .start()
    .err()
    .expect("start must fail");
    assert!(matches!(err, DaemonError::Config(_)), "got: {err}");
}
