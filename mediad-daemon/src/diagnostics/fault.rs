//! Fault handler and crash-reporter thread.
//!
//! The handler itself only stores into atomics and writes one byte to a
//! socket; symbolization happens on the reporter thread. Everything here is
//! process-global because a signal handler has nowhere else to look.

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread;

use libc::{c_int, c_void, siginfo_t};

use super::symbolize::{self, Addr2Line, CrashReport};
use super::{signal_name, MAX_FRAMES};
use crate::error::{io_err, DaemonError};

const FAULT_SIGNALS: [c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];

/// Seconds the handler waits for the reporter before exiting on its own.
const REPORT_GRACE_SECS: u32 = 10;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static IN_FAULT: AtomicBool = AtomicBool::new(false);
static FAULT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static FAULT_ADDR: AtomicUsize = AtomicUsize::new(0);
static FAULT_FROM_USER: AtomicBool = AtomicBool::new(false);
static FRAME_COUNT: AtomicUsize = AtomicUsize::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicUsize = AtomicUsize::new(0);
static FRAMES: [AtomicUsize; MAX_FRAMES] = [ZERO; MAX_FRAMES];
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

pub(super) fn install() -> Result<(), DaemonError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        tracing::debug!("fault handlers already installed");
        return Ok(());
    }

    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("mediad"));
    let (wake_tx, wake_rx) = UnixStream::pair().map_err(|e| io_err("crash-reporter pipe", e))?;
    spawn_reporter(wake_rx, exe)?;
    WAKE_FD.store(wake_tx.into_raw_fd(), Ordering::SeqCst);

    // The unwinder initializes lazily; do it here rather than mid-fault.
    backtrace::trace(|_| false);

    for sig in FAULT_SIGNALS {
        install_handler(sig).map_err(|source| DaemonError::Signal {
            signal: signal_name(sig),
            source,
        })?;
    }
    tracing::debug!(frames = MAX_FRAMES, "fault handlers installed");
    Ok(())
}

fn install_handler(sig: c_int) -> io::Result<()> {
    let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = on_fault;
    // SAFETY: the sigaction struct is fully initialized before use and the
    // handler only touches atomics plus async-signal-safe libc calls.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

extern "C" fn on_fault(sig: c_int, info: *mut siginfo_t, _ucontext: *mut c_void) {
    if IN_FAULT.swap(true, Ordering::SeqCst) {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(sig) };
    }

    FAULT_SIGNAL.store(sig, Ordering::SeqCst);
    if !info.is_null() {
        // SAFETY: the kernel passes a valid siginfo_t with SA_SIGINFO.
        let (code, addr) = unsafe { ((*info).si_code, fault_address(&*info)) };
        FAULT_FROM_USER.store(code <= 0, Ordering::SeqCst);
        FAULT_ADDR.store(addr, Ordering::SeqCst);
    }

    let mut count = 0;
    // SAFETY: no other thread unwinds concurrently; IN_FAULT admits one caller.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            FRAMES[count].store(frame.ip() as usize, Ordering::SeqCst);
            count += 1;
            count < MAX_FRAMES
        });
    }
    FRAME_COUNT.store(count, Ordering::SeqCst);

    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        // SAFETY: write(2) is async-signal-safe; the buffer outlives the call.
        unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }

    // The reporter exits the process; this is only the fallback.
    for _ in 0..REPORT_GRACE_SECS {
        // SAFETY: sleep(3) has no memory-safety preconditions.
        unsafe { libc::sleep(1) };
    }
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(sig) };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: &siginfo_t) -> usize {
    info.si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: &siginfo_t) -> usize {
    info.si_addr as usize
}

fn spawn_reporter(mut wake: UnixStream, exe: PathBuf) -> Result<(), DaemonError> {
    thread::Builder::new()
        .name("crash-reporter".to_string())
        .spawn(move || {
            let mut byte = [0u8; 1];
            loop {
                match wake.read(&mut byte) {
                    Ok(0) => return,
                    Ok(_) => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return,
                }
            }

            let report = snapshot();
            // Raw fd 2: the faulting thread may be holding the stderr lock.
            // SAFETY: fd 2 stays open for the life of the process; ManuallyDrop
            // keeps it from being closed here.
            let stderr = ManuallyDrop::new(unsafe { File::from_raw_fd(2) });
            let mut out = BufWriter::new(&*stderr);
            let _ = symbolize::render(&report, &exe, &Addr2Line, &mut out);
            drop(out);
            // SAFETY: terminating without unwinding is the point.
            unsafe { libc::_exit(report.signal) };
        })
        .map_err(|e| io_err("crash-reporter thread", e))?;
    Ok(())
}

fn snapshot() -> CrashReport {
    let count = FRAME_COUNT.load(Ordering::SeqCst).min(MAX_FRAMES);
    let fault_addr = if FAULT_FROM_USER.load(Ordering::SeqCst) {
        None
    } else {
        Some(FAULT_ADDR.load(Ordering::SeqCst))
    };
    CrashReport {
        signal: FAULT_SIGNAL.load(Ordering::SeqCst),
        fault_addr,
        frames: FRAMES[..count]
            .iter()
            .map(|f| f.load(Ordering::SeqCst))
            .collect(),
    }
}
