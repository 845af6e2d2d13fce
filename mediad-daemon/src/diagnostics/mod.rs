//! Process signal handling and crash reporting.
//!
//! Three classes of signal are handled:
//!
//! * faults (`SIGSEGV`, `SIGBUS`, `SIGILL`, `SIGFPE`): a raw `sigaction`
//!   handler captures the stack and hands it to the `crash-reporter` thread,
//!   which prints a symbolized trace and exits with the signal number;
//! * broken pipe (`SIGPIPE`): logged, never fatal;
//! * interrupt (`SIGINT`, `SIGTERM`): routed to the cooperative loop as a
//!   quit request.
//!
//! `SIGKILL` cannot be intercepted; `SIGTERM` is its catchable stand-in.

mod fault;
pub mod signals;
pub mod symbolize;

use crate::error::DaemonError;

pub use symbolize::{render, Addr2Line, CrashReport, FrameLocation, SymbolResolver};

/// Maximum number of frames captured by the fault handler.
pub const MAX_FRAMES: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    Fault,
    BrokenPipe,
    Interrupt,
    Other,
}

pub fn classify(signal: i32) -> SignalClass {
    match signal {
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE => SignalClass::Fault,
        libc::SIGPIPE => SignalClass::BrokenPipe,
        libc::SIGINT | libc::SIGTERM => SignalClass::Interrupt,
        _ => SignalClass::Other,
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGKILL => "SIGKILL",
        libc::SIGCONT => "SIGCONT",
        _ => "unknown signal",
    }
}

/// Install the fault handlers and start the crash reporter.
///
/// Idempotent: later calls return `Ok(())` without touching the handlers.
/// Interrupt and broken-pipe watchers live in [`signals`] because they need
/// the loop to be running.
pub fn install() -> Result<(), DaemonError> {
    fault::install()
}
