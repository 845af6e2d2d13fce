//! Interrupt and broken-pipe signals, delivered to the cooperative loop.
//!
//! tokio's signal driver does the self-pipe work: the real handler only
//! records the signal, and these watcher tasks turn each delivery into a
//! [`LoopTask`] on the loop thread.

use libc::c_int;
use tokio::signal::unix::{signal, SignalKind};

use super::{classify, signal_name, SignalClass};
use crate::error::DaemonError;
use crate::runtime::{LoopHandle, LoopTask, QuitReason};

const WATCHED: [c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGPIPE];

/// Register watchers for SIGINT, SIGTERM and SIGPIPE.
///
/// Must be called inside the loop's runtime context. Deliveries that arrive
/// before the loop starts polling are queued, not lost. Registering SIGPIPE
/// also replaces its default action, so a write to a closed peer no longer
/// kills the process.
pub fn spawn_watchers(handle: &LoopHandle) -> Result<(), DaemonError> {
    for signum in WATCHED {
        watch(signum, handle.clone())?;
    }
    Ok(())
}

/// What the loop should do for a delivered signal. Fault signals never get
/// here; they are handled by the crash reporter.
fn loop_task(signum: c_int) -> Option<LoopTask> {
    match classify(signum) {
        SignalClass::Interrupt => Some(LoopTask::Quit(QuitReason::Signal(signal_name(signum)))),
        SignalClass::BrokenPipe => Some(LoopTask::BrokenPipe),
        SignalClass::Fault | SignalClass::Other => None,
    }
}

fn watch(signum: c_int, handle: LoopHandle) -> Result<(), DaemonError> {
    let Some(task) = loop_task(signum) else {
        return Ok(());
    };
    let name = signal_name(signum);
    let mut stream = signal(SignalKind::from_raw(signum)).map_err(|source| DaemonError::Signal {
        signal: name,
        source,
    })?;

    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            tracing::debug!(signal = name, "signal received");
            if !handle.post(task.clone()) {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_quit_and_broken_pipe_is_absorbed() {
        assert_eq!(
            loop_task(libc::SIGINT),
            Some(LoopTask::Quit(QuitReason::Signal("SIGINT")))
        );
        assert_eq!(
            loop_task(libc::SIGTERM),
            Some(LoopTask::Quit(QuitReason::Signal("SIGTERM")))
        );
        assert_eq!(loop_task(libc::SIGPIPE), Some(LoopTask::BrokenPipe));
    }

    #[test]
    fn faults_are_not_loop_tasks() {
        assert_eq!(loop_task(libc::SIGSEGV), None);
        assert_eq!(loop_task(libc::SIGHUP), None);
    }
}
