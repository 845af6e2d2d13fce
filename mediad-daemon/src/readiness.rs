//! One-shot readiness handshake with the supervising parent process.
//!
//! Once the request server has bound its endpoint the parent receives a
//! single `SIGCONT`. Bind failures never notify; repeated calls are no-ops.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// How the parent is told the daemon is ready.
pub trait ParentNotifier: Send {
    fn notify_parent(&self, parent: u32) -> io::Result<()>;
}

/// Sends `SIGCONT` to the parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigCont;

impl ParentNotifier for SigCont {
    fn notify_parent(&self, parent: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(parent)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "parent pid out of range"))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGCONT) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

pub struct ReadinessProtocol<N = SigCont> {
    parent: u32,
    fired: AtomicBool,
    notifier: N,
}

impl ReadinessProtocol<SigCont> {
    /// Capture the current parent process id.
    pub fn for_parent_process() -> Self {
        Self::new(std::os::unix::process::parent_id(), SigCont)
    }
}

impl<N: ParentNotifier> ReadinessProtocol<N> {
    pub fn new(parent: u32, notifier: N) -> Self {
        Self {
            parent,
            fired: AtomicBool::new(false),
            notifier,
        }
    }

    pub fn parent(&self) -> u32 {
        self.parent
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Notify the parent. Returns `true` only on the call that actually fired.
    ///
    /// A failed delivery still counts as fired: the handshake is never retried.
    pub fn signal_ready(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(parent = self.parent, "readiness already signalled");
            return false;
        }

        match self.notifier.notify_parent(self.parent) {
            Ok(()) => tracing::info!(parent = self.parent, "readiness signalled to parent"),
            Err(err) => {
                tracing::warn!(parent = self.parent, error = %err, "could not signal readiness to parent")
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl ParentNotifier for Counting {
        fn notify_parent(&self, _parent: u32) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl ParentNotifier for Failing {
        fn notify_parent(&self, _parent: u32) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::ESRCH))
        }
    }

    #[test]
    fn fires_exactly_once() {
        let counter = Counting::default();
        let readiness = ReadinessProtocol::new(42, counter.clone());
        assert!(!readiness.has_fired());
        assert!(readiness.signal_ready());
        assert!(!readiness.signal_ready());
        assert!(!readiness.signal_ready());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(readiness.has_fired());
    }

    #[test]
    fn concurrent_callers_fire_once() {
        let counter = Counting::default();
        let readiness = Arc::new(ReadinessProtocol::new(42, counter.clone()));
        let fired: usize = (0..8)
            .map(|_| {
                let readiness = readiness.clone();
                std::thread::spawn(move || readiness.signal_ready())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().expect("join")))
            .sum();
        assert_eq!(fired, 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_delivery_is_not_retried() {
        let readiness = ReadinessProtocol::new(42, Failing);
        assert!(readiness.signal_ready());
        assert!(!readiness.signal_ready());
    }

    #[test]
    fn sigcont_to_self_succeeds() {
        assert!(SigCont.notify_parent(std::process::id()).is_ok());
    }

    #[test]
    fn captures_real_parent() {
        let readiness = ReadinessProtocol::for_parent_process();
        assert_eq!(readiness.parent(), std::os::unix::process::parent_id());
    }
}
