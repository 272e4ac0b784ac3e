//! Cooperative abort and suspend flags shared with the sequence thread.

use crate::error::{RunError, RunResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

const SUSPEND_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Default)]
struct Flags {
    abort: bool,
    suspend: bool,
}

/// Abort/suspend requests, cheap to clone.
///
/// Abort is checked at item and strip boundaries and between discrete steps
/// of ramps; in-flight hardware commands are never interrupted. A suspended
/// sequence wakes up on either continue or abort.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    inner: Arc<(Mutex<Flags>, Condvar)>,
}

impl RunControl {
    /// Fresh control without pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort at the next check point.
    pub fn request_abort(&self) {
        let (lock, condvar) = &*self.inner;
        lock.lock().abort = true;
        condvar.notify_all();
    }

    /// Request a suspend at the next strip boundary.
    pub fn request_suspend(&self) {
        self.inner.0.lock().suspend = true;
    }

    /// Clear a suspend request.
    pub fn request_continue(&self) {
        let (lock, condvar) = &*self.inner;
        lock.lock().suspend = false;
        condvar.notify_all();
    }

    /// True once an abort was requested.
    pub fn is_abort_requested(&self) -> bool {
        self.inner.0.lock().abort
    }

    /// True while a suspend is requested.
    pub fn is_suspend_requested(&self) -> bool {
        self.inner.0.lock().suspend
    }

    /// Clear both flags before a new run.
    pub fn reset(&self) {
        let mut flags = self.inner.0.lock();
        flags.abort = false;
        flags.suspend = false;
    }

    /// `Err(Aborted)` if an abort was requested.
    pub fn check_abort(&self) -> RunResult<()> {
        if self.is_abort_requested() {
            Err(RunError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Block while suspended.
    ///
    /// Returns `Err(Aborted)` if an abort arrives while waiting.
    pub fn wait_while_suspended(&self) -> RunResult<()> {
        let (lock, condvar) = &*self.inner;
        let mut flags = lock.lock();
        while flags.suspend && !flags.abort {
            condvar.wait_for(&mut flags, SUSPEND_POLL);
        }
        if flags.abort {
            Err(RunError::Aborted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_abort() {
        let control = RunControl::new();
        assert!(control.check_abort().is_ok());
        control.request_abort();
        assert_eq!(control.check_abort(), Err(RunError::Aborted));
        control.reset();
        assert!(control.check_abort().is_ok());
    }

    #[test]
    fn test_continue_wakes_suspended() {
        let control = RunControl::new();
        control.request_suspend();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_suspended())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        control.request_continue();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_abort_wakes_suspended() {
        let control = RunControl::new();
        control.request_suspend();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_suspended())
        };
        thread::sleep(Duration::from_millis(50));
        control.request_abort();
        assert_eq!(waiter.join().unwrap(), Err(RunError::Aborted));
    }

    #[test]
    fn test_not_suspended_returns_immediately() {
        assert!(RunControl::new().wait_while_suspended().is_ok());
    }
}
