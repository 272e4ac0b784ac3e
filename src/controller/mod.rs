//! Hardware controllers
//!
//! Each controller owns one worker thread holding exclusive access to one
//! physical resource. Other threads talk to it through a bounded
//! [`Mailbox`](crate::request::Mailbox) and block on the returned replies.
//!
//! The worker loop is the same for every controller:
//!
//! 1. open the resource,
//! 2. pop one request at a time with a short poll timeout,
//! 3. execute it against the open resource,
//! 4. on a link fault close the resource, log, back off and reopen.
//!
//! Command errors other than link faults only travel back to the caller.

pub mod environ;
pub mod needle;
pub mod table;

pub use environ::{EnvironController, EnvironSettings};
pub use needle::{NeedleController, NeedleEvent, NeedleSettings};
pub use table::{TableController, TableEvent, TableSettings};

use crate::error::{AppResult, BenchError};
use crate::request::{Inbox, Next};
use crate::util::Timer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a multi-step procedure that honors an abort flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// Every step ran and the device reports calibrated.
    Completed,
    /// The abort flag was set between two steps.
    Aborted,
}

/// Resource-specific half of a worker.
pub trait Service: Send + 'static {
    /// State available to requests while the resource is open.
    type Context: 'static;

    /// Worker and thread name.
    fn name(&self) -> &str;

    /// Open the resource.
    fn open(&mut self) -> AppResult<Self::Context>;

    /// Release the resource.
    fn close(&mut self, context: Self::Context) {
        drop(context);
    }

    /// Called after every poll of the mailbox.
    fn idle(&mut self, _context: &mut Self::Context) -> AppResult<()> {
        Ok(())
    }

    /// Called after a failure, before backing off.
    fn reset(&mut self) {}
}

/// Timing of a worker loop.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    /// Mailbox poll timeout.
    pub poll_interval: Duration,
    /// Delay before reopening a failed resource.
    pub reopen_backoff: Duration,
}

enum Served {
    Shutdown,
    Closed,
}

/// Handle to a running worker thread.
pub struct Worker {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread for `service`.
    pub fn spawn<S: Service>(
        service: S,
        inbox: Inbox<S::Context>,
        timing: WorkerTiming,
    ) -> AppResult<Self> {
        let name = service.name().to_string();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(service, inbox, timing, flag))
            .map_err(|err| BenchError::Resource(format!("failed to spawn {name} worker: {err}")))?;
        Ok(Self {
            name,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True until the thread exited.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Set the stop flag and join the thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep for `duration` unless `flag` gets set.
pub(crate) fn sleep_unless(flag: &AtomicBool, duration: Duration) {
    let step = Duration::from_millis(25);
    let timer = Timer::new();
    while !flag.load(Ordering::SeqCst) {
        let elapsed = timer.delta();
        if elapsed >= duration {
            break;
        }
        thread::sleep(step.min(duration - elapsed));
    }
}

fn run<S: Service>(
    mut service: S,
    inbox: Inbox<S::Context>,
    timing: WorkerTiming,
    shutdown: Arc<AtomicBool>,
) {
    let name = service.name().to_string();
    info!(worker = %name, "worker started");
    while !shutdown.load(Ordering::SeqCst) {
        let mut context = match service.open() {
            Ok(context) => context,
            Err(err) => {
                warn!(worker = %name, error = %err, "failed to open resource");
                service.reset();
                sleep_unless(&shutdown, timing.reopen_backoff);
                continue;
            }
        };
        debug!(worker = %name, "resource opened");
        let served = serve(&mut service, &mut context, &inbox, timing, &shutdown);
        service.close(context);
        debug!(worker = %name, "resource closed");
        match served {
            Ok(Served::Shutdown) => break,
            Ok(Served::Closed) => {
                debug!(worker = %name, "all mailboxes dropped");
                break;
            }
            Err(err) => {
                error!(worker = %name, error = %err, "link fault, reopening resource");
                service.reset();
                sleep_unless(&shutdown, timing.reopen_backoff);
            }
        }
    }
    info!(worker = %name, "worker stopped");
}

fn serve<S: Service>(
    service: &mut S,
    context: &mut S::Context,
    inbox: &Inbox<S::Context>,
    timing: WorkerTiming,
    shutdown: &AtomicBool,
) -> AppResult<Served> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(Served::Shutdown);
        }
        match inbox.next(timing.poll_interval) {
            Next::Request(request) => {
                debug!(worker = service.name(), request = request.name(), "dispatch");
                request.execute(context)?;
            }
            Next::Idle => {}
            Next::Closed => return Ok(Served::Closed),
        }
        service.idle(context)?;
    }
}

/// Poll `sample` until two consecutive reads are identical.
///
/// `on_sample` sees every read, including the first. Fails with
/// [`BenchError::MovementTimeout`] once `timeout` elapsed.
pub fn wait_until_stable<P, F, C>(
    mut sample: F,
    mut on_sample: C,
    poll_interval: Duration,
    timeout: Duration,
) -> AppResult<P>
where
    P: PartialEq + Copy + std::fmt::Debug,
    F: FnMut() -> AppResult<P>,
    C: FnMut(P),
{
    let timer = Timer::new();
    let mut previous = sample()?;
    on_sample(previous);
    loop {
        if timer.delta() > timeout {
            return Err(BenchError::MovementTimeout(format!(
                "position not stable after {timeout:?}, last {previous:?}"
            )));
        }
        thread::sleep(poll_interval);
        let current = sample()?;
        on_sample(current);
        if current == previous {
            return Ok(current);
        }
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{mailbox, DEFAULT_TIMEOUT};
    use parking_lot::Mutex;
    use std::time::Instant;

    #[test]
    fn test_wait_until_stable_sample_count() {
        let samples = [1, 2, 3, 3, 4];
        let mut index = 0;
        let mut seen = Vec::new();
        let poll = Duration::from_millis(5);
        let start = Instant::now();
        let result = wait_until_stable(
            || {
                let value = samples[index];
                index += 1;
                Ok(value)
            },
            |value| seen.push(value),
            poll,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(seen, vec![1, 2, 3, 3]);
        assert!(start.elapsed() >= poll * 3);
    }

    #[test]
    fn test_wait_until_stable_timeout() {
        let mut value = 0;
        let result = wait_until_stable(
            || {
                value += 1;
                Ok(value)
            },
            |_| {},
            Duration::from_millis(2),
            Duration::from_millis(20),
        );
        assert!(matches!(result, Err(BenchError::MovementTimeout(_))));
    }

    struct Flaky {
        opens: Arc<Mutex<usize>>,
        fail_opens: usize,
    }

    impl Service for Flaky {
        type Context = u32;

        fn name(&self) -> &str {
            "flaky"
        }

        fn open(&mut self) -> AppResult<u32> {
            let mut opens = self.opens.lock();
            *opens += 1;
            if *opens <= self.fail_opens {
                return Err(BenchError::Resource("refused".into()));
            }
            Ok(0)
        }
    }

    fn timing() -> WorkerTiming {
        WorkerTiming {
            poll_interval: Duration::from_millis(5),
            reopen_backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_worker_reopens_after_open_failure() {
        let opens = Arc::new(Mutex::new(0));
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let mut worker = Worker::spawn(
            Flaky {
                opens: Arc::clone(&opens),
                fail_opens: 2,
            },
            inbox,
            timing(),
        )
        .unwrap();
        let value = mailbox.call("bump", |ctx: &mut u32| {
            *ctx += 1;
            Ok(*ctx)
        });
        assert_eq!(value, Ok(1));
        assert_eq!(*opens.lock(), 3);
        worker.shutdown();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_reopens_after_link_fault() {
        let opens = Arc::new(Mutex::new(0));
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let _worker = Worker::spawn(
            Flaky {
                opens: Arc::clone(&opens),
                fail_opens: 0,
            },
            inbox,
            timing(),
        )
        .unwrap();
        let fault = mailbox.call::<(), _>("io", |_| Err(BenchError::Resource("lost".into())));
        assert!(fault.unwrap_err().is_link_fault());
        let command = mailbox.call::<(), _>("bad", |_| Err(BenchError::HardFault("nak".into())));
        assert!(command.is_err());
        assert_eq!(mailbox.call("ok", |_| Ok(5u8)), Ok(5));
        assert_eq!(*opens.lock(), 2);
    }
}
