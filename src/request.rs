//! Single-use request/reply primitive used by the controller workers.
//!
//! A [`Mailbox`] enqueues closures into a bounded FIFO drained by exactly one
//! worker thread through its [`Inbox`]. Each submission yields a [`Reply`]
//! that the caller blocks on with a timeout. The closure runs at most once and
//! its result (or error, or panic) is delivered to every clone of the reply.

use crate::error::BenchError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default time a caller waits on a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

struct Slot<T> {
    value: Mutex<Option<Result<T, BenchError>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// First completion wins.
    fn complete(&self, result: Result<T, BenchError>) {
        let mut value = self.value.lock();
        if value.is_none() {
            *value = Some(result);
            self.ready.notify_all();
        }
    }
}

/// Handle to the outcome of a submitted request.
pub struct Reply<T> {
    name: Arc<str>,
    slot: Arc<Slot<T>>,
    timeout: Duration,
}

impl<T> Clone for Reply<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            slot: Arc::clone(&self.slot),
            timeout: self.timeout,
        }
    }
}

impl<T: Clone> Reply<T> {
    /// Block until the request completed or `timeout` elapsed.
    pub fn get(&self, timeout: Duration) -> Result<T, BenchError> {
        let deadline = Instant::now() + timeout;
        let mut value = self.slot.value.lock();
        while value.is_none() {
            if self.slot.ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }
        match value.as_ref() {
            Some(result) => result.clone(),
            None => Err(BenchError::RequestTimeout(format!(
                "{} did not complete within {:?}",
                self.name, timeout
            ))),
        }
    }

    /// Block using the mailbox default timeout.
    pub fn wait(&self) -> Result<T, BenchError> {
        self.get(self.timeout)
    }

    /// Replace the timeout used by [`Reply::wait`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns true once a result has been captured.
    pub fn is_ready(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// Name given at submission.
    pub fn name(&self) -> &str {
        &self.name
    }
}

trait Job<C>: Send {
    fn run(self: Box<Self>, ctx: &mut C) -> Result<(), BenchError>;
    fn abandon(self: Box<Self>);
}

struct Call<C, T, F> {
    name: Arc<str>,
    work: F,
    slot: Arc<Slot<T>>,
    _context: PhantomData<fn(&mut C)>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<C, T, F> Job<C> for Call<C, T, F>
where
    T: Send,
    F: FnOnce(&mut C) -> Result<T, BenchError> + Send,
{
    fn run(self: Box<Self>, ctx: &mut C) -> Result<(), BenchError> {
        let Call {
            name, work, slot, ..
        } = *self;
        match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            Ok(result) => {
                let link_fault = match &result {
                    Err(err) if err.is_link_fault() => Some(err.clone()),
                    _ => None,
                };
                slot.complete(result);
                link_fault.map_or(Ok(()), Err)
            }
            Err(payload) => {
                let message = format!("{name} panicked: {}", panic_message(payload.as_ref()));
                slot.complete(Err(BenchError::HardFault(message.clone())));
                Err(BenchError::Resource(message))
            }
        }
    }

    fn abandon(self: Box<Self>) {
        self.slot.complete(Err(BenchError::HardFault(format!(
            "{} was dropped before execution",
            self.name
        ))));
    }
}

/// A queued unit of work for a worker owning a `C`.
pub struct Request<C> {
    name: Arc<str>,
    job: Option<Box<dyn Job<C>>>,
}

impl<C> Request<C> {
    /// Request name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the request against the worker context.
    ///
    /// The outcome always lands in the reply. The returned error is reserved
    /// for link faults (`Resource` errors and panics) after which the worker
    /// should reopen its resource.
    pub fn execute(mut self, ctx: &mut C) -> Result<(), BenchError> {
        match self.job.take() {
            Some(job) => job.run(ctx),
            None => Ok(()),
        }
    }
}

impl<C> Drop for Request<C> {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            job.abandon();
        }
    }
}

/// Outcome of polling an [`Inbox`].
pub enum Next<C> {
    /// A request arrived.
    Request(Request<C>),
    /// Nothing arrived within the poll interval.
    Idle,
    /// Every mailbox was dropped.
    Closed,
}

/// Producer side, cheap to clone.
pub struct Mailbox<C> {
    sender: Sender<Request<C>>,
    timeout: Duration,
}

impl<C> Clone for Mailbox<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            timeout: self.timeout,
        }
    }
}

impl<C: 'static> Mailbox<C> {
    /// Enqueue `work`, waiting at most the default timeout for queue space.
    pub fn submit<T, F>(&self, name: &str, work: F) -> Result<Reply<T>, BenchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T, BenchError> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let slot = Arc::new(Slot::new());
        let request = Request {
            name: Arc::clone(&name),
            job: Some(Box::new(Call {
                name: Arc::clone(&name),
                work,
                slot: Arc::clone(&slot),
                _context: PhantomData,
            })),
        };
        match self.sender.send_timeout(request, self.timeout) {
            Ok(()) => Ok(Reply {
                name,
                slot,
                timeout: self.timeout,
            }),
            Err(SendTimeoutError::Timeout(_)) => Err(BenchError::RequestTimeout(format!(
                "mailbox full, could not queue {name}"
            ))),
            Err(SendTimeoutError::Disconnected(_)) => Err(BenchError::HardFault(format!(
                "worker stopped, could not queue {name}"
            ))),
        }
    }

    /// Submit and block on the reply.
    pub fn call<T, F>(&self, name: &str, work: F) -> Result<T, BenchError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut C) -> Result<T, BenchError> + Send + 'static,
    {
        self.submit(name, work)?.wait()
    }

    /// Default reply timeout of this mailbox.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Consumer side, owned by the worker thread.
pub struct Inbox<C> {
    receiver: Receiver<Request<C>>,
}

impl<C> Inbox<C> {
    /// Wait up to `poll` for the next request.
    pub fn next(&self, poll: Duration) -> Next<C> {
        match self.receiver.recv_timeout(poll) {
            Ok(request) => Next::Request(request),
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Closed,
        }
    }

    /// Drop every queued request, failing their replies.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

/// Create a bounded mailbox pair.
pub fn mailbox<C>(capacity: usize, timeout: Duration) -> (Mailbox<C>, Inbox<C>) {
    let (sender, receiver) = channel::bounded(capacity.max(1));
    (Mailbox { sender, timeout }, Inbox { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn serve_one(inbox: &Inbox<u32>, ctx: &mut u32) -> Result<(), BenchError> {
        match inbox.next(Duration::from_secs(1)) {
            Next::Request(request) => request.execute(ctx),
            _ => panic!("expected a request"),
        }
    }

    #[test]
    fn test_result_reaches_caller() {
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let reply = mailbox.submit("add", |ctx| {
            *ctx += 2;
            Ok(*ctx)
        }).unwrap();
        let mut ctx = 40;
        serve_one(&inbox, &mut ctx).unwrap();
        assert_eq!(reply.get(Duration::from_millis(10)).unwrap(), 42);
    }

    #[test]
    fn test_error_reaches_caller() {
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let reply = mailbox
            .submit::<(), _>("fail", |_| Err(BenchError::HardFault("boom".into())))
            .unwrap();
        serve_one(&inbox, &mut 0).unwrap();
        assert_eq!(
            reply.get(Duration::from_millis(10)),
            Err(BenchError::HardFault("boom".into()))
        );
    }

    #[test]
    fn test_link_fault_signals_worker() {
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let reply = mailbox
            .submit::<(), _>("io", |_| Err(BenchError::Resource("port closed".into())))
            .unwrap();
        assert!(serve_one(&inbox, &mut 0).is_err());
        assert!(reply.get(Duration::ZERO).unwrap_err().is_link_fault());
    }

    #[test]
    fn test_panic_becomes_hard_fault() {
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let reply = mailbox
            .submit::<(), _>("explode", |_| panic!("driver bug"))
            .unwrap();
        assert!(serve_one(&inbox, &mut 0).is_err());
        match reply.get(Duration::ZERO) {
            Err(BenchError::HardFault(message)) => assert!(message.contains("driver bug")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_timeout_when_not_served() {
        let (mailbox, _inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let reply = mailbox.submit("idle", |_| Ok(())).unwrap();
        assert!(matches!(
            reply.get(Duration::from_millis(20)),
            Err(BenchError::RequestTimeout(_))
        ));
        assert!(!reply.is_ready());
    }

    #[test]
    fn test_dropped_request_fails_reply() {
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let reply = mailbox.submit("dropped", |_| Ok(())).unwrap();
        assert_eq!(inbox.drain(), 1);
        assert!(matches!(reply.get(Duration::ZERO), Err(BenchError::HardFault(_))));
    }

    #[test]
    fn test_executes_once_for_concurrent_getters() {
        let (mailbox, inbox) = mailbox::<u32>(4, DEFAULT_TIMEOUT);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let reply = mailbox
            .submit("once", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(7u32)
            })
            .unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let reply = reply.clone();
                thread::spawn(move || reply.get(Duration::from_secs(2)))
            })
            .collect();
        serve_one(&inbox, &mut 0).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap(), 7);
        }
        assert_eq!(reply.get(Duration::ZERO).unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_order() {
        let (mailbox, inbox) = mailbox::<Vec<u32>>(8, DEFAULT_TIMEOUT);
        for i in 0..5u32 {
            mailbox
                .submit("push", move |log: &mut Vec<u32>| {
                    log.push(i);
                    Ok(())
                })
                .unwrap();
        }
        let mut log = Vec::new();
        while let Next::Request(request) = inbox.next(Duration::from_millis(10)) {
            request.execute(&mut log).unwrap();
        }
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_closed_mailbox() {
        let (mailbox, inbox) = mailbox::<u32>(1, DEFAULT_TIMEOUT);
        drop(mailbox);
        assert!(matches!(inbox.next(Duration::from_millis(10)), Next::Closed));
    }
}
