//! C6: the request queue, a wait-free hand-off from event-loop threads
//! to a single user-driven worker thread.
//!
//! Follows the wider vhost-user-backend ecosystem convention for this
//! kind of MPSC producer/single-consumer hand-off: `crossbeam-channel`,
//! with a `Select` between the request channel and a dedicated stop
//! channel backing a blocking `run`, a wait-free enqueue, and a
//! non-blocking dequeue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender};

use crate::backend::Status;
use crate::error::Error;
use crate::queue::BufferVector;

/// A one-shot completion sink captured when a [`Request`] is built.
/// [`crate::device::Device`] constructs these to re-marshal the commit
/// back onto the virtqueue's owning event loop, so it runs on the thread
/// that owns the ring.
type CompletionFn = Box<dyn FnOnce(u32, Status) + Send>;

/// One dequeued descriptor chain, owned by the engine from dequeue until
/// `complete_bio`, then by the backend only for the duration of
/// processing.
pub struct Request {
    head: u16,
    buffers: BufferVector,
    complete: Option<CompletionFn>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("head", &self.head)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl Request {
    pub(crate) fn new(head: u16, buffers: BufferVector, complete: CompletionFn) -> Self {
        Request {
            head,
            buffers,
            complete: Some(complete),
        }
    }

    /// The chain's head descriptor index, identifies it for the
    /// lifetime of the request.
    pub fn head(&self) -> u16 {
        self.head
    }

    /// The resolved, ordered buffer vector: read-only buffers first,
    /// then write-only, per the virtio ordering rule.
    pub fn buffers(&self) -> &BufferVector {
        &self.buffers
    }

    /// Reports completion: `len` bytes written, overall `status`. Safe to
    /// call from any thread: the commit itself is scheduled onto the
    /// owning virtqueue's event loop. Callers must ensure all writes into
    /// write-only buffers happen-before this call; this crate cannot
    /// enforce that from here.
    pub fn complete_bio(mut self, len: u32, status: Status) {
        if let Some(f) = self.complete.take() {
            f(len, status);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // A backend that drops a `Request` without completing it (panic,
        // early return, bug) must not leave the queue waiting forever for
        // a commit that will never come; treat it as canceled.
        if let Some(f) = self.complete.take() {
            f(0, Status::Canceled);
        }
    }
}

/// Outcome of one [`RequestQueue::run`] pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The worker should call `dequeue_request` until it returns `None`.
    HasWork,
    /// `stop` was observed and the internal queue has fully drained.
    Stopped,
}

/// MPSC hand-off between event-loop threads (producers) and a single
/// worker thread (consumer, driven by user code).
pub struct RequestQueue {
    sender: Sender<Request>,
    receiver: Receiver<Request>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    stopping: AtomicBool,
    // `run` pulls one message off the channel to observe readiness, but
    // doesn't own it; it's stashed here until the worker's next
    // `dequeue_request` so no request is ever lost between the two calls.
    pending: Mutex<VecDeque<Request>>,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .field("queued", &self.receiver.len())
            .finish()
    }
}

impl RequestQueue {
    /// Creates an empty request queue.
    pub fn create() -> Self {
        let (sender, receiver) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        RequestQueue {
            sender,
            receiver,
            stop_tx,
            stop_rx,
            stopping: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Releases the queue. Any requests still queued are dropped (and,
    /// per `Request`'s `Drop` impl, reported canceled to whatever
    /// completion sink they carried).
    pub fn release(self) {}

    /// A cloneable handle producers (event-loop threads) use to enqueue
    /// dequeued chains. Wait-free.
    pub(crate) fn sender(&self) -> Sender<Request> {
        self.sender.clone()
    }

    /// Cooperative driver for the worker thread: blocks up to
    /// `timeout_ms` waiting for either a new request or a `stop`
    /// signal. Returns [`RunOutcome::HasWork`] if the worker should now
    /// drain via [`dequeue_request`](Self::dequeue_request), or if the
    /// wait simply timed out (the `-EAGAIN`-style "try again" case).
    /// Returns [`RunOutcome::Stopped`] once `stop` has been observed and
    /// the internal queue is fully drained; in-flight requests already
    /// handed to the worker are allowed to complete independently.
    pub fn run(&self, timeout_ms: u64) -> Result<RunOutcome, Error> {
        if self.stopping.load(Ordering::Acquire)
            && self.receiver.is_empty()
            && self.pending.lock().expect("pending lock poisoned").is_empty()
        {
            return Ok(RunOutcome::Stopped);
        }

        let mut sel = Select::new();
        let req_op = sel.recv(&self.receiver);
        let stop_op = sel.recv(&self.stop_rx);

        match sel.select_timeout(Duration::from_millis(timeout_ms)) {
            Ok(oper) => {
                if oper.index() == req_op {
                    if let Ok(req) = oper.recv(&self.receiver) {
                        self.pending.lock().expect("pending lock poisoned").push_back(req);
                    }
                } else if oper.index() == stop_op {
                    let _ = oper.recv(&self.stop_rx);
                    self.stopping.store(true, Ordering::Release);
                }
                Ok(RunOutcome::HasWork)
            }
            Err(_) => Ok(RunOutcome::HasWork),
        }
    }

    /// Non-blocking: returns `Some(request)` if one was available.
    pub fn dequeue_request(&self) -> Option<Request> {
        if let Some(req) = self.pending.lock().expect("pending lock poisoned").pop_front() {
            return Some(req);
        }
        self.receiver.try_recv().ok()
    }

    /// Wakes the worker (if blocked in `run`). `run` keeps returning
    /// `HasWork` until the queue drains, then returns `Stopped`.
    /// Idempotent.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.stop_tx.try_send(());
    }
}
