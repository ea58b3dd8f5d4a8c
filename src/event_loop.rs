//! C5: epoll reactor with bottom-halves.
//!
//! One epoll instance, serviced cooperatively by a single thread. Fd
//! callbacks are registered directly; bottom-halves are one-shot
//! closures schedulable from any thread via an eventfd, drained
//! atomically each pass. Follows the `vmm_sys_util::{epoll, eventfd}`
//! usage throughout `virtiofsd` and `vhost-device`'s scsi backend.
//! Thread wakeups are always internal eventfds here, never a signal
//! handler.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::error::Error;

/// A one-shot closure schedulable onto the loop from any thread.
pub type BottomHalf = Box<dyn FnOnce() + Send + 'static>;

/// An fd-readiness callback registered with [`EventLoop::register_fd`].
pub type FdHandler = Box<dyn FnMut(EventSet) + Send + 'static>;

const BH_TOKEN: u64 = u64::MAX - 1;
const TERMINATE_TOKEN: u64 = u64::MAX;

/// Outcome of one [`EventLoop::run`] pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// More work may be pending; call `run` again.
    MoreWork,
    /// `terminate` was observed and all bottom-halves submitted before it
    /// have been drained.
    Terminated,
}

/// A single-threaded epoll reactor with cross-thread bottom-half
/// scheduling and graceful, idempotent termination.
pub struct EventLoop {
    epoll: Epoll,
    bh_eventfd: EventFd,
    bh_queue: Arc<Mutex<VecDeque<BottomHalf>>>,
    terminate_eventfd: EventFd,
    terminate_requested: AtomicBool,
    terminated: bool,
    handlers: HashMap<RawFd, FdHandler>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("terminated", &self.terminated)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Result<Self, Error> {
        let epoll = Epoll::new()?;
        let bh_eventfd = EventFd::new(libc::EFD_NONBLOCK)?;
        let terminate_eventfd = EventFd::new(libc::EFD_NONBLOCK)?;

        epoll.ctl(
            ControlOperation::Add,
            bh_eventfd.as_raw_fd(),
            EpollEvent::new(EventSet::IN, BH_TOKEN),
        )?;
        epoll.ctl(
            ControlOperation::Add,
            terminate_eventfd.as_raw_fd(),
            EpollEvent::new(EventSet::IN, TERMINATE_TOKEN),
        )?;

        Ok(EventLoop {
            epoll,
            bh_eventfd,
            bh_queue: Arc::new(Mutex::new(VecDeque::new())),
            terminate_eventfd,
            terminate_requested: AtomicBool::new(false),
            terminated: false,
            handlers: HashMap::new(),
        })
    }

    /// Registers a callback for readiness events on `fd`. The loop does
    /// not take ownership of `fd`; the caller closes it after
    /// unregistering.
    pub fn register_fd(&mut self, fd: RawFd, events: EventSet, handler: FdHandler) -> Result<(), Error> {
        self.epoll
            .ctl(ControlOperation::Add, fd, EpollEvent::new(events, fd as u64))?;
        self.handlers.insert(fd, handler);
        Ok(())
    }

    pub fn unregister_fd(&mut self, fd: RawFd) -> Result<(), Error> {
        self.epoll
            .ctl(ControlOperation::Delete, fd, EpollEvent::new(EventSet::empty(), 0))?;
        self.handlers.remove(&fd);
        Ok(())
    }

    /// Schedules `f` to run exactly once on the loop's thread, in FIFO
    /// order with other bottom-halves. Safe to call from any thread.
    pub fn schedule_oneshot(&self, f: BottomHalf) -> Result<(), Error> {
        self.bh_queue.lock().expect("bh queue poisoned").push_back(f);
        self.bh_eventfd.write(1)?;
        Ok(())
    }

    /// Idempotent: causes the next `run` to return `Terminated` once all
    /// bottom-halves queued before this call have drained. Fd events
    /// pending at the moment of termination are not guaranteed delivery.
    pub fn terminate(&self) -> Result<(), Error> {
        if !self.terminate_requested.swap(true, Ordering::SeqCst) {
            self.terminate_eventfd.write(1)?;
        }
        Ok(())
    }

    /// Services one pass of the reactor: waits (up to `timeout_ms`) for
    /// readiness, drains any pending bottom-halves, and invokes fd
    /// handlers. Descriptor walking, commit, and inflight manipulation
    /// never happen here directly. Handlers call into `Queue`/`Device`
    /// themselves.
    pub fn run(&mut self, timeout_ms: i32) -> Result<RunOutcome, Error> {
        if self.terminated {
            return Ok(RunOutcome::Terminated);
        }

        let mut events = vec![EpollEvent::new(EventSet::empty(), 0); 32];
        let n = match self.epoll.wait(events.len(), timeout_ms, &mut events[..]) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(Error::Io(e)),
        };

        for ev in &events[..n] {
            match ev.data() {
                BH_TOKEN => {
                    let _ = self.bh_eventfd.read();
                    self.drain_bottom_halves();
                }
                TERMINATE_TOKEN => {
                    let _ = self.terminate_eventfd.read();
                    self.drain_bottom_halves();
                    self.terminated = true;
                }
                token => {
                    let fd = token as RawFd;
                    if let Some(handler) = self.handlers.get_mut(&fd) {
                        handler(ev.event_set());
                    }
                }
            }
        }

        if self.terminated {
            Ok(RunOutcome::Terminated)
        } else {
            Ok(RunOutcome::MoreWork)
        }
    }

    fn drain_bottom_halves(&mut self) {
        loop {
            let next = self.bh_queue.lock().expect("bh queue poisoned").pop_front();
            match next {
                Some(f) => f(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn scheduled_bottom_half_runs_on_next_pass() {
        let mut ev = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ev.schedule_oneshot(Box::new(move || ran2.store(true, Ordering::SeqCst))).unwrap();

        let outcome = ev.run(1000).unwrap();
        assert_eq!(outcome, RunOutcome::MoreWork);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn registered_fd_handler_fires_on_readiness() {
        let mut ev = EventLoop::new().unwrap();
        let fd = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        ev.register_fd(
            fd.as_raw_fd(),
            EventSet::IN,
            Box::new(move |_events| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        fd.write(1).unwrap();
        ev.run(1000).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        ev.unregister_fd(fd.as_raw_fd()).unwrap();
    }

    #[test]
    fn terminate_is_idempotent_and_drains_pending_work_first() {
        let mut ev = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ev.schedule_oneshot(Box::new(move || ran2.store(true, Ordering::SeqCst))).unwrap();
        ev.terminate().unwrap();
        ev.terminate().unwrap();

        let outcome = ev.run(1000).unwrap();
        assert_eq!(outcome, RunOutcome::Terminated);
        assert!(ran.load(Ordering::SeqCst));

        // idempotent: a terminated loop keeps returning Terminated.
        assert_eq!(ev.run(0).unwrap(), RunOutcome::Terminated);
    }
}
