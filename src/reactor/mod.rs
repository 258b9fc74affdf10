//! The single-threaded event reactor (spec §4.1).
//!
//! A `Reactor` is an explicit, ordinarily-owned value — never a process
//! singleton (spec §9) — combining an FD registry built on [`mio::Poll`],
//! a timer heap, a child-process registry, and an end-of-loop callback
//! queue. External code drives it by calling [`Reactor::run`] (or
//! [`Reactor::run_once`] / [`Reactor::tick`] for finer control, e.g. in
//! tests).

pub mod children;
pub mod fd;
pub mod timers;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::time::Instant;
use children::{ChildRegistry, ExitStatus, Pid};
use fd::{FdReadyHandler, FdRegistry};
use timers::{TimerId, TimerQueue};

const CHILD_PIPE_TOKEN: Token = Token(0);

type LoopEndCallback = Box<dyn FnOnce(&mut Reactor)>;

/// Clone-able handle that arms a [`Reactor`]'s shutdown flag from any
/// thread, including from inside a signal handler's safe aftermath.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    fds: FdRegistry,
    timers: TimerQueue,
    children: ChildRegistry,
    loop_end: Vec<LoopEndCallback>,
    shutdown: Arc<AtomicBool>,
    running: bool,
    child_pipe_fd: RawFd,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let child_pipe_fd = children::ensure_installed();
        // The child pipe always occupies Token(0), outside `FdRegistry`'s own
        // allocator (which starts at 1); its readiness is dispatched
        // specially in `tick`, not through `FdReadyHandler`.
        poll.registry().register(
            &mut mio::unix::SourceFd(&child_pipe_fd),
            CHILD_PIPE_TOKEN,
            Interest::READABLE,
        )?;

        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            fds: FdRegistry::new(),
            timers: TimerQueue::new(),
            children: ChildRegistry::new(),
            loop_end: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: false,
            child_pipe_fd,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    // ---- FD registry -----------------------------------------------------

    pub fn register_fd(
        &mut self,
        fd: RawFd,
        handler: Rc<RefCell<dyn FdReadyHandler>>,
        interest: Interest,
    ) -> std::io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!("registering fd {fd} with reactor; interest={interest:?}");
        self.fds.register(self.poll.registry(), fd, interest, handler)
    }

    pub fn set_fd_events(&mut self, fd: RawFd, interest: Interest) -> std::io::Result<()> {
        self.fds.set_interest(self.poll.registry(), fd, interest)
    }

    pub fn enable_read(&mut self, fd: RawFd, current: Interest) -> std::io::Result<()> {
        self.set_fd_events(fd, current.add(Interest::READABLE))
    }

    pub fn enable_write(&mut self, fd: RawFd, current: Interest) -> std::io::Result<()> {
        self.set_fd_events(fd, current.add(Interest::WRITABLE))
    }

    pub fn disable_write(&mut self, fd: RawFd) -> std::io::Result<()> {
        self.set_fd_events(fd, Interest::READABLE)
    }

    /// Removes the registration and closes `fd`. After this returns, no
    /// further events for `fd` may fire even if they were already observed
    /// from `mio::Poll::poll` earlier in the current tick (spec §4.1).
    pub fn close_fd(&mut self, fd: RawFd) {
        #[cfg(feature = "log")]
        log::trace!("closing fd {fd}");
        let _ = self.fds.deregister(self.poll.registry(), fd);
        unsafe {
            libc::close(fd);
        }
    }

    // ---- Timers ------------------------------------------------------------

    pub fn start_timer(
        &mut self,
        delay: Duration,
        handler: impl FnOnce(&mut Reactor) + 'static,
    ) -> TimerId {
        self.timers.start(Instant::now(), delay, Box::new(handler))
    }

    pub fn stop_timer(&mut self, id: TimerId) -> bool {
        self.timers.stop(id)
    }

    // ---- Children ----------------------------------------------------------

    pub fn register_child(
        &mut self,
        pid: Pid,
        handler: impl FnOnce(&mut Reactor, ExitStatus) + 'static,
    ) {
        self.children.register(pid, Box::new(handler));
    }

    pub fn remove_child(&mut self, pid: Pid) -> bool {
        self.children.remove(pid)
    }

    // ---- End-of-loop ---------------------------------------------------------

    /// Registers a one-shot callback invoked after all FD/timer/child
    /// handlers have run for the current tick, and before the next OS wait
    /// (spec §4.1, §6).
    pub fn subscribe_loop_end(&mut self, handler: impl FnOnce(&mut Reactor) + 'static) {
        self.loop_end.push(Box::new(handler));
    }

    // ---- Driving the loop ------------------------------------------------

    pub fn run(&mut self) -> std::io::Result<()> {
        debug_assert!(!self.running, "Reactor::run called re-entrantly");
        self.running = true;
        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick()?;
        }
        self.running = false;
        Ok(())
    }

    pub fn run_once(&mut self) -> std::io::Result<()> {
        self.tick()
    }

    fn tick(&mut self) -> std::io::Result<()> {
        let now = Instant::now();
        let timeout = self.timers.next_delay(now);
        #[cfg(feature = "log")]
        log::trace!("reactor tick; timeout={timeout:?}");
        self.poll.poll(&mut self.events, timeout)?;

        // Step 3: look up handlers under the *current* registration, not a
        // snapshot taken before `poll`. Collecting tokens first (not
        // handlers) achieves this while sidestepping a double-borrow of
        // `self.events`.
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == CHILD_PIPE_TOKEN {
                let _ = (readable, writable);
                let reaped = self.children.drain_pipe_and_reap(self.child_pipe_fd);
                for (cb, status) in reaped {
                    cb(self, status);
                }
                continue;
            }
            let Some(fd) = self.fds.fd_for_token(token) else {
                continue; // unknown token: already removed this tick.
            };
            let Some((handler, interest)) = self.fds.handler(fd) else {
                continue; // unknown fd: silently ignored (spec §4.1).
            };
            let readable = readable && interest.is_readable();
            let writable = writable && interest.is_writable();
            handler.borrow_mut().on_ready(self, readable, writable);
        }

        // Step 4: expire timers in order, each at most once.
        let due = self.timers.expire_due(Instant::now());
        for cb in due {
            cb(self);
        }

        // Step 6: drain end-of-loop callbacks; callbacks scheduled during
        // drain are deferred to the next tick (swap in a fresh Vec first).
        let pending = std::mem::take(&mut self.loop_end);
        for cb in pending {
            cb(self);
        }

        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = self
            .poll
            .registry()
            .deregister(&mut mio::unix::SourceFd(&self.child_pipe_fd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;

    struct CountingHandler {
        count: Rc<Cell<u32>>,
    }

    impl FdReadyHandler for CountingHandler {
        fn on_ready(&mut self, _reactor: &mut Reactor, readable: bool, _writable: bool) {
            if readable {
                self.count.set(self.count.get() + 1);
            }
        }
    }

    #[test]
    fn register_then_close_same_tick_fires_nothing() {
        let mut reactor = Reactor::new().expect("reactor");
        let (r, w) = nix_pipe();
        let count = Rc::new(Cell::new(0));
        let handler = Rc::new(RefCell::new(CountingHandler { count: count.clone() }));
        reactor
            .register_fd(r.as_raw_fd(), handler, Interest::READABLE)
            .unwrap();

        // Make data available, then immediately close the fd before the
        // reactor ever polls: no handler should fire.
        {
            use std::io::Write;
            let mut w = &w;
            w.write_all(b"x").unwrap();
        }
        reactor.close_fd(r.as_raw_fd());
        std::mem::forget(r); // already closed by `close_fd`.

        reactor.run_once().unwrap();
        assert_eq!(count.get(), 0);
    }

    struct OrderHandler {
        order: Rc<RefCell<Vec<&'static str>>>,
    }

    impl FdReadyHandler for OrderHandler {
        fn on_ready(&mut self, _reactor: &mut Reactor, readable: bool, _writable: bool) {
            if readable {
                self.order.borrow_mut().push("fd");
            }
        }
    }

    #[test]
    fn fd_then_timer_then_end_of_loop_within_one_tick() {
        let mut reactor = Reactor::new().expect("reactor");
        let (r, w) = nix_pipe();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let handler = Rc::new(RefCell::new(OrderHandler { order: order.clone() }));
        reactor
            .register_fd(r.as_raw_fd(), handler, Interest::READABLE)
            .unwrap();
        {
            use std::io::Write;
            let mut w = &w;
            w.write_all(b"x").unwrap();
        }

        let timer_order = order.clone();
        reactor.start_timer(Duration::from_millis(0), move |_reactor| {
            timer_order.borrow_mut().push("timer");
        });
        // Let the zero-delay timer fall into the past before `tick` samples
        // `Instant::now()`, so it is already due on the next poll.
        std::thread::sleep(Duration::from_millis(5));

        let eol_order = order.clone();
        reactor.subscribe_loop_end(move |_reactor| {
            eol_order.borrow_mut().push("end-of-loop");
        });

        reactor.run_once().unwrap();

        assert_eq!(*order.borrow(), vec!["fd", "timer", "end-of-loop"]);
    }

    #[test]
    fn timer_fires_after_delay() {
        let mut reactor = Reactor::new().expect("reactor");
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        reactor.start_timer(Duration::from_millis(5), move |_| {
            fired2.set(true);
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !fired.get() && std::time::Instant::now() < deadline {
            reactor.run_once().unwrap();
        }
        assert!(fired.get());
    }

    fn nix_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0 as RawFd; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
            libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
            (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1]))
        }
    }
}
