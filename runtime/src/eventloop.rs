//! The single cooperative scheduler: multiplexes registered file
//! descriptors, the monotonic [`Timer`], and a lock-free delayed-callback
//! queue through one `mio::Poll` wait per iteration.
//!
//! The original's self-pipe cancellation mechanism and hand-rolled
//! dual-head delayed-callback FIFO are replaced by `mio::Waker` (mio 0.8's
//! built-in cross-thread wakeup, itself a self-pipe/eventfd under the hood)
//! and `crossbeam_queue::SegQueue` respectively — both are the idiomatic
//! Rust equivalents of the same mechanisms.

use crate::timer::{Timer, INFINITE_DEADLINE};
use crossbeam_queue::SegQueue;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transport_support::time::{now_monotonic, DateTime};

pub type FdCallback = Box<dyn FnMut(EventMask) + Send>;

/// A deferred action run once fd dispatch for the current iteration has
/// fully unwound. Takes `&mut EventLoop` so it can register/deregister fds
/// — something an `FdCallback` cannot safely do mid-dispatch, since the
/// loop already holds the callback slot it's invoking from.
pub type DelayedCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Readiness mask delivered to a registered fd's callback. `error` also
/// covers end-of-stream, per the "errors and EOF both map to ERR" rule.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EventMask {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Opaque handle to a file descriptor registered with an [`EventLoop`],
/// returned by [`EventLoop::register_fd`] and required by
/// `reregister_fd`/`deregister_fd`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FdToken(Token);

const WAKER_TOKEN: Token = Token(usize::MAX);

/// A `Send` handle that can cancel a running [`EventLoop`] from another
/// thread, standing in for writing a byte to the original's self-pipe.
#[derive(Clone)]
pub struct Canceller {
    waker: Arc<Waker>,
    cancelled: Arc<AtomicBool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// A cloneable, `Send` handle that lets code without a borrow of the
/// `EventLoop` itself (e.g. an `FdCallback`'s captured state) schedule a
/// delayed callback onto it.
#[derive(Clone)]
pub struct EventLoopHandle {
    delayed: Arc<SegQueue<DelayedCallback>>,
    waker: Arc<Waker>,
}

impl EventLoopHandle {
    pub fn schedule<F: FnOnce(&mut EventLoop) + Send + 'static>(&self, callback: F) {
        self.delayed.push(Box::new(callback));
        let _ = self.waker.wake();
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    cancelled: Arc<AtomicBool>,
    sources: Slab<FdCallback>,
    timer: Timer,
    delayed: Arc<SegQueue<DelayedCallback>>,
    running: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(1024),
            waker,
            cancelled: Arc::new(AtomicBool::new(false)),
            sources: Slab::new(),
            timer: Timer::new(),
            delayed: Arc::new(SegQueue::new()),
            running: false,
        })
    }

    /// A cloneable handle usable from inside `FdCallback` closures to
    /// schedule deferred, loop-mutating work (fd registration, teardown).
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle { delayed: Arc::clone(&self.delayed), waker: Arc::clone(&self.waker) }
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Registers `source` for `interest`, returning a token to pass to
    /// `reregister_fd`/`deregister_fd`. `callback` is invoked at most once
    /// per `run_iterate` with the fd's readiness mask.
    pub fn register_fd<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        interest: Interest,
        callback: FdCallback,
    ) -> io::Result<FdToken> {
        let slot = self.sources.insert(callback);
        let token = Token(slot);
        if let Err(e) = self.poll.registry().register(source, token, interest) {
            self.sources.remove(slot);
            return Err(e);
        }
        Ok(FdToken(token))
    }

    pub fn reregister_fd<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: FdToken,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token.0, interest)
    }

    /// Deregisters `source` from the poll set and frees its callback slot.
    /// Safe to call more than once for the same token.
    pub fn deregister_fd<S: Source + ?Sized>(&mut self, source: &mut S, token: FdToken) -> io::Result<()> {
        let result = self.poll.registry().deregister(source);
        self.sources.try_remove((token.0).0);
        result
    }

    /// Enqueues `callback` to run after the current iteration's fd dispatch
    /// has unwound, and wakes a blocked `run_iterate` so it runs promptly.
    pub fn schedule_delayed<F: FnOnce(&mut EventLoop) + Send + 'static>(&self, callback: F) {
        self.delayed.push(Box::new(callback));
        let _ = self.waker.wake();
    }

    /// A cloneable, `Send` handle for cancelling this loop's `run` from
    /// another thread.
    pub fn canceller(&self) -> Canceller {
        Canceller { waker: Arc::clone(&self.waker), cancelled: Arc::clone(&self.cancelled) }
    }

    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// One cooperative iteration: wait, dispatch ready fds, fire due
    /// timers, drain delayed callbacks, and return the new next-deadline.
    pub fn run_iterate(&mut self, blocking: bool) -> DateTime {
        let now = now_monotonic();
        let deadline = self.timer.next_deadline_at(now);

        let timeout = if !blocking {
            Some(Duration::from_millis(0))
        } else if deadline == INFINITE_DEADLINE {
            None
        } else {
            let remaining_ticks = (deadline - now).max(0) as u64;
            Some(Duration::from_micros(remaining_ticks / 10))
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => {}
        }

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let mask = EventMask {
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error() || event.is_read_closed() || event.is_write_closed(),
            };
            if let Some(callback) = self.sources.get_mut(token.0) {
                callback(mask);
            }
        }

        let now = now_monotonic();
        self.timer.process(now);

        while let Some(callback) = self.delayed.pop() {
            callback(self);
        }

        self.timer.next_deadline_at(now_monotonic())
    }

    /// Keeps calling `run_iterate` until `cancel()` is observed. Not
    /// required by embedders that drive `run_iterate` themselves alongside
    /// other event sources.
    pub fn run(&mut self, blocking: bool) {
        assert!(!self.running, "EventLoop::run is not reentrant");
        self.running = true;
        self.cancelled.store(false, Ordering::SeqCst);
        while !self.cancelled.load(Ordering::SeqCst) {
            self.run_iterate(blocking);
        }
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn delayed_callbacks_run_after_the_iteration_that_scheduled_them() {
        let mut event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_cb = Arc::clone(&ran);
        event_loop.schedule_delayed(move |_event_loop| ran_cb.store(true, Ordering::SeqCst));

        event_loop.run_iterate(false);

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn run_iterate_fires_due_timers() {
        let mut event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        event_loop.timer().add_timed(move || fired_cb.store(true, Ordering::SeqCst), 0);

        event_loop.run_iterate(false);

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn non_blocking_iterate_does_not_wait_for_a_future_timer() {
        let mut event_loop = EventLoop::new().unwrap();
        let now = now_monotonic();
        event_loop.timer().add_timed(|| {}, now + 10_000_000_000);

        let started = std::time::Instant::now();
        event_loop.run_iterate(false);
        assert!(started.elapsed() < StdDuration::from_millis(200));
    }

    #[test]
    fn registering_a_listener_delivers_a_readable_event_on_connect() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = Arc::new(Mutex::new(false));
        let accepted_cb = Arc::clone(&accepted);
        event_loop
            .register_fd(
                &mut listener,
                Interest::READABLE,
                Box::new(move |mask| {
                    if mask.readable {
                        *accepted_cb.lock().unwrap() = true;
                    }
                }),
            )
            .unwrap();

        let _client = TcpStream::connect(addr).unwrap();

        // Retry a few times: connect() is async and the listener may not
        // be readable on the very first poll.
        for _ in 0..20 {
            event_loop.run_iterate(false);
            if *accepted.lock().unwrap() {
                break;
            }
            thread::sleep(StdDuration::from_millis(10));
        }

        assert!(*accepted.lock().unwrap());
    }

    #[test]
    fn cancel_from_another_thread_stops_a_blocking_run() {
        let event_loop = Arc::new(Mutex::new(EventLoop::new().unwrap()));
        let canceller = event_loop.lock().unwrap().canceller();

        let runner = Arc::clone(&event_loop);
        let handle = thread::spawn(move || {
            runner.lock().unwrap().run(true);
        });

        // Give the runner a moment to enter its blocking wait, then cancel it.
        thread::sleep(StdDuration::from_millis(50));
        canceller.cancel();

        handle.join().unwrap();
    }

    #[test]
    fn handle_schedules_a_delayed_callback_from_outside_a_borrow_of_the_loop() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_cb = Arc::clone(&ran);

        // Simulates an FdCallback, which only has a handle, not `&mut EventLoop`.
        handle.schedule(move |_event_loop| ran_cb.store(true, Ordering::SeqCst));

        event_loop.run_iterate(false);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn run_can_be_called_again_after_returning() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.cancel();
        event_loop.run(false);
        event_loop.cancel();
        event_loop.run(false);
    }
}
