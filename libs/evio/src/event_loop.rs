// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod pump;
mod registry;

use crate::clock::Clock;
use crate::error::Error;
use crate::mailbox::{LoopState, Mailbox};
use crate::scheduler::Scheduler;
use crate::sys::Selector;
use crate::task::{Task, TaskStatus};
use crate::wake::WakePipe;
use bitflags::bitflags;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::ptr;
use registry::HandleRecord;
use static_assertions::assert_impl_all;
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;

bitflags! {
    /// Readiness bits delivered to I/O event callbacks, also used to request
    /// a subscription's directions.
    ///
    /// Every backend exposes this same set, so user code ports across
    /// platforms unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// The peer hung up; delivered together with whatever data is still
        /// buffered.
        const CLOSED = 1 << 2;
        /// Delivered alone: either the kernel flagged the handle, or its
        /// registration failed.
        const ERROR = 1 << 3;
    }
}

/// Callback invoked on the worker thread whenever a subscribed handle has
/// I/O events. Receives the loop's handle, the ready descriptor, and the
/// coalesced [`EventFlags`] for this pump iteration.
pub type OnEvent = Box<dyn FnMut(&LoopHandle, RawFd, EventFlags) + Send>;

/// The capability set of an event loop backend.
///
/// Every kernel-backed implementation (epoll, kqueue, ...) exposes exactly
/// these operations, so higher layers hold a `dyn EventLoop` and never know
/// which kernel interface is underneath.
///
/// An event loop owns one worker thread. Callbacks and tasks execute on that
/// thread and must not block: the loop is cooperatively scheduled,
/// alternating between one kernel wait and in-process work.
pub trait EventLoop: Send + Sync {
    /// Launches the worker thread.
    ///
    /// The loop must be in the ready state: freshly constructed, or stopped
    /// and joined. `run` is a single-caller operation; in particular,
    /// calling [`stop`](Self::stop) concurrently with `run` may lose the
    /// stop request.
    fn run(&self) -> Result<(), Error>;

    /// Requests the worker to stop. Safe from any thread, any number of
    /// times; the worker drains its mailbox once more and exits at the top
    /// of its next iteration.
    fn stop(&self);

    /// Waits for the worker to exit, then returns the loop to the ready
    /// state so it can be run again.
    ///
    /// Calling this without a prior [`stop`](Self::stop) waits forever.
    fn join(&self) -> Result<(), Error>;

    /// Runs `task` on the worker as soon as possible.
    ///
    /// From the worker thread itself the task goes straight into the
    /// scheduler and runs before the worker next returns to the kernel;
    /// from any other thread it is posted through the mailbox. Tasks posted
    /// from a single thread run in submission order; tasks posted from
    /// different threads have no relative order.
    fn schedule_now(&self, task: Task);

    /// Runs `task` on the worker at `run_at_nanos` (in the loop clock's
    /// monotonic nanoseconds).
    fn schedule_at(&self, task: Task, run_at_nanos: u64);

    /// Starts delivering I/O events for `fd` to `on_event`.
    ///
    /// `events` must request [`READABLE`](EventFlags::READABLE),
    /// [`WRITABLE`](EventFlags::WRITABLE), or both. The registration itself
    /// happens on the worker thread; if it fails there, `on_event` is
    /// invoked exactly once with [`ERROR`](EventFlags::ERROR) and never
    /// again. A handle may be subscribed at most once at a time, and every
    /// subscription must eventually be balanced by exactly one
    /// [`unsubscribe_from_io_events`](Self::unsubscribe_from_io_events)
    /// before the loop is destroyed.
    fn subscribe_to_io_events(
        &self,
        fd: RawFd,
        events: EventFlags,
        on_event: OnEvent,
    ) -> Result<(), Error>;

    /// Stops event delivery for `fd` and releases its bookkeeping.
    ///
    /// Once the deregistration has run on the worker there are no further
    /// callbacks for the handle. Calling this from inside the handle's own
    /// callback is allowed.
    fn unsubscribe_from_io_events(&self, fd: RawFd) -> Result<(), Error>;

    /// True iff the calling thread is this loop's worker thread.
    fn is_on_loop_thread(&self) -> bool;

    /// A cheap cloneable handle exposing the cross-thread operations.
    fn handle(&self) -> LoopHandle;
}

/// Constructs the platform's default event loop backend.
pub fn new_default(clock: Clock) -> Result<KernelEventLoop, Error> {
    KernelEventLoop::new(clock)
}

/// An event loop multiplexing kernel readiness notifications and a
/// time-ordered task queue on one dedicated worker thread.
///
/// Loops are fully independent of each other; a process typically runs one
/// per shard. Dropping the loop destroys it: the worker is stopped and
/// joined, and every task that never got to run is delivered once with
/// [`TaskStatus::Canceled`].
pub struct KernelEventLoop {
    inner: Arc<Inner>,
}

/// A cheap cloneable reference to a [`KernelEventLoop`], exposing the
/// operations that are safe from any thread. This is what I/O callbacks
/// receive, and what submitter threads keep.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<Inner>,
}

assert_impl_all!(KernelEventLoop: Send, Sync);
assert_impl_all!(LoopHandle: Send, Sync);

struct Inner {
    selector: Selector,
    wake: WakePipe,
    mailbox: Mailbox,
    clock: Clock,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    thread_data: ThreadDataCell,
}

/// State only the worker thread may touch while the loop is running.
struct ThreadData {
    scheduler: Scheduler,
    registry: HashMap<RawFd, HandleRecord>,
    /// Subscribes that have run minus unsubscribes that have run. Must be 0
    /// by the time the loop is destroyed.
    connected_handle_count: isize,
    /// The worker's private copy of the lifecycle state; the mailbox holds
    /// the externally-visible copy.
    state: LoopState,
}

struct ThreadDataCell(UnsafeCell<ThreadData>);

// Safety: `ThreadData` is only ever accessed by the worker thread while the
// loop is running, or by a thread with exclusive access while the worker is
// unstarted or already joined. `Inner::with_thread_data` documents this
// contract; there is no concurrent access to synchronize.
unsafe impl Sync for ThreadDataCell {}

thread_local! {
    /// Identity of the loop (if any) whose worker is the current thread.
    static CURRENT_LOOP: Cell<*const ()> = const { Cell::new(ptr::null()) };
}

/// Marks the current thread as the worker of `inner` until the guard drops.
struct Enter;

fn enter(inner: &Arc<Inner>) -> Enter {
    CURRENT_LOOP.set(Arc::as_ptr(inner).cast());
    Enter
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT_LOOP.set(ptr::null());
    }
}

// === impl KernelEventLoop ===

impl KernelEventLoop {
    pub fn new(clock: Clock) -> Result<Self, Error> {
        let selector = Selector::new()?;
        let wake = WakePipe::open()?;
        selector.add_wake(wake.read_fd())?;

        Ok(Self {
            inner: Arc::new(Inner {
                selector,
                wake,
                mailbox: Mailbox::new(),
                clock,
                worker: Mutex::new(None),
                thread_data: ThreadDataCell(UnsafeCell::new(ThreadData {
                    scheduler: Scheduler::new(),
                    registry: HashMap::new(),
                    connected_handle_count: 0,
                    state: LoopState::Ready,
                })),
            }),
        })
    }
}

impl EventLoop for KernelEventLoop {
    fn run(&self) -> Result<(), Error> {
        Inner::run(&self.inner)
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn join(&self) -> Result<(), Error> {
        self.inner.join()
    }

    fn schedule_now(&self, task: Task) {
        self.inner.schedule(task, 0);
    }

    fn schedule_at(&self, task: Task, run_at_nanos: u64) {
        self.inner.schedule(task, run_at_nanos);
    }

    fn subscribe_to_io_events(
        &self,
        fd: RawFd,
        events: EventFlags,
        on_event: OnEvent,
    ) -> Result<(), Error> {
        Inner::subscribe(&self.inner, fd, events, on_event)
    }

    fn unsubscribe_from_io_events(&self, fd: RawFd) -> Result<(), Error> {
        Inner::unsubscribe(&self.inner, fd)
    }

    fn is_on_loop_thread(&self) -> bool {
        self.inner.is_worker_thread()
    }

    fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for KernelEventLoop {
    fn drop(&mut self) {
        self.inner.stop();

        let joiner = self.inner.worker.lock().unwrap().take();
        if let Some(joiner) = joiner {
            if joiner.join().is_err() {
                tracing::error!("worker thread panicked, destroying the loop anyway");
            }
            self.inner.mailbox.set_state(LoopState::Ready);
            // Safety: the worker has been joined.
            unsafe { self.inner.with_thread_data(|td| td.state = LoopState::Ready) };
        }

        // Cancel scheduler tasks first: a canceled task may schedule further
        // tasks, and from this (non-worker) thread those land in the
        // mailbox, which is drained to a fixed point below.
        // Safety: the worker is unstarted or joined.
        let tasks = unsafe { self.inner.with_thread_data(|td| td.scheduler.drain_all()) };
        for task in tasks {
            task.run(TaskStatus::Canceled);
        }

        let mut pending = VecDeque::new();
        loop {
            self.inner.mailbox.drain(&mut pending);
            if pending.is_empty() {
                break;
            }
            for task in pending.drain(..) {
                task.run(TaskStatus::Canceled);
            }
        }

        // Safety: as above.
        unsafe {
            self.inner.with_thread_data(|td| {
                debug_assert_eq!(
                    td.connected_handle_count, 0,
                    "event loop destroyed with subscribed handles still attached"
                );
                td.registry.clear();
            });
        }
    }
}

impl fmt::Debug for KernelEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelEventLoop")
            .field("clock", &self.inner.clock)
            .field("state", &self.inner.mailbox.state())
            .finish_non_exhaustive()
    }
}

// === impl LoopHandle ===

impl LoopHandle {
    pub fn schedule_now(&self, task: Task) {
        self.inner.schedule(task, 0);
    }

    pub fn schedule_at(&self, task: Task, run_at_nanos: u64) {
        self.inner.schedule(task, run_at_nanos);
    }

    pub fn subscribe_to_io_events(
        &self,
        fd: RawFd,
        events: EventFlags,
        on_event: OnEvent,
    ) -> Result<(), Error> {
        Inner::subscribe(&self.inner, fd, events, on_event)
    }

    pub fn unsubscribe_from_io_events(&self, fd: RawFd) -> Result<(), Error> {
        Inner::unsubscribe(&self.inner, fd)
    }

    /// See [`EventLoop::stop`].
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_on_loop_thread(&self) -> bool {
        self.inner.is_worker_thread()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

// === impl Inner ===

impl Inner {
    fn is_worker_thread(&self) -> bool {
        CURRENT_LOOP.get() == ptr::from_ref(self).cast()
    }

    /// Gives `f` access to the worker-private state.
    ///
    /// # Safety
    ///
    /// The caller must either be the worker thread while the loop is
    /// running, or have exclusive access because the worker is unstarted or
    /// already joined. `f` must not call back into user code: callbacks and
    /// tasks run outside this scope so they can re-enter the loop's API.
    unsafe fn with_thread_data<R>(&self, f: impl FnOnce(&mut ThreadData) -> R) -> R {
        // Safety: exclusivity is the caller's contract, see above.
        f(unsafe { &mut *self.thread_data.0.get() })
    }

    fn run(this: &Arc<Self>) -> Result<(), Error> {
        if this.mailbox.state() != LoopState::Ready {
            return Err(Error::AlreadyRunning);
        }

        // The worker isn't alive in the ready state, so this store can't
        // race it; it must happen before the spawn so the worker's first
        // drain can already observe a stop request.
        this.mailbox.set_state(LoopState::Running);

        let inner = Arc::clone(this);
        let spawned = thread::Builder::new()
            .name("evio-loop".into())
            .spawn(move || pump::worker_main(&inner));

        match spawned {
            Ok(joiner) => {
                *this.worker.lock().unwrap() = Some(joiner);
                Ok(())
            }
            Err(err) => {
                this.mailbox.set_state(LoopState::Ready);
                Err(Error::Io(err))
            }
        }
    }

    fn stop(&self) {
        if self.mailbox.request_stop() {
            self.wake.signal();
        }
    }

    fn join(&self) -> Result<(), Error> {
        debug_assert_ne!(
            self.mailbox.state(),
            LoopState::Running,
            "stop() must be called before join()"
        );

        let joiner = self.worker.lock().unwrap().take().ok_or(Error::NotRunning)?;
        joiner.join().map_err(|_| Error::WorkerPanicked)?;

        self.mailbox.set_state(LoopState::Ready);
        // Safety: the worker has been joined.
        unsafe { self.with_thread_data(|td| td.state = LoopState::Ready) };
        Ok(())
    }

    fn schedule(&self, mut task: Task, run_at_nanos: u64) {
        // On the worker thread the scheduler is ours to touch; everything
        // else goes through the mailbox.
        if self.is_worker_thread() {
            // Safety: this is the worker thread.
            unsafe {
                self.with_thread_data(|td| match run_at_nanos {
                    0 => td.scheduler.schedule_now(task),
                    at => td.scheduler.schedule_at(task, at),
                });
            }
            return;
        }

        task.set_run_at_nanos(run_at_nanos);
        if self.mailbox.post(task) {
            self.wake.signal();
        }
    }

    fn subscribe(
        this: &Arc<Self>,
        fd: RawFd,
        events: EventFlags,
        on_event: OnEvent,
    ) -> Result<(), Error> {
        let interest = events & (EventFlags::READABLE | EventFlags::WRITABLE);
        if interest.is_empty() {
            return Err(Error::EmptySubscription);
        }

        // The actual multiplexer mutation is deferred to the worker: the
        // kernel wants one registration per direction, and rolling back a
        // half-failed pair races event delivery unless it happens on the
        // thread that also dispatches events.
        let record = HandleRecord::new(fd, interest, on_event);
        let inner = Arc::clone(this);
        this.schedule(
            Task::new(move |status| registry::subscribe_task(&inner, record, status))
                .named("subscribe"),
            0,
        );
        Ok(())
    }

    fn unsubscribe(this: &Arc<Self>, fd: RawFd) -> Result<(), Error> {
        let inner = Arc::clone(this);
        this.schedule(
            Task::new(move |status| registry::unsubscribe_task(&inner, fd, status))
                .named("unsubscribe"),
            0,
        );
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::wake::WakePipe;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    const RECV_DEADLINE: Duration = Duration::from_secs(5);

    fn new_loop() -> KernelEventLoop {
        KernelEventLoop::new(Clock::monotonic()).unwrap()
    }

    fn write_bytes(fd: RawFd, bytes: &[u8]) {
        // Safety: `bytes` is a valid buffer for the call's duration.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, isize::try_from(bytes.len()).unwrap());
    }

    fn drain_fd(fd: RawFd) {
        let mut scratch = [0u8; 64];
        loop {
            // Safety: `scratch` is a valid buffer for the call's duration.
            let n = unsafe { libc::read(fd, scratch.as_mut_ptr().cast(), scratch.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    #[test]
    fn cross_thread_task_wakes_the_loop() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let ev = new_loop();
        ev.run().unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = ev.handle();
        let submitted = Instant::now();
        let submitter = thread::spawn(move || {
            handle.schedule_now(Task::new(move |status| tx.send(status).unwrap()));
        });

        // The wake channel makes delivery prompt even though the loop's
        // default kernel wait is 100 seconds.
        assert_eq!(rx.recv_timeout(RECV_DEADLINE).unwrap(), TaskStatus::Run);
        assert!(submitted.elapsed() < RECV_DEADLINE);

        submitter.join().unwrap();
        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn timed_tasks_run_in_deadline_order() {
        let clock = Clock::monotonic();
        let ev = KernelEventLoop::new(clock.clone()).unwrap();
        ev.run().unwrap();

        let (tx, rx) = mpsc::channel();
        let now = clock.now().unwrap();
        let handle = ev.handle();
        for (label, offset_ms) in [("c", 60u64), ("a", 20), ("b", 40)] {
            let tx = tx.clone();
            handle.schedule_at(
                Task::new(move |_| tx.send(label).unwrap()).named(label),
                now + offset_ms * 1_000_000,
            );
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv_timeout(RECV_DEADLINE).unwrap());
        }
        assert_eq!(order, ["a", "b", "c"]);

        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn stop_is_idempotent_across_threads() {
        let ev = new_loop();
        ev.run().unwrap();

        let stoppers: Vec<_> = (0..3)
            .map(|_| {
                let handle = ev.handle();
                thread::spawn(move || handle.stop())
            })
            .collect();
        for stopper in stoppers {
            stopper.join().unwrap();
        }
        ev.stop();
        ev.join().unwrap();

        // Back in the ready state: the loop can run again.
        ev.run().unwrap();
        let (tx, rx) = mpsc::channel();
        ev.schedule_now(Task::new(move |status| tx.send(status).unwrap()));
        assert_eq!(rx.recv_timeout(RECV_DEADLINE).unwrap(), TaskStatus::Run);
        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn run_twice_is_rejected() {
        let ev = new_loop();
        ev.run().unwrap();
        assert!(matches!(ev.run(), Err(Error::AlreadyRunning)));
        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn join_without_run_is_rejected() {
        let ev = new_loop();
        ev.stop();
        assert!(matches!(ev.join(), Err(Error::NotRunning)));
    }

    #[test]
    fn same_thread_submissions_run_in_order() {
        let ev = new_loop();
        ev.run().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..200usize {
            let order = Arc::clone(&order);
            ev.schedule_now(Task::new(move |_| order.lock().unwrap().push(i)));
        }
        let (tx, rx) = mpsc::channel();
        ev.schedule_now(Task::new(move |_| tx.send(()).unwrap()));
        rx.recv_timeout(RECV_DEADLINE).unwrap();

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..200).collect::<Vec<_>>());

        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn loop_thread_identity() {
        let ev = new_loop();
        ev.run().unwrap();
        assert!(!ev.is_on_loop_thread());

        let (tx, rx) = mpsc::channel();
        let probe = ev.handle();
        ev.schedule_now(Task::new(move |_| {
            tx.send(probe.is_on_loop_thread()).unwrap();
        }));
        assert!(rx.recv_timeout(RECV_DEADLINE).unwrap());

        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn subscription_requires_a_direction() {
        let ev = new_loop();
        let err = ev
            .subscribe_to_io_events(0, EventFlags::CLOSED, Box::new(|_, _, _| {}))
            .unwrap_err();
        assert!(matches!(err, Error::EmptySubscription));
    }

    #[test]
    fn readable_then_closed_round_trip() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let ev = new_loop();
        ev.run().unwrap();

        let WakePipe { read, write } = WakePipe::open().unwrap();
        let read_fd = read.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        ev.subscribe_to_io_events(
            read_fd,
            EventFlags::READABLE,
            Box::new(move |_, fd, flags| {
                drain_fd(fd);
                tx.send(flags).unwrap();
            }),
        )
        .unwrap();

        write_bytes(write.as_raw_fd(), b"ping");
        let flags = rx.recv_timeout(RECV_DEADLINE).unwrap();
        assert!(flags.contains(EventFlags::READABLE));
        assert!(!flags.contains(EventFlags::ERROR));

        // Closing the peer surfaces as CLOSED (with READABLE if data raced
        // in).
        drop(write);
        let deadline = Instant::now() + RECV_DEADLINE;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let flags = rx.recv_timeout(remaining).unwrap();
            if flags.contains(EventFlags::CLOSED) {
                break;
            }
        }

        ev.unsubscribe_from_io_events(read_fd).unwrap();
        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn writable_handles_report_writable() {
        let ev = new_loop();
        ev.run().unwrap();

        let WakePipe { read: _read, write } = WakePipe::open().unwrap();
        let write_fd = write.as_raw_fd();

        // An empty pipe's write end is immediately writable; unsubscribe
        // from inside the callback so the level-triggered readiness
        // quiesces.
        let (tx, rx) = mpsc::channel();
        ev.subscribe_to_io_events(
            write_fd,
            EventFlags::WRITABLE,
            Box::new(move |handle, fd, flags| {
                handle.unsubscribe_from_io_events(fd).unwrap();
                tx.send(flags).unwrap();
            }),
        )
        .unwrap();

        let flags = rx.recv_timeout(RECV_DEADLINE).unwrap();
        assert!(flags.contains(EventFlags::WRITABLE));

        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn unsubscribe_from_inside_callback_stops_delivery() {
        let ev = new_loop();
        ev.run().unwrap();

        let WakePipe { read, write } = WakePipe::open().unwrap();
        let read_fd = read.as_raw_fd();

        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let cb_hits = Arc::clone(&hits);
        ev.subscribe_to_io_events(
            read_fd,
            EventFlags::READABLE,
            Box::new(move |handle, fd, _flags| {
                cb_hits.fetch_add(1, Ordering::SeqCst);
                handle.unsubscribe_from_io_events(fd).unwrap();
                tx.send(()).unwrap();
            }),
        )
        .unwrap();

        write_bytes(write.as_raw_fd(), b"x");
        rx.recv_timeout(RECV_DEADLINE).unwrap();

        // Data arriving after the unsubscribe must not call back, even
        // though the first callback never drained the pipe.
        write_bytes(write.as_raw_fd(), b"y");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ev.stop();
        ev.join().unwrap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn failed_subscription_surfaces_as_one_error_event() {
        let ev = new_loop();
        ev.run().unwrap();

        // Epoll rejects regular files, so both requested directions fail to
        // register.
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        let fd = file.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        ev.subscribe_to_io_events(
            fd,
            EventFlags::READABLE | EventFlags::WRITABLE,
            Box::new(move |_, _, flags| tx.send(flags).unwrap()),
        )
        .unwrap();

        assert_eq!(rx.recv_timeout(RECV_DEADLINE).unwrap(), EventFlags::ERROR);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // A failed subscription still owns a record until unsubscribed.
        ev.unsubscribe_from_io_events(fd).unwrap();
        ev.stop();
        ev.join().unwrap();
    }

    #[test]
    fn destroy_cancels_every_pending_task() {
        // Never run: every submission stays pending in the mailbox.
        let ev = new_loop();

        let canceled = Arc::new(AtomicUsize::new(0));
        let handle = ev.handle();
        let counter = Arc::clone(&canceled);
        let submitter = thread::spawn(move || {
            for _ in 0..1000 {
                let counter = Arc::clone(&counter);
                handle.schedule_now(Task::new(move |status| {
                    assert_eq!(status, TaskStatus::Canceled);
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        });
        submitter.join().unwrap();

        drop(ev);
        assert_eq!(canceled.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn destroy_cancels_timed_tasks_in_the_scheduler() {
        let clock = Clock::monotonic();
        let ev = KernelEventLoop::new(clock.clone()).unwrap();
        ev.run().unwrap();

        let now = clock.now().unwrap();
        let canceled = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&canceled);
            ev.schedule_at(
                Task::new(move |status| {
                    assert_eq!(status, TaskStatus::Canceled);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                now + 60 * 1_000_000_000,
            );
        }

        // Make sure the worker has drained them into the scheduler before
        // the teardown starts.
        let (tx, rx) = mpsc::channel();
        ev.schedule_now(Task::new(move |_| tx.send(()).unwrap()));
        rx.recv_timeout(RECV_DEADLINE).unwrap();

        drop(ev);
        assert_eq!(canceled.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn canceled_tasks_may_post_more_canceled_tasks() {
        let ev = new_loop();

        let canceled = Arc::new(AtomicUsize::new(0));
        let handle = ev.handle();
        let outer_counter = Arc::clone(&canceled);
        let repost = handle.clone();
        handle.schedule_now(Task::new(move |status| {
            assert_eq!(status, TaskStatus::Canceled);
            outer_counter.fetch_add(1, Ordering::SeqCst);

            let inner_counter = Arc::clone(&outer_counter);
            repost.schedule_now(Task::new(move |status| {
                assert_eq!(status, TaskStatus::Canceled);
                inner_counter.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        // Destroy must chase the re-posted task to a fixed point.
        drop(ev);
        assert_eq!(canceled.load(Ordering::SeqCst), 2);
    }
}
