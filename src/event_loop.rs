//! The event loop (C3): monotonic-clock timers, fd read/write readiness
//! watches, and worker-thread offload with completion signalled through a
//! self-pipe.
//!
//! Grounded in `examples/original_source/src/ut-event-loop.c` for the
//! iteration algorithm (fire due timers, compute the next `poll` timeout,
//! build watch sets, wait, reap worker threads, invoke ready watches, sweep
//! cancelled ones) and in
//! `examples/ThomasHabets-rustradio/src/mtgraph.rs` for the Rust shape of
//! "one thread per unit of work plus a `CancellationToken`". Unlike the C
//! source, which keeps one loop in a process-global variable and asserts if
//! called from a second thread (`spec.md` §9's "Open questions" calls this
//! out explicitly), this `EventLoop` is an ordinary value streams, timers
//! and workers are constructed against — the Design Notes' own suggested
//! re-architecture.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use libc::{c_void, pollfd, POLLIN, POLLOUT};
use log::trace;

use crate::cancel::CancellationToken;

type TimerCallback = Box<dyn FnMut()>;
type WatchCallback = Box<dyn FnMut()>;

/// Boxed result of a worker-thread computation, type-erased because the
/// event loop (like the C source's `void*` results) doesn't know what kind
/// of work it is running.
pub type WorkerResult = Box<dyn Any + Send>;

struct TimerEntry {
    deadline: Instant,
    interval: Option<Duration>,
    cancel: CancellationToken,
    callback: TimerCallback,
}

struct FdWatch {
    fd: RawFd,
    cancel: CancellationToken,
    callback: WatchCallback,
}

struct WorkerSlot {
    pipe_read_fd: RawFd,
    pipe_write_fd: RawFd,
    join: Option<JoinHandle<()>>,
    is_alive: Box<dyn Fn() -> bool>,
    shared: Arc<Mutex<Option<WorkerResult>>>,
    result_callback: Option<Box<dyn FnOnce(WorkerResult)>>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pipe_read_fd);
            libc::close(self.pipe_write_fd);
        }
    }
}

/// A single-threaded, cooperative event loop (`spec.md` §4.3).
#[derive(Default)]
pub struct EventLoop {
    timers: RefCell<Vec<TimerEntry>>,
    read_watches: RefCell<Vec<FdWatch>>,
    write_watches: RefCell<Vec<FdWatch>>,
    workers: RefCell<Vec<WorkerSlot>>,
    complete: Cell<bool>,
    return_value: RefCell<Option<Box<dyn Any>>>,
}

impl EventLoop {
    /// A fresh, empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot timer, firing `delay` from now.
    pub fn add_delay(&self, delay: Duration, cancel: CancellationToken, callback: impl FnMut() + 'static) {
        self.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + delay,
            interval: None,
            cancel,
            callback: Box::new(callback),
        });
    }

    /// Repeating timer, firing every `interval` starting `interval` from now.
    pub fn add_timer(
        &self,
        interval: Duration,
        cancel: CancellationToken,
        callback: impl FnMut() + 'static,
    ) {
        self.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + interval,
            interval: Some(interval),
            cancel,
            callback: Box::new(callback),
        });
    }

    /// Watch `fd` for read-readiness.
    pub fn add_read_watch(&self, fd: RawFd, cancel: CancellationToken, callback: impl FnMut() + 'static) {
        self.read_watches.borrow_mut().push(FdWatch {
            fd,
            cancel,
            callback: Box::new(callback),
        });
    }

    /// Watch `fd` for write-readiness.
    pub fn add_write_watch(&self, fd: RawFd, cancel: CancellationToken, callback: impl FnMut() + 'static) {
        self.write_watches.borrow_mut().push(FdWatch {
            fd,
            cancel,
            callback: Box::new(callback),
        });
    }

    /// Run `work` on a freshly spawned OS thread. Completion is signalled
    /// via a self-pipe the loop watches; `result_callback` runs on the loop
    /// if `callback_object` is still alive (a weak reference), matching
    /// `spec.md` §4.3's `add_worker_thread`.
    pub fn add_worker_thread<T: 'static>(
        &self,
        work: impl FnOnce() -> WorkerResult + Send + 'static,
        callback_object: &std::rc::Rc<T>,
        result_callback: impl FnOnce(WorkerResult) + 'static,
    ) -> crate::Result<()> {
        let mut fds = [0i32; 2];
        // SAFETY: `fds` is a valid 2-element buffer for `pipe(2)`.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(crate::Error::Io("pipe(2) failed".into()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let weak = std::rc::Rc::downgrade(callback_object);
        let is_alive = Box::new(move || weak.upgrade().is_some());

        let shared: Arc<Mutex<Option<WorkerResult>>> = Arc::new(Mutex::new(None));
        let shared_for_thread = shared.clone();
        let join = std::thread::spawn(move || {
            let result = work();
            *shared_for_thread.lock().expect("worker result mutex poisoned") = Some(result);
            let byte = [1u8];
            // SAFETY: `write_fd` is the write end of the pipe created above
            // and is owned exclusively by this thread until this write.
            unsafe {
                libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
            }
        });

        self.workers.borrow_mut().push(WorkerSlot {
            pipe_read_fd: read_fd,
            pipe_write_fd: write_fd,
            join: Some(join),
            is_alive,
            shared,
            result_callback: Some(Box::new(result_callback)),
        });
        Ok(())
    }

    /// Stop the loop after the current iteration, yielding `value` from
    /// [`Self::run`] / [`Self::take_return_value`].
    pub fn stop_with<T: 'static>(&self, value: T) {
        self.complete.set(true);
        *self.return_value.borrow_mut() = Some(Box::new(value));
    }

    /// Stop the loop with no return value.
    pub fn stop(&self) {
        self.complete.set(true);
    }

    /// Retrieve the value passed to [`Self::stop_with`], if any and if `T`
    /// matches.
    pub fn take_return_value<T: 'static>(&self) -> Option<T> {
        self.return_value
            .borrow_mut()
            .take()
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }

    /// Run until [`Self::stop`]/[`Self::stop_with`] is called.
    pub fn run(&self) {
        while !self.complete.get() {
            self.run_one();
        }
    }

    /// Run a single iteration of the algorithm in `spec.md` §4.3.
    pub fn run_one(&self) {
        let now = Instant::now();

        // 1. Fire due or cancelled timers, earliest deadline first.
        let due = {
            let mut timers = self.timers.borrow_mut();
            timers.sort_by_key(|t| t.deadline);
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for t in timers.drain(..) {
                if t.deadline <= now || t.cancel.is_cancelled() {
                    due.push(t);
                } else {
                    remaining.push(t);
                }
            }
            *timers = remaining;
            due
        };
        for mut t in due {
            if t.cancel.is_cancelled() {
                continue;
            }
            trace!("event loop: firing timer");
            (t.callback)();
            if let Some(interval) = t.interval {
                if !t.cancel.is_cancelled() {
                    t.deadline = Instant::now() + interval;
                    self.timers.borrow_mut().push(t);
                }
            }
        }

        // 3. Remove watches whose cancel fired, then build the poll set.
        self.read_watches.borrow_mut().retain(|w| !w.cancel.is_cancelled());
        self.write_watches.borrow_mut().retain(|w| !w.cancel.is_cancelled());

        let read_watches = self.read_watches.borrow();
        let write_watches = self.write_watches.borrow();
        let workers = self.workers.borrow();

        let mut poll_fds = Vec::with_capacity(workers.len() + read_watches.len() + write_watches.len());
        for w in workers.iter() {
            poll_fds.push(pollfd {
                fd: w.pipe_read_fd,
                events: POLLIN,
                revents: 0,
            });
        }
        for w in read_watches.iter() {
            poll_fds.push(pollfd {
                fd: w.fd,
                events: POLLIN,
                revents: 0,
            });
        }
        for w in write_watches.iter() {
            poll_fds.push(pollfd {
                fd: w.fd,
                events: POLLOUT,
                revents: 0,
            });
        }
        drop(read_watches);
        drop(write_watches);
        drop(workers);

        // 2. Compute the timeout from the earliest remaining timer.
        let timeout_ms = self
            .timers
            .borrow()
            .iter()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
            .min()
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(if poll_fds.is_empty() { 0 } else { -1 });

        if !poll_fds.is_empty() || timeout_ms > 0 {
            // SAFETY: `poll_fds` is a valid, appropriately sized buffer.
            unsafe {
                libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout_ms);
            }
        } else if timeout_ms < 0 {
            // No timers and no fds: nothing left for this loop to wait on.
            self.complete.set(true);
            return;
        }

        let n_workers = self.workers.borrow().len();
        let worker_ready: Vec<bool> = (0..n_workers)
            .map(|i| poll_fds[i].revents & POLLIN != 0)
            .collect();

        // 5. Reap completed worker threads.
        let mut finished = Vec::new();
        {
            let mut workers = self.workers.borrow_mut();
            let mut i = 0;
            while i < workers.len() {
                if worker_ready[i] {
                    finished.push(workers.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for mut w in finished {
            let mut buf = [0u8; 1];
            // SAFETY: draining the one completion byte the worker wrote.
            unsafe {
                libc::read(w.pipe_read_fd, buf.as_mut_ptr() as *mut c_void, 1);
            }
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
            if (w.is_alive)() {
                if let (Some(result), Some(cb)) =
                    (w.shared.lock().expect("worker result mutex poisoned").take(), w.result_callback.take())
                {
                    cb(result);
                }
            }
        }

        // 6. Invoke ready watches whose cancel is still inactive.
        let read_offset = n_workers;
        let write_offset = read_offset + self.read_watches.borrow().len();
        let read_ready: Vec<bool> = (0..self.read_watches.borrow().len())
            .map(|i| poll_fds[read_offset + i].revents & POLLIN != 0)
            .collect();
        let write_ready: Vec<bool> = (0..self.write_watches.borrow().len())
            .map(|i| poll_fds[write_offset + i].revents & POLLOUT != 0)
            .collect();

        for (i, ready) in read_ready.iter().enumerate() {
            if *ready {
                let cancelled = self.read_watches.borrow()[i].cancel.is_cancelled();
                if !cancelled {
                    (self.read_watches.borrow_mut()[i].callback)();
                }
            }
        }
        for (i, ready) in write_ready.iter().enumerate() {
            if *ready {
                let cancelled = self.write_watches.borrow()[i].cancel.is_cancelled();
                if !cancelled {
                    (self.write_watches.borrow_mut()[i].callback)();
                }
            }
        }

        // 7. Sweep watches cancelled during the callbacks just run.
        self.read_watches.borrow_mut().retain(|w| !w.cancel.is_cancelled());
        self.write_watches.borrow_mut().retain(|w| !w.cancel.is_cancelled());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn timers_fire_in_deadline_order() {
        let el = EventLoop::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        el.add_delay(Duration::from_millis(20), CancellationToken::new(), move || {
            o2.borrow_mut().push(20);
        });
        el.add_delay(Duration::from_millis(5), CancellationToken::new(), move || {
            o1.borrow_mut().push(5);
        });
        std::thread::sleep(Duration::from_millis(25));
        el.run_one();
        assert_eq!(*order.borrow(), vec![5, 20]);
    }

    #[test]
    fn cancelling_a_timer_before_it_is_due_suppresses_it() {
        let el = EventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let cancel = CancellationToken::new();
        el.add_delay(Duration::from_millis(5), cancel.clone(), move || {
            f.set(true);
        });
        cancel.cancel();
        std::thread::sleep(Duration::from_millis(10));
        el.run_one();
        assert!(!fired.get());
    }

    #[test]
    fn timers_and_fd_watch_interleave_and_respect_cancellation() {
        // Two timers at 10ms/20ms, an fd watch that becomes readable at
        // 15ms, and cancelling the 20ms timer at 12ms: expect the order
        // [10, 15] with 20 never firing.
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let el = EventLoop::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let o10 = order.clone();
        el.add_delay(Duration::from_millis(10), CancellationToken::new(), move || {
            o10.borrow_mut().push(10);
        });

        let twenty_cancel = CancellationToken::new();
        let o20 = order.clone();
        el.add_delay(Duration::from_millis(20), twenty_cancel.clone(), move || {
            o20.borrow_mut().push(20);
        });

        let ofd = order.clone();
        el.add_read_watch(read_fd, CancellationToken::new(), move || {
            let mut buf = [0u8; 1];
            unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            ofd.borrow_mut().push(15);
        });

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            unsafe { libc::write(write_fd, [1u8].as_ptr() as *const libc::c_void, 1) };
        });

        std::thread::sleep(Duration::from_millis(12));
        twenty_cancel.cancel();

        let deadline = Instant::now() + Duration::from_millis(500);
        while order.borrow().len() < 2 && Instant::now() < deadline {
            el.run_one();
        }

        assert_eq!(*order.borrow(), vec![10, 15]);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn stop_with_value_is_retrievable() {
        let el = EventLoop::new();
        el.stop_with(42u32);
        el.run();
        assert_eq!(el.take_return_value::<u32>(), Some(42));
    }

    #[test]
    fn worker_thread_result_reaches_main_loop() {
        let el = EventLoop::new();
        let handle: Rc<()> = Rc::new(());
        let got = Rc::new(StdRefCell::new(None));
        let got2 = got.clone();
        el.add_worker_thread(
            || Box::new(7i32) as WorkerResult,
            &handle,
            move |result| {
                *got2.borrow_mut() = result.downcast::<i32>().ok().map(|b| *b);
            },
        )
        .unwrap();
        // Give the worker thread time to finish and signal its pipe.
        for _ in 0..50 {
            el.run_one();
            if got.borrow().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*got.borrow(), Some(7));
    }
}
