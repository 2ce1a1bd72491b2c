//! The push-based input-stream contract (C4, `spec.md` §4.4/§5).
//!
//! Grounded in `examples/ThomasHabets-rustradio/src/stream.rs`'s
//! `ReadStream`/`WriteStream` partial-consumption backpressure idea
//! (`consume()`/`produce()` retain whatever the reader didn't take), but
//! generalized from a circular sample buffer to the spec's push/callback
//! model: `read(callback, user_data, cancel)` registers a single consumer,
//! and the delivered callback returns how many of the delivered bytes it
//! consumed. Unconsumed bytes are retained and re-delivered, concatenated
//! with the next arrival, exactly as `spec.md` §4.4 describes.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;

use log::{debug, trace};

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::event_loop::EventLoop;

/// One delivery to a registered stream consumer.
pub enum StreamEvent<'a> {
    /// A chunk of bytes. Never empty unless `complete` is also true.
    Data(&'a [u8]),
    /// A terminal error. Always delivered with `complete = true`.
    Err(&'a Error),
}

/// `(user_data, data, complete) -> n_used` from `spec.md` §4.4. `user_data`
/// is folded into the closure's capture rather than passed explicitly,
/// since Rust closures close over their environment instead of carrying an
/// opaque `void*`.
pub type ReadCallback = Box<dyn FnMut(StreamEvent, bool) -> usize>;

/// The input-stream capability.
pub trait InputStream {
    /// Register the single consumer of this stream.
    ///
    /// # Panics
    /// If a consumer is already registered (`spec.md` §4.4: "registers the
    /// single consumer, asserting no prior registration").
    fn read(self: Rc<Self>, cancel: CancellationToken, callback: ReadCallback);

    /// Drain any bytes already buffered, without waiting for more to
    /// arrive. The default implementation is a no-op; streams that buffer
    /// ahead of registration (like [`WritableInputStream`]) override it.
    fn check_buffer(&self) {}
}

/// Shared backpressure engine used by every concrete [`InputStream`] in
/// this crate: retains whatever tail the consumer didn't consume, checks
/// the consumer's cancel before every delivery, and enforces the
/// single-registration and post-completion invariants.
#[derive(Default)]
struct Delivery {
    callback: RefCell<Option<ReadCallback>>,
    cancel: RefCell<Option<CancellationToken>>,
    tail: RefCell<Vec<u8>>,
    tail_complete: Cell<bool>,
    done: Cell<bool>,
    registered: Cell<bool>,
}

impl Delivery {
    fn register(&self, cancel: CancellationToken, callback: ReadCallback) {
        assert!(
            !self.registered.get(),
            "InputStream::read called more than once"
        );
        self.registered.set(true);
        *self.cancel.borrow_mut() = Some(cancel);
        *self.callback.borrow_mut() = Some(callback);
        self.flush_tail();
    }

    /// Deliver bytes buffered by [`Self::push_data`] before a consumer
    /// registered. A no-op if nothing is buffered or no consumer is
    /// registered yet.
    fn flush_tail(&self) {
        if self.done.get() || self.callback.borrow().is_none() {
            return;
        }
        let buffered = self.tail.borrow().clone();
        let complete = self.tail_complete.get();
        if buffered.is_empty() && !complete {
            return;
        }
        self.tail.borrow_mut().clear();
        self.tail_complete.set(false);
        self.push_data(&buffered, complete);
    }

    fn consumer_cancelled(&self) -> bool {
        self.cancel
            .borrow()
            .as_ref()
            .map(|c| c.is_cancelled())
            .unwrap_or(false)
    }

    /// Push new bytes. Returns how many bytes of `data` (not counting any
    /// retained tail) were consumed — the contract
    /// [`WritableInputStream::write`] needs.
    fn push_data(&self, data: &[u8], complete: bool) -> usize {
        if self.done.get() || self.consumer_cancelled() {
            self.done.set(true);
            *self.callback.borrow_mut() = None;
            return 0;
        }
        let tail_len_before = self.tail.borrow().len();
        let mut full = self.tail.borrow().clone();
        full.extend_from_slice(data);

        let used = {
            let mut cb_slot = self.callback.borrow_mut();
            match cb_slot.as_mut() {
                Some(cb) => cb(StreamEvent::Data(&full), complete),
                // No consumer registered yet: buffer for later (push model
                // still allows producers to run ahead of `read()`).
                None => {
                    drop(cb_slot);
                    *self.tail.borrow_mut() = full;
                    if complete {
                        self.tail_complete.set(true);
                    }
                    return data.len();
                }
            }
        };

        if complete {
            self.done.set(true);
            *self.callback.borrow_mut() = None;
            *self.tail.borrow_mut() = Vec::new();
        } else {
            let used = used.min(full.len());
            *self.tail.borrow_mut() = full[used..].to_vec();
        }
        used.saturating_sub(tail_len_before).min(data.len())
    }

    fn push_error(&self, err: &Error) {
        if self.done.get() {
            return;
        }
        self.done.set(true);
        if let Some(mut cb) = self.callback.borrow_mut().take() {
            if !self.consumer_cancelled() {
                cb(StreamEvent::Err(err), true);
            }
        }
    }
}

/// An in-memory input stream: delivers a fixed buffer whole, with
/// `complete = true`, the first time a consumer registers (and drives
/// itself eagerly, so [`InputStream::check_buffer`] is unnecessary).
pub struct MemoryInputStream {
    data: Vec<u8>,
    delivery: Delivery,
}

impl MemoryInputStream {
    /// Wrap a fixed in-memory buffer.
    pub fn new(data: Vec<u8>) -> Rc<Self> {
        Rc::new(Self {
            data,
            delivery: Delivery::default(),
        })
    }
}

impl InputStream for MemoryInputStream {
    fn read(self: Rc<Self>, cancel: CancellationToken, callback: ReadCallback) {
        self.delivery.register(cancel, callback);
        self.delivery.push_data(&self.data, true);
    }
}

/// An input stream whose bytes are *pushed* by a producer
/// (`spec.md` §4.4 "Writable input stream"), used to bridge two
/// input-stream consumers — e.g. gzip forwarding DEFLATE-compressed bytes
/// into a DEFLATE decoder.
#[derive(Default)]
pub struct WritableInputStream {
    delivery: Delivery,
}

impl WritableInputStream {
    /// A stream with nothing written to it yet.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Push more bytes (or the terminal `complete` signal) into the stream.
    /// Immediately invokes the registered consumer's callback and returns
    /// how many of `data`'s bytes it consumed.
    pub fn write(&self, data: &[u8], complete: bool) -> usize {
        self.delivery.push_data(data, complete)
    }

    /// Push a terminal error.
    pub fn write_error(&self, err: &Error) {
        self.delivery.push_error(err);
    }
}

impl InputStream for WritableInputStream {
    fn read(self: Rc<Self>, cancel: CancellationToken, callback: ReadCallback) {
        self.delivery.register(cancel, callback);
    }

    fn check_buffer(&self) {
        self.delivery.flush_tail();
    }
}

/// An input stream fed by a raw, already-open, non-blocking file
/// descriptor, watched through an [`EventLoop`] read watch.
pub struct FdInputStream {
    fd: RawFd,
    delivery: Rc<Delivery>,
    event_loop: Rc<EventLoop>,
}

impl FdInputStream {
    /// Wrap `fd` (assumed already set non-blocking by the caller) for
    /// reading via `event_loop`.
    pub fn new(fd: RawFd, event_loop: Rc<EventLoop>) -> Rc<Self> {
        Rc::new(Self {
            fd,
            delivery: Rc::new(Delivery::default()),
            event_loop,
        })
    }
}

impl InputStream for FdInputStream {
    fn read(self: Rc<Self>, cancel: CancellationToken, callback: ReadCallback) {
        self.delivery.register(cancel.clone(), callback);
        let delivery = self.delivery.clone();
        let fd = self.fd;
        self.event_loop.add_read_watch(fd, cancel, move || {
            let mut buf = [0u8; 65536];
            // SAFETY: `buf` is a valid buffer of its stated length; `fd` is
            // owned by this stream for the lifetime of the watch.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                delivery.push_error(&Error::Io(std::io::Error::last_os_error().to_string()));
            } else if n == 0 {
                delivery.push_data(&[], true);
            } else {
                trace!("fd {fd}: read {n} bytes");
                delivery.push_data(&buf[..n as usize], false);
            }
        });
    }
}

/// Buffers internally until `complete = true`, then delivers once
/// (`spec.md` §4.4 "Read-all adapter").
pub fn read_all(
    stream: Rc<dyn InputStream>,
    cancel: CancellationToken,
    on_done: impl FnOnce(std::result::Result<Vec<u8>, Error>) + 'static,
) {
    let buf: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let on_done = RefCell::new(Some(on_done));
    stream.read(
        cancel,
        Box::new(move |event, complete| match event {
            StreamEvent::Data(data) => {
                buf.borrow_mut().extend_from_slice(data);
                let n = data.len();
                if complete {
                    if let Some(f) = on_done.borrow_mut().take() {
                        f(Ok(std::mem::take(&mut buf.borrow_mut())));
                    }
                }
                n
            }
            StreamEvent::Err(err) => {
                if let Some(f) = on_done.borrow_mut().take() {
                    f(Err(err.clone()));
                }
                0
            }
        }),
    );
}

/// Drives `event_loop` to completion of a single read and returns either
/// the fully received buffer or the terminal error (`spec.md` §4.4
/// "Synchronous adapter"). Used only by tests and tools, never by library
/// internals, matching the spec's restriction.
pub fn read_all_sync(
    stream: Rc<dyn InputStream>,
    event_loop: &EventLoop,
) -> std::result::Result<Vec<u8>, Error> {
    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    read_all(stream, CancellationToken::new(), move |r| {
        *result2.borrow_mut() = Some(r);
    });
    while result.borrow().is_none() {
        event_loop.run_one();
    }
    debug!("read_all_sync: stream complete");
    result.borrow_mut().take().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_delivers_whole_buffer_complete() {
        let s = MemoryInputStream::new(vec![1, 2, 3]);
        let got: Rc<RefCell<Option<(Vec<u8>, bool)>>> = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        s.read(
            CancellationToken::new(),
            Box::new(move |event, complete| {
                if let StreamEvent::Data(d) = event {
                    *got2.borrow_mut() = Some((d.to_vec(), complete));
                    d.len()
                } else {
                    0
                }
            }),
        );
        let (data, complete) = got.borrow().clone().unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert!(complete);
    }

    #[test]
    fn partial_consumption_retains_tail() {
        let ws = WritableInputStream::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        ws.clone().read(
            CancellationToken::new(),
            Box::new(move |event, _complete| {
                if let StreamEvent::Data(d) = event {
                    seen2.borrow_mut().push(d.to_vec());
                    // Consume only the first byte each time.
                    1
                } else {
                    0
                }
            }),
        );
        let used1 = ws.write(&[1, 2, 3], false);
        assert_eq!(used1, 1, "only first byte consumed, rest retained");
        let used2 = ws.write(&[4], false);
        assert_eq!(used2, 1);
        let calls = seen.borrow();
        assert_eq!(calls[0], vec![1, 2, 3]);
        assert_eq!(calls[1], vec![2, 3, 4]); // retained tail + new byte
    }

    #[test]
    fn complete_ignores_n_used_and_is_terminal() {
        let ws = WritableInputStream::new();
        let complete_seen = Rc::new(Cell::new(false));
        let cs = complete_seen.clone();
        ws.clone().read(
            CancellationToken::new(),
            Box::new(move |_event, complete| {
                cs.set(complete);
                0 // n_used ignored when complete
            }),
        );
        ws.write(&[1, 2], true);
        assert!(complete_seen.get());
    }

    #[test]
    #[should_panic(expected = "called more than once")]
    fn double_registration_panics() {
        let s = MemoryInputStream::new(vec![1]);
        s.clone().read(CancellationToken::new(), Box::new(|_, _| 0));
        s.read(CancellationToken::new(), Box::new(|_, _| 0));
    }

    #[test]
    fn cancel_before_delivery_suppresses_callback() {
        let ws = WritableInputStream::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let called = Rc::new(Cell::new(false));
        let c2 = called.clone();
        ws.clone().read(
            cancel,
            Box::new(move |_, _| {
                c2.set(true);
                0
            }),
        );
        ws.write(&[1, 2, 3], false);
        assert!(!called.get());
    }

    #[test]
    fn read_all_sync_drains_memory_stream() {
        let el = EventLoop::new();
        let s = MemoryInputStream::new(vec![9, 9, 9]);
        let got = read_all_sync(s, &el).unwrap();
        assert_eq!(got, vec![9, 9, 9]);
    }
}
