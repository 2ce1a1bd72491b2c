#![warn(missing_docs)]
/*! A reference-counted object/capability runtime paired with a small
cooperative event loop and a handful of incremental, streaming codecs.

It's heavily inspired by [RustRadio][rustradio], except instead of wiring
DSP blocks together over sample streams, the blocks here are: an object
heap with capability lookup, a single-threaded event loop (timers, fd
readiness, worker-thread offload), push-based byte streams with
partial-consumption backpressure, and three codecs built on top of that
stream contract — BER-encoded ASN.1, gzip/zlib (DEFLATE), and baseline
JPEG.

# Architecture overview

Everything in this crate is designed to run on one cooperative
[`event_loop::EventLoop`], on one OS thread. Long-running work (decoding a
large stream, a CPU-bound transform) either happens incrementally across
many small steps driven by the loop, or is handed to
[`event_loop::EventLoop::add_worker_thread`] and reported back through the
loop's self-pipe, rather than blocking the thread the loop runs on.

A typical pipeline looks like:

```text
[ stream::InputStream ] -> [ gzip::GzipDecoder ] -> [ asn1::BerDecoder ]
```

or

```text
[ stream::InputStream ] -> [ jpeg::JpegDecoder ] -> [ jpeg::Image ]
```

Decoders consume an [`stream::InputStream`] and either forward decoded
bytes on to another stream consumer (gzip, zlib) or terminate in an owned
value (the ASN.1 decoder's parsed values, the JPEG decoder's
[`jpeg::Image`]).

# Object model

[`capability::Capabilities`] and [`capability::CapabilityId`] provide the
capability-lookup half of `spec.md`'s object heap (`spec.md` §3/§4.1); the
refcount-and-teardown half is just `Rc`/`Weak`, which already has the
right semantics, so nothing is hand-rolled for that part. See
[`capability`] for the full rationale.

# Links

* Main repo (teacher project): <https://github.com/ThomasHabets/rustradio>

[rustradio]: https://github.com/ThomasHabets/rustradio
 */

pub mod asn1;
pub mod bitreader;
pub mod cancel;
pub mod capability;
pub mod containers;
pub mod error;
pub mod event_loop;
pub mod gzip;
pub mod jpeg;
pub mod stream;

pub use error::{Error, Result};
