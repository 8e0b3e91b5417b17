//! Bounded multi-producer single-consumer queues for pointer payloads.
//!
//! `parka` ships references between threads: producers deposit `NonNull<T>`
//! payloads into a fixed-capacity ring, and a single consumer takes them out,
//! sleeping on a kernel futex while the queue is empty. The queue transfers
//! the reference only — it never reads, copies, drops or otherwise owns the
//! referent.
//!
//! # Quick Start
//!
//! ```
//! use std::ptr::NonNull;
//!
//! let (tx, mut rx) = parka::mpsc::channel::<u64>(4, 1);
//!
//! let payload = NonNull::from(Box::leak(Box::new(7u64)));
//! tx.try_send(payload).unwrap();
//!
//! let got = rx.recv().unwrap();
//! assert_eq!(unsafe { *got.as_ref() }, 7);
//!
//! // The queue shipped the reference; the referent is still ours to free.
//! unsafe { drop(Box::from_raw(got.as_ptr())) };
//! ```
//!
//! # Design
//!
//! - Producers reserve a sequence number with a single `fetch_add` and
//!   publish into a slot chosen by a cache-line-striding index map, so the
//!   fast path is wait-free and adjacent deposits never share a line.
//! - Back-pressure is a watermark check against a coarsely published copy of
//!   the consumer's progress; while the queue is comfortably below the low
//!   watermark, producers skip the check entirely.
//! - The consumer spins briefly on empty, then parks on a futex. The
//!   publish-then-recheck handshake on the park cell guarantees a depositing
//!   producer either sees the parked flag and wakes the consumer, or the
//!   consumer's final pre-sleep poll sees the deposit.
//!
//! Ordering across producers is not guaranteed — two racing producers may be
//! consumed in either order. Deposits from a single producer are consumed in
//! the order they were made.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod mpsc;
mod park;
