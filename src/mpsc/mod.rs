//! Multi-producer single-consumer queue of pointer payloads, with a
//! parking consumer.
//!
//! Producers deposit `NonNull<T>` references with a wait-free
//! [`try_send`](Sender::try_send); the single consumer pops them with
//! [`try_recv`](Receiver::try_recv) or blocks in [`recv`](Receiver::recv),
//! sleeping on a futex until a producer deposits and wakes it. The queue
//! moves the reference only; the referent stays wherever the producer put
//! it and is never touched by the queue.
//!
//! # Example
//!
//! ```
//! use std::ptr::NonNull;
//! use std::thread;
//!
//! let (tx, mut rx) = parka::mpsc::channel::<u64>(10, 2);
//!
//! let tx2 = tx.clone();
//! let producer = |tx: parka::mpsc::Sender<u64>, base: u64| {
//!     thread::spawn(move || {
//!         for i in 0..100 {
//!             let payload = NonNull::from(Box::leak(Box::new(base + i)));
//!             while tx.try_send(payload).is_err() {
//!                 std::hint::spin_loop();
//!             }
//!         }
//!     })
//! };
//! let h1 = producer(tx, 0);
//! let h2 = producer(tx2, 1000);
//!
//! let mut received = 0;
//! while received < 200 {
//!     if let Ok(payload) = rx.try_recv() {
//!         received += 1;
//!         unsafe { drop(Box::from_raw(payload.as_ptr())) };
//!     }
//! }
//!
//! h1.join().unwrap();
//! h2.join().unwrap();
//! ```
//!
//! # Ordering
//!
//! Deposits from one producer are consumed in the order they were made.
//! There is no order across producers: two racing deposits may be consumed
//! in either order, and a producer that stalls between reserving a position
//! and storing into it will stall the consumer at that position until the
//! store lands.

mod ring;

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use ring::RingBuffer;

/// Queue geometry and tuning.
///
/// The two geometry fields are load-bearing for correctness: the ring holds
/// `2^capacity_log2` slots and admission leaves room for `max_producers`
/// reserved-but-unstored positions, so the construction panics unless
/// `4 * max_producers < 2^capacity_log2` (and `capacity_log2 <= 28`).
///
/// The tuning fields only trade throughput against latency and CPU:
/// `spin_limit` is how many empty polls the consumer makes before parking,
/// `publish_interval` is how many pops it batches between publications of
/// its progress (clamped to a quarter of the capacity).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Ring size as a power of two.
    pub capacity_log2: u32,
    /// Upper bound on concurrently live senders.
    pub max_producers: usize,
    /// Empty polls before the consumer parks in [`Receiver::recv`].
    pub spin_limit: u32,
    /// Pops between publications of consumer progress.
    pub publish_interval: u32,
}

impl Config {
    /// Geometry as given, default tuning.
    pub fn new(capacity_log2: u32, max_producers: usize) -> Self {
        Self {
            capacity_log2,
            max_producers,
            spin_limit: 1000,
            publish_interval: 256,
        }
    }
}

/// Creates an MPSC queue with the given geometry and default tuning.
///
/// # Panics
///
/// Panics on unusable geometry; see [`Config`].
///
/// # Example
///
/// ```
/// use std::ptr::NonNull;
///
/// let (tx, mut rx) = parka::mpsc::channel::<u64>(4, 1);
///
/// let payload = NonNull::from(Box::leak(Box::new(42u64)));
/// tx.try_send(payload).unwrap();
///
/// let got = rx.try_recv().unwrap();
/// assert_eq!(unsafe { *got.as_ref() }, 42);
/// # unsafe { drop(Box::from_raw(got.as_ptr())) };
/// ```
pub fn channel<T>(capacity_log2: u32, max_producers: usize) -> (Sender<T>, Receiver<T>) {
    channel_with(Config::new(capacity_log2, max_producers))
}

/// Creates an MPSC queue from an explicit [`Config`].
///
/// # Panics
///
/// Panics on unusable geometry; see [`Config`].
pub fn channel_with<T>(config: Config) -> (Sender<T>, Receiver<T>) {
    let inner = RingBuffer::<T>::allocate(config);

    (
        Sender { inner },
        Receiver {
            inner,
            head: 0,
            unpublished: 0,
            sleeps: 0,
        },
    )
}

/// The producing half of the queue.
///
/// Clone it to add producers, up to the configured `max_producers`. All
/// clones share the same ring. A single `Sender` may also be shared by
/// reference across threads; either way, `max_producers` bounds the number
/// of threads pushing concurrently.
pub struct Sender<T> {
    inner: NonNull<RingBuffer<T>>,
}

// Safety: the ring synchronizes multi-producer access; a payload reference
// crosses threads, so the referent type must be Send.
unsafe impl<T: Send> Send for Sender<T> {}
unsafe impl<T: Send> Sync for Sender<T> {}

impl<T> Sender<T> {
    /// Deposits a payload reference and wakes the consumer if it is parked.
    ///
    /// Wait-free apart from at most one wake syscall. This is the variant
    /// to use when the consumer blocks in [`Receiver::recv`]; a consumer
    /// that only ever polls [`Receiver::try_recv`] can be fed with the
    /// cheaper [`try_send_quiet`](Sender::try_send_quiet).
    ///
    /// # Errors
    ///
    /// Returns [`TrySendError::Full`] when back-pressure refuses the push
    /// and [`TrySendError::Disconnected`] when it refuses and the receiver
    /// is gone. Either way the payload is handed back and the queue is
    /// unchanged.
    ///
    /// # Example
    ///
    /// ```
    /// use std::ptr::NonNull;
    /// use parka::mpsc::TrySendError;
    ///
    /// // Eight slots; admission refuses past the 3/4 watermark.
    /// let (tx, _rx) = parka::mpsc::channel::<u64>(3, 1);
    ///
    /// let values = Box::leak(Box::new([0u64; 8]));
    /// for (i, v) in values.iter_mut().enumerate().take(7) {
    ///     assert!(tx.try_send(NonNull::from(v)).is_ok(), "push {i}");
    /// }
    /// let last = NonNull::from(&mut values[7]);
    /// assert!(matches!(tx.try_send(last), Err(TrySendError::Full(_))));
    /// ```
    #[inline]
    pub fn try_send(&self, payload: NonNull<T>) -> Result<(), TrySendError<T>> {
        self.push(payload, true)
    }

    /// Deposits a payload reference without checking the park cell.
    ///
    /// Never issues a syscall. Must not be paired with a consumer that
    /// blocks in [`Receiver::recv`]: a quiet deposit can leave the consumer
    /// asleep with the item resident.
    #[inline]
    pub fn try_send_quiet(&self, payload: NonNull<T>) -> Result<(), TrySendError<T>> {
        self.push(payload, false)
    }

    #[inline]
    fn push(&self, payload: NonNull<T>, wake: bool) -> Result<(), TrySendError<T>> {
        let inner = unsafe { self.inner.as_ref() };

        if inner.try_push(payload) {
            if wake {
                inner.wake_consumer();
            }
            Ok(())
        } else if inner.is_receiver_disconnected() {
            Err(TrySendError::Disconnected(payload))
        } else {
            Err(TrySendError::Full(payload))
        }
    }

    /// Returns the number of slots in the ring.
    ///
    /// The usable backlog is smaller: admission refuses once the queue
    /// holds more than three quarters of `capacity`.
    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if the receiver has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        unsafe { self.inner.as_ref().is_receiver_disconnected() }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        let inner = unsafe { self.inner.as_ref() };
        let live = inner.add_sender();
        debug_assert!(
            live <= inner.max_producers(),
            "sender clones exceed max_producers"
        );
        RingBuffer::acquire(self.inner);

        Self { inner: self.inner }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        unsafe {
            let inner = self.inner.as_ref();
            if inner.remove_sender() == 1 {
                // Last sender out: run the producer half of the park
                // handshake so a parked consumer observes the disconnect.
                inner.wake_consumer();
            }
            RingBuffer::release(self.inner);
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// The consuming half of the queue.
///
/// There is exactly one: `Receiver` is neither `Clone` nor `Sync`, and
/// every pop takes `&mut self`.
pub struct Receiver<T> {
    inner: NonNull<RingBuffer<T>>,

    /// Next position to pop. Consumer-private.
    head: u64,
    /// Pops since the last progress publication.
    unpublished: u32,
    /// Times the consumer initiated a park.
    sleeps: u64,
}

// Safety: Receiver can move to another thread, but not be shared (not Sync).
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Takes the next payload if one is resident.
    ///
    /// Never blocks. Every `publish_interval` pops, publishes progress to
    /// the producers' admission check and rebases the sequence counters
    /// down so they never approach overflow.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] when the next position holds no
    /// payload — including when a producer has reserved the position but
    /// not yet stored into it — and [`TryRecvError::Disconnected`] once
    /// every sender is gone and the queue is drained.
    ///
    /// # Example
    ///
    /// ```
    /// use std::ptr::NonNull;
    /// use parka::mpsc::TryRecvError;
    ///
    /// let (tx, mut rx) = parka::mpsc::channel::<u32>(4, 1);
    /// assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    ///
    /// let payload = NonNull::from(Box::leak(Box::new(5u32)));
    /// tx.try_send(payload).unwrap();
    /// let got = rx.try_recv().unwrap();
    /// # unsafe { drop(Box::from_raw(got.as_ptr())) };
    ///
    /// drop(tx);
    /// assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    /// ```
    #[inline]
    pub fn try_recv(&mut self) -> Result<NonNull<T>, TryRecvError> {
        let inner = unsafe { self.inner.as_ref() };

        match inner.try_take(self.head) {
            Some(payload) => {
                self.head = self.head.wrapping_add(1);
                self.unpublished += 1;
                if self.unpublished == inner.publish_interval() {
                    self.unpublished = 0;
                    self.head = inner.publish_head(self.head);
                }
                Ok(payload)
            }
            None => self.try_recv_slow(inner),
        }
    }

    #[cold]
    fn try_recv_slow(&self, inner: &RingBuffer<T>) -> Result<NonNull<T>, TryRecvError> {
        // An empty slot with live senders, or with a reservation still in
        // flight (head behind tail), is plain Empty.
        if inner.sender_count() == 0 && self.head == inner.load_tail() {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Takes the next payload, parking on the futex until one arrives.
    ///
    /// Spins `spin_limit` times first, then publishes its intent to sleep,
    /// polls once more, and only then commits to the kernel wait. The
    /// second poll, together with the producer-side park check in
    /// [`Sender::try_send`], guarantees the consumer is never asleep while
    /// a deposit is resident.
    ///
    /// Producers feeding a blocking consumer must use the waking
    /// [`Sender::try_send`], not
    /// [`try_send_quiet`](Sender::try_send_quiet).
    ///
    /// # Errors
    ///
    /// Returns [`RecvError`] once every sender is gone and the queue is
    /// drained.
    ///
    /// # Example
    ///
    /// ```
    /// use std::ptr::NonNull;
    /// use std::thread;
    ///
    /// let (tx, mut rx) = parka::mpsc::channel::<u64>(4, 1);
    ///
    /// let handle = thread::spawn(move || {
    ///     let payload = NonNull::from(Box::leak(Box::new(9u64)));
    ///     tx.try_send(payload).unwrap();
    /// });
    ///
    /// let got = rx.recv().unwrap();
    /// assert_eq!(unsafe { *got.as_ref() }, 9);
    /// # unsafe { drop(Box::from_raw(got.as_ptr())) };
    ///
    /// // Sender dropped with the queue drained: recv reports disconnect.
    /// handle.join().unwrap();
    /// assert!(rx.recv().is_err());
    /// ```
    pub fn recv(&mut self) -> Result<NonNull<T>, RecvError> {
        let inner = unsafe { self.inner.as_ref() };

        loop {
            for _ in 0..inner.spin_limit() {
                match self.try_recv() {
                    Ok(payload) => return Ok(payload),
                    Err(TryRecvError::Disconnected) => return Err(RecvError),
                    Err(TryRecvError::Empty) => std::hint::spin_loop(),
                }
            }

            self.sleeps += 1;
            inner.park.store(1, Ordering::SeqCst);
            // Final poll between announcing the sleep and committing to it;
            // the disconnect check sits in the same window so a sender
            // dying instead of depositing is caught the same way.
            match self.try_recv() {
                Ok(payload) => {
                    inner.park.store(0, Ordering::Relaxed);
                    return Ok(payload);
                }
                Err(TryRecvError::Disconnected) => {
                    inner.park.store(0, Ordering::Relaxed);
                    return Err(RecvError);
                }
                Err(TryRecvError::Empty) => {}
            }
            inner.park.wait_if_equal(1);
            inner.park.store(0, Ordering::SeqCst);
        }
    }

    /// Pops every currently resident payload into `dispose`.
    ///
    /// Returns how many payloads were handed over. The queue never frees
    /// referents on its own — dropping the last handle leaks whatever is
    /// still resident — so run this before teardown when the references
    /// need reclaiming.
    ///
    /// # Example
    ///
    /// ```
    /// use std::ptr::NonNull;
    ///
    /// let (tx, mut rx) = parka::mpsc::channel::<u64>(4, 1);
    /// for i in 0..3u64 {
    ///     tx.try_send(NonNull::from(Box::leak(Box::new(i)))).unwrap();
    /// }
    ///
    /// let disposed = rx.drain(|p| unsafe { drop(Box::from_raw(p.as_ptr())) });
    /// assert_eq!(disposed, 3);
    /// assert!(rx.is_empty());
    /// ```
    pub fn drain<F: FnMut(NonNull<T>)>(&mut self, mut dispose: F) -> usize {
        let mut count = 0;
        while let Ok(payload) = self.try_recv() {
            dispose(payload);
            count += 1;
        }
        count
    }

    /// Advisory: `true` when the next position holds no payload.
    ///
    /// A producer may deposit immediately after this returns, so the answer
    /// is only precise enough to gate a spin-or-park decision.
    #[inline]
    pub fn is_empty(&self) -> bool {
        unsafe { self.inner.as_ref() }.is_empty_at(self.head)
    }

    /// Number of times the consumer initiated a park in
    /// [`recv`](Receiver::recv).
    #[inline]
    pub fn sleep_count(&self) -> u64 {
        self.sleeps
    }

    /// Returns the number of slots in the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.inner.as_ref().capacity() }
    }

    /// Returns `true` if every sender has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        unsafe { self.inner.as_ref().sender_count() == 0 }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        unsafe {
            self.inner.as_ref().set_receiver_disconnected();
            RingBuffer::release(self.inner);
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("disconnected", &self.is_disconnected())
            .field("sleeps", &self.sleeps)
            .finish_non_exhaustive()
    }
}

/// Error returned by [`Sender::try_send`].
///
/// Both variants hand the payload reference back to the caller.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Back-pressure refused the push.
    Full(NonNull<T>),
    /// The receiver is gone and the queue can no longer drain.
    Disconnected(NonNull<T>),
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(payload) => f.debug_tuple("Full").field(payload).finish(),
            Self::Disconnected(payload) => f.debug_tuple("Disconnected").field(payload).finish(),
        }
    }
}

impl<T> TrySendError<T> {
    /// Returns the payload that could not be sent.
    pub fn into_inner(self) -> NonNull<T> {
        match self {
            Self::Full(payload) | Self::Disconnected(payload) => payload,
        }
    }

    /// Returns `true` if this error is the `Full` variant.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Returns `true` if this error is the `Disconnected` variant.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "queue is full"),
            Self::Disconnected(_) => write!(f, "receiver disconnected"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No payload at the next position.
    Empty,
    /// Every sender has been dropped and the queue is drained.
    Disconnected,
}

impl TryRecvError {
    /// Returns `true` if this error is the `Empty` variant.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns `true` if this error is the `Disconnected` variant.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "queue is empty"),
            Self::Disconnected => write!(f, "all senders disconnected"),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// Error returned by [`Receiver::recv`]: every sender has been dropped and
/// the queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all senders disconnected")
    }
}

impl std::error::Error for RecvError {}
