//! Shared ring storage for the parking MPSC queue.
//!
//! Slots hold raw payload pointers; a null slot is empty. The slot itself is
//! the only synchronization medium for the handoff: producers publish with a
//! release store, the consumer takes with an acquire load and clears with a
//! relaxed store.
//!
//! Memory layout:
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ ring pointer + immutable geometry (read-only after alloc)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ tail (cache-line padded) — producer reservation sequence    │
//! ├─────────────────────────────────────────────────────────────┤
//! │ head_published (padded) — consumer progress, coarse cadence │
//! ├─────────────────────────────────────────────────────────────┤
//! │ draining (padded) — back-pressure hysteresis flag           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ park (padded) — futex cell for the sleeping consumer        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ lifecycle: ref_count, sender_count, receiver_disconnected   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sequence numbers are logical positions, not slot indices: position `i`
//! lives in slot `(i * STEP) & (capacity - 1)`. The stride is odd, hence
//! coprime to the power-of-two capacity, so one revolution visits every slot
//! exactly once — and wide enough that positions `i` and `i + 1` land on
//! different cache lines.

use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::park::Futex;

use super::Config;

/// Stride between successive sequence numbers in slot-index space.
pub(crate) const STEP: u64 = 9;

// The stride must be odd to reach every slot, and must span more than one
// cache line worth of slot entries.
const _: () = assert!(STEP % 2 == 1);
const _: () = assert!(STEP as usize * std::mem::size_of::<AtomicPtr<()>>() > 64);

/// Maps a sequence number to its slot index.
#[inline]
pub(crate) fn slot_index(seq: u64, cap_mask: u64) -> usize {
    (seq.wrapping_mul(STEP) & cap_mask) as usize
}

/// The backing storage shared by all handles of one queue.
///
/// Allocated once, reference-counted by the handles, freed when the last
/// handle goes. Payload referents are never owned and never freed here.
#[repr(C)]
pub(crate) struct RingBuffer<T> {
    // === Read-mostly: slot array and immutable geometry ===
    ring: *mut AtomicPtr<T>,
    cap_mask: u64,
    capacity: u64,
    low_water: u64,
    high_water: u64,
    max_producers: usize,
    spin_limit: u32,
    publish_interval: u32,

    // === Hot fields, one cache line each ===
    /// Producer reservation sequence.
    tail: CachePadded<AtomicU64>,
    /// Consumer progress as last published; a stale lower bound on the real
    /// head between publications.
    head_published: CachePadded<AtomicU64>,
    /// Set once the backlog crosses `high_water`, cleared once it falls back
    /// under `low_water`. While clear, producers skip the admission check.
    draining: CachePadded<AtomicBool>,
    /// Park cell: 1 while the consumer intends to sleep or is sleeping.
    pub(crate) park: CachePadded<Futex>,

    // === Cold: lifecycle ===
    ref_count: AtomicUsize,
    sender_count: AtomicUsize,
    receiver_disconnected: AtomicBool,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Allocates and initializes the shared state.
    ///
    /// Initial ref_count is 2 (one sender + one receiver).
    ///
    /// # Panics
    ///
    /// Panics if the configured geometry is unusable; see [`Config`].
    pub(crate) fn allocate(config: Config) -> NonNull<Self> {
        assert!(
            config.capacity_log2 <= 28,
            "capacity_log2 must be at most 28"
        );
        assert!(config.max_producers >= 1, "max_producers must be at least 1");

        let capacity = 1u64 << config.capacity_log2;
        assert!(
            (config.max_producers as u64) * 4 < capacity,
            "capacity must exceed four times max_producers"
        );
        assert!(
            config.publish_interval >= 1,
            "publish_interval must be non-zero"
        );

        let low_water = capacity / 4;
        let high_water = capacity / 4 * 3;
        // A stale head_published lags the head by at most one interval; the
        // clamp keeps that lag under low_water so an idle, empty queue can
        // never be refused into a stall.
        let publish_interval = config.publish_interval.min(low_water as u32);

        // Vec guarantees alignment for the slot array; freed by reversing
        // this in release().
        let ring =
            ManuallyDrop::new(Vec::<AtomicPtr<T>>::with_capacity(capacity as usize)).as_mut_ptr();
        for i in 0..capacity as usize {
            unsafe { ring.add(i).write(AtomicPtr::new(ptr::null_mut())) };
        }

        let rb = Box::new(Self {
            ring,
            cap_mask: capacity - 1,
            capacity,
            low_water,
            high_water,
            max_producers: config.max_producers,
            spin_limit: config.spin_limit,
            publish_interval,
            tail: CachePadded::new(AtomicU64::new(0)),
            head_published: CachePadded::new(AtomicU64::new(0)),
            draining: CachePadded::new(AtomicBool::new(false)),
            park: CachePadded::new(Futex::new(0)),
            ref_count: AtomicUsize::new(2),
            sender_count: AtomicUsize::new(1),
            receiver_disconnected: AtomicBool::new(false),
        });

        unsafe { NonNull::new_unchecked(Box::into_raw(rb)) }
    }

    // === Accessors ===

    #[inline]
    fn slot(&self, seq: u64) -> &AtomicPtr<T> {
        unsafe { &*self.ring.add(slot_index(seq, self.cap_mask)) }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub(crate) fn max_producers(&self) -> usize {
        self.max_producers
    }

    #[inline]
    pub(crate) fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    #[inline]
    pub(crate) fn publish_interval(&self) -> u32 {
        self.publish_interval
    }

    #[inline]
    pub(crate) fn load_tail(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    // === Producer operations ===

    /// Reserves a sequence number and deposits `payload` in its slot.
    ///
    /// Returns `false` when admission refuses the push; nothing is reserved
    /// in that case. Wait-free, callable from any producer thread, does not
    /// wake the consumer.
    #[inline]
    pub(crate) fn try_push(&self, payload: NonNull<T>) -> bool {
        let draining = self.draining.load(Ordering::Relaxed);
        if draining && !self.admit() {
            return false;
        }

        let seq = self.tail.fetch_add(1, Ordering::Relaxed);
        // Pairs with the consumer's acquire load in try_take: everything the
        // producer wrote before the push is visible after the pop.
        self.slot(seq).store(payload.as_ptr(), Ordering::Release);

        if !draining {
            // The reservation itself may have crossed the high watermark;
            // the flag re-enables the admission check for everyone. A racing
            // rebase can make this backlog read wrap to a huge value, which
            // flips the flag spuriously and is undone by the next admit().
            let backlog = seq
                .wrapping_add(1)
                .wrapping_sub(self.head_published.load(Ordering::Relaxed));
            if backlog > self.high_water {
                self.draining.store(true, Ordering::Relaxed);
            }
        }
        true
    }

    /// Admission check, run only while draining: refuse past the high
    /// watermark, drop back to the unchecked path under the low watermark.
    fn admit(&self) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let backlog = tail.wrapping_sub(self.head_published.load(Ordering::Relaxed));
        if backlog > self.high_water {
            return false;
        }
        if backlog < self.low_water {
            self.draining.store(false, Ordering::Relaxed);
        }
        true
    }

    /// Producer half of the park/wake handshake.
    ///
    /// Both park-cell accesses are sequentially consistent: the total order
    /// against the consumer's publish-then-recheck is what rules out a
    /// consumer sleeping while a deposit is resident.
    #[inline]
    pub(crate) fn wake_consumer(&self) {
        if self.park.load(Ordering::SeqCst) == 1 {
            self.park.store(0, Ordering::SeqCst);
            self.park.wake_one();
        }
    }

    // === Consumer operations ===

    /// Takes the payload at position `seq` if one is resident.
    ///
    /// Must only be called by the single consumer. The cleared slot stays
    /// consumer-private until the sequence wraps a full revolution, so the
    /// null store needs no ordering.
    #[inline]
    pub(crate) fn try_take(&self, seq: u64) -> Option<NonNull<T>> {
        let slot = self.slot(seq);
        let payload = NonNull::new(slot.load(Ordering::Acquire))?;
        slot.store(ptr::null_mut(), Ordering::Relaxed);
        Some(payload)
    }

    /// True when the slot at position `seq` is unoccupied. Advisory: a
    /// producer may deposit immediately after this returns.
    #[inline]
    pub(crate) fn is_empty_at(&self, seq: u64) -> bool {
        self.slot(seq).load(Ordering::Acquire).is_null()
    }

    /// Publishes consumer progress for the admission check and rebases the
    /// sequence domain down by the largest multiple of the capacity not
    /// exceeding `head`. Returns the rebased head.
    ///
    /// The tail subtraction must precede the lowered publication: a racing
    /// admission read then sees either consistent values or an inflated
    /// (wrapped) backlog and refuses spuriously. The reverse order could
    /// deflate the backlog and admit a push onto a live slot.
    pub(crate) fn publish_head(&self, head: u64) -> u64 {
        let rebase = head & !self.cap_mask;
        if rebase != 0 {
            // A multiple of the capacity, so slot indices are unaffected.
            self.tail.fetch_sub(rebase, Ordering::Relaxed);
        }
        let head = head - rebase;
        self.head_published.store(head, Ordering::Relaxed);
        head
    }

    // === Liveness ===

    /// Registers one more live sender; returns the new count.
    #[inline]
    pub(crate) fn add_sender(&self) -> usize {
        self.sender_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Unregisters a sender; returns the previous count. Sequentially
    /// consistent so the decrement is ordered against the park-cell
    /// handshake: a consumer that parks after the last sender left still
    /// observes the disconnect.
    #[inline]
    pub(crate) fn remove_sender(&self) -> usize {
        self.sender_count.fetch_sub(1, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn sender_count(&self) -> usize {
        self.sender_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn is_receiver_disconnected(&self) -> bool {
        self.receiver_disconnected.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_receiver_disconnected(&self) {
        self.receiver_disconnected.store(true, Ordering::Release);
    }

    // === Lifecycle ===

    pub(crate) fn acquire(this: NonNull<Self>) {
        unsafe {
            this.as_ref().ref_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops one reference; frees the shared state with the last one.
    ///
    /// Payload referents still resident in slots are not owned by the queue
    /// and are deliberately left alive; only the slot array and the header
    /// are reclaimed.
    ///
    /// # Safety
    ///
    /// `this` must come from `allocate` and each reference may be released
    /// exactly once.
    pub(crate) unsafe fn release(this: NonNull<Self>) {
        let inner = unsafe { this.as_ref() };

        if inner.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            unsafe {
                let _ = Vec::from_raw_parts(inner.ring, 0, inner.capacity as usize);
                let _ = Box::from_raw(this.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity_log2: u32, max_producers: usize) -> Config {
        Config::new(capacity_log2, max_producers)
    }

    #[test]
    fn stride_map_is_a_bijection() {
        for capacity_log2 in [3u32, 4, 6, 10] {
            let capacity = 1u64 << capacity_log2;
            let mask = capacity - 1;

            let mut seen = vec![false; capacity as usize];
            for seq in 0..capacity {
                let idx = slot_index(seq, mask);
                assert!(!seen[idx], "slot {idx} visited twice");
                seen[idx] = true;
            }
            assert!(seen.iter().all(|&v| v));
        }
    }

    #[test]
    fn stride_map_ignores_rebase() {
        let mask = (1u64 << 6) - 1;
        for seq in 0..200u64 {
            assert_eq!(
                slot_index(seq, mask),
                slot_index(seq + 3 * (mask + 1), mask)
            );
        }
    }

    #[test]
    fn slots_start_empty() {
        let rb = RingBuffer::<u64>::allocate(config(4, 1));

        unsafe {
            let inner = rb.as_ref();
            for seq in 0..16 {
                assert!(inner.is_empty_at(seq));
            }

            RingBuffer::release(rb);
            RingBuffer::release(rb);
        }
    }

    #[test]
    fn watermarks_follow_capacity() {
        let rb = RingBuffer::<u64>::allocate(config(8, 2));

        unsafe {
            let inner = rb.as_ref();
            assert_eq!(inner.capacity, 256);
            assert_eq!(inner.low_water, 64);
            assert_eq!(inner.high_water, 192);
            // Requested interval (default 256) is clamped to the low
            // watermark.
            assert_eq!(inner.publish_interval, 64);

            RingBuffer::release(rb);
            RingBuffer::release(rb);
        }
    }

    #[test]
    fn rebase_keeps_raw_sequences_bounded() {
        let rb = RingBuffer::<u64>::allocate(config(4, 1));

        unsafe {
            let inner = rb.as_ref();
            let mut values: Vec<u64> = (0..10_000).collect();
            let interval = inner.publish_interval() as u64;

            let mut head = 0u64;
            let mut unpublished = 0u64;
            for value in values.iter_mut() {
                let expected = *value;
                assert!(inner.try_push(NonNull::from(&mut *value)));
                let got = inner.try_take(head).expect("deposit must be visible");
                assert_eq!(*got.as_ref(), expected);

                head += 1;
                unpublished += 1;
                if unpublished == interval {
                    unpublished = 0;
                    head = inner.publish_head(head);
                    // Rebasing at every publication pins the raw sequence
                    // values near the origin no matter how long we run.
                    assert!(head < inner.capacity);
                    assert!(inner.load_tail() < 2 * inner.capacity);
                }
            }

            RingBuffer::release(rb);
            RingBuffer::release(rb);
        }
    }

    #[test]
    fn admission_refuses_once_past_high_water() {
        let rb = RingBuffer::<u64>::allocate(config(3, 1));

        unsafe {
            let inner = rb.as_ref();
            let mut values = [0u64; 8];

            // high_water = 6: the first seven deposits are admitted (the
            // seventh crosses the watermark and flips to draining), the
            // eighth is refused.
            for (i, value) in values.iter_mut().enumerate().take(7) {
                *value = i as u64;
                assert!(inner.try_push(NonNull::from(&mut *value)), "push {i}");
            }
            assert!(!inner.try_push(NonNull::from(&mut values[7])));

            RingBuffer::release(rb);
            RingBuffer::release(rb);
        }
    }
}
