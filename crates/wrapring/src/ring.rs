use crate::invariants::{debug_assert_bounded_len, debug_assert_contiguous};
use crate::RingError;
use std::cell::UnsafeCell;

// =============================================================================
// OWNERSHIP & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// A `RingBuffer<T>` is a fixed, power-of-two-sized allocation addressed by
// unbounded u64 cursors. It is deliberately *not* a channel: it has no head
// or tail of its own. The surrounding protocol owns the cursors and with
// them the slots:
//
// - A producer may write slots in `[written, acked + size)` and then
//   publish an advanced `written` cursor (with Release semantics, via a
//   mutex or an atomic owned by the protocol).
// - A consumer may read slots in `[acked, written)` and then publish an
//   advanced `acked` cursor back.
//
// Because the slot ranges of the two sides are disjoint at every point
// where both hold published cursor values, the unsynchronized accesses
// below are free of data races *under the protocol*. The buffer cannot
// check this; the debug assertions only catch wrap and length mistakes.
//
// `T: Copy` keeps slot reuse trivial: overwriting a slot never needs a
// drop, so recycling a region is a plain cursor update.
//
// =============================================================================

/// Power-of-two sized typed buffer with wrap-around addressing.
///
/// The slot for cursor `n` is `n & size_mask()`. The buffer never
/// reallocates; all element slots are zero-initialized at construction.
pub struct RingBuffer<T> {
    size_exp: u32,
    buffer: UnsafeCell<Box<[T]>>,
}

// SAFETY: all concurrent access is delimited by the cursor protocol
// described above; the buffer itself is an inert allocation.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// Creates a buffer of `2^size_exp` zero-initialized elements.
    pub fn new(size_exp: u32) -> Result<Self, RingError> {
        if size_exp >= 48 {
            return Err(RingError::SizeExpOutOfRange(size_exp));
        }
        let capacity = 1usize << size_exp;
        let buffer = vec![T::default(); capacity].into_boxed_slice();
        Ok(Self {
            size_exp,
            buffer: UnsafeCell::new(buffer),
        })
    }

    /// Creates a buffer with at least `minimum_size` elements.
    ///
    /// Rounds up to the next power of two. Used for bookkeeping rings whose
    /// size is derived from other buffers (e.g. the acknowledgement window).
    pub fn with_minimum_size(minimum_size: usize) -> Result<Self, RingError> {
        let size_exp = usize::BITS - minimum_size.saturating_sub(1).leading_zeros();
        Self::new(size_exp)
    }
}

impl<T> RingBuffer<T> {
    // ---------------------------------------------------------------------
    // GEOMETRY
    // ---------------------------------------------------------------------

    /// Returns the element count (always a power of two).
    #[inline]
    pub fn size(&self) -> usize {
        1usize << self.size_exp
    }

    /// Returns the size exponent.
    #[inline]
    pub fn size_exp(&self) -> u32 {
        self.size_exp
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.size() * std::mem::size_of::<T>()
    }

    /// Returns the index mask, `size() - 1`.
    #[inline]
    pub fn size_mask(&self) -> u64 {
        (self.size() as u64) - 1
    }

    /// Returns the base pointer of the allocation.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        // SAFETY: only the pointer is formed here; no access happens.
        unsafe { (*self.buffer.get()).as_ptr() }
    }

    // ---------------------------------------------------------------------
    // SLOT ACCESS
    // ---------------------------------------------------------------------

    /// Returns a shared reference to the slot for cursor `n`.
    ///
    /// # Safety contract (checked by the protocol, not the buffer)
    ///
    /// The caller must hold cursor ownership of the slot: no other thread
    /// may be writing it concurrently.
    #[inline]
    pub fn at(&self, n: u64) -> &T {
        let idx = (n & self.size_mask()) as usize;
        // SAFETY: idx is in bounds by masking; concurrent writers are
        // excluded by the cursor protocol (see module header).
        unsafe { &(*self.buffer.get())[idx] }
    }

    /// Writes the slot for cursor `n`.
    ///
    /// # Safety contract
    ///
    /// The caller must be the unique writer of this slot (producer side of
    /// the cursor protocol).
    #[inline]
    pub fn write_at(&self, n: u64, value: T) {
        let idx = (n & self.size_mask()) as usize;
        // SAFETY: idx is in bounds by masking; unique writership is
        // guaranteed by the cursor protocol.
        unsafe {
            (*self.buffer.get())[idx] = value;
        }
    }

    /// Returns a contiguous shared slice of `len` slots starting at `n`.
    ///
    /// The region must not cross the wrap point; callers split crossing
    /// regions into two slices (`contiguous_len` gives the cut).
    #[inline]
    pub fn slice(&self, n: u64, len: usize) -> &[T] {
        debug_assert_bounded_len!(len, self.size());
        debug_assert_contiguous!(n, len, self.size());
        let idx = (n & self.size_mask()) as usize;
        // SAFETY: bounds hold by the assertions above; concurrent writers
        // are excluded by the cursor protocol.
        unsafe { &(&*self.buffer.get())[idx..idx + len] }
    }

    /// Copies `src` into the slots starting at cursor `n`.
    ///
    /// The region must not cross the wrap point.
    #[inline]
    pub fn copy_in(&self, n: u64, src: &[T])
    where
        T: Copy,
    {
        debug_assert_bounded_len!(src.len(), self.size());
        debug_assert_contiguous!(n, src.len(), self.size());
        let idx = (n & self.size_mask()) as usize;
        // SAFETY: bounds hold by the assertions above; unique writership is
        // guaranteed by the cursor protocol.
        unsafe {
            (&mut *self.buffer.get())[idx..idx + src.len()].copy_from_slice(src);
        }
    }

    /// Copies `src` into the slots starting at cursor `n`, splitting the
    /// copy around the wrap point as needed.
    #[inline]
    pub fn copy_in_wrapping(&self, n: u64, src: &[T])
    where
        T: Copy,
    {
        let first = src.len().min(self.contiguous_len(n));
        self.copy_in(n, &src[..first]);
        if first < src.len() {
            self.copy_in(n + first as u64, &src[first..]);
        }
    }

    /// Number of slots from cursor `n` to the wrap point.
    ///
    /// An access of at most this many elements is contiguous.
    #[inline]
    pub fn contiguous_len(&self, n: u64) -> usize {
        self.size() - ((n & self.size_mask()) as usize)
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size_exp", &self.size_exp)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let ring = RingBuffer::<u64>::new(4).unwrap();
        assert_eq!(ring.size(), 16);
        assert_eq!(ring.bytes(), 128);
        assert_eq!(ring.size_mask(), 15);
    }

    #[test]
    fn test_size_exp_out_of_range() {
        assert!(matches!(
            RingBuffer::<u64>::new(48),
            Err(RingError::SizeExpOutOfRange(48))
        ));
    }

    #[test]
    fn test_wrap_around_addressing() {
        let ring = RingBuffer::<u64>::new(3).unwrap(); // 8 slots
        for n in 0..24u64 {
            ring.write_at(n, n * 10);
            assert_eq!(*ring.at(n), n * 10);
        }
        // cursor 23 landed in slot 7
        assert_eq!(*ring.at(7), 230);
    }

    #[test]
    fn test_with_minimum_size_rounds_up() {
        let ring = RingBuffer::<u64>::with_minimum_size(9).unwrap();
        assert_eq!(ring.size(), 16);
        let exact = RingBuffer::<u64>::with_minimum_size(8).unwrap();
        assert_eq!(exact.size(), 8);
    }

    #[test]
    fn test_slice_and_copy_in() {
        let ring = RingBuffer::<u8>::new(4).unwrap(); // 16 slots
        ring.copy_in(12, &[1, 2, 3, 4]);
        assert_eq!(ring.slice(12, 4), &[1, 2, 3, 4]);
        // next pass reuses the same slots
        ring.copy_in(28, &[9, 9, 9, 9]);
        assert_eq!(ring.slice(12, 4), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_copy_in_wrapping_splits() {
        let ring = RingBuffer::<u8>::new(3).unwrap(); // 8 slots
        ring.copy_in_wrapping(6, &[1, 2, 3, 4]);
        assert_eq!(ring.slice(6, 2), &[1, 2]);
        assert_eq!(ring.slice(8, 2), &[3, 4]);
    }

    #[test]
    fn test_contiguous_len() {
        let ring = RingBuffer::<u8>::new(4).unwrap();
        assert_eq!(ring.contiguous_len(0), 16);
        assert_eq!(ring.contiguous_len(13), 3);
        assert_eq!(ring.contiguous_len(16), 16);
    }

    #[test]
    fn test_zero_initialized() {
        let ring = RingBuffer::<u64>::new(5).unwrap();
        for n in 0..ring.size() as u64 {
            assert_eq!(*ring.at(n), 0);
        }
    }
}
