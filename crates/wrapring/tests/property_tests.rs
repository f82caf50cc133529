//! Property-based tests for the wrap-around addressing invariants.
//!
//! Coverage:
//! - RingBuffer<T> (owned storage)
//! - RingBufferView<T> (borrowed storage)
//!
//! Both share the cursor-addressing invariants: slot(n) == slot(n + k*size),
//! contiguous regions never cross the wrap, and writes are observable at
//! every aliased cursor value.

use proptest::prelude::*;
use wrapring::{RingBuffer, RingBufferView};

proptest! {
    /// slot addressing is periodic in the buffer size
    #[test]
    fn prop_cursor_aliasing(
        size_exp in 1u32..12,
        cursor in 0u64..1_000_000,
        laps in 1u64..8,
    ) {
        let ring = RingBuffer::<u64>::new(size_exp).unwrap();
        ring.write_at(cursor, cursor);

        let aliased = cursor + laps * ring.size() as u64;
        prop_assert_eq!(*ring.at(aliased), cursor);
    }

    /// contiguous_len never exceeds the distance to the wrap point
    #[test]
    fn prop_contiguous_len(
        size_exp in 1u32..12,
        cursor in 0u64..1_000_000,
    ) {
        let ring = RingBuffer::<u8>::new(size_exp).unwrap();
        let n = ring.contiguous_len(cursor);
        prop_assert!(n >= 1);
        prop_assert!(n <= ring.size());
        // a slice of exactly n elements is representable
        let _ = ring.slice(cursor, n);
    }

    /// copy_in / slice round-trips across many passes of the ring
    #[test]
    fn prop_copy_roundtrip(
        size_exp in 2u32..10,
        start in 0u64..100_000,
        data in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let ring = RingBuffer::<u8>::new(size_exp).unwrap();
        // split around the wrap as the fabric does
        let first = data.len().min(ring.contiguous_len(start));
        ring.copy_in(start, &data[..first]);
        if first < data.len() && data.len() <= ring.size() {
            ring.copy_in(start + first as u64, &data[first..]);
            prop_assert_eq!(ring.slice(start + first as u64, data.len() - first),
                            &data[first..]);
        }
        prop_assert_eq!(ring.slice(start, first.min(data.len())), &data[..first]);
    }

    /// a view over owned storage behaves exactly like the owning buffer
    #[test]
    fn prop_view_matches_buffer(
        size_exp in 1u32..10,
        cursor in 0u64..100_000,
        value in any::<u64>(),
    ) {
        let ring = RingBuffer::<u64>::new(size_exp).unwrap();
        // SAFETY: ring outlives the view and has 2^size_exp elements.
        let view = unsafe {
            RingBufferView::new(ring.as_ptr().cast_mut(), size_exp)
        }.unwrap();

        view.write_at(cursor, value);
        prop_assert_eq!(*ring.at(cursor), value);
        prop_assert_eq!(view.size_mask(), ring.size_mask());
    }
}
