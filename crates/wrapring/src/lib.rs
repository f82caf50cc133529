//! Power-of-two ring buffers with wrap-around addressing.
//!
//! The buffers in this crate never reallocate and never move. They are
//! indexed by unbounded `u64` cursors; the slot for cursor `n` is
//! `n & (size - 1)`. Callers carry the ownership protocol in cursor values
//! (a producer cursor and a consumer cursor delimit the readable region);
//! the buffer itself only provides stable, wrap-hiding access.
//!
//! Two flavors are provided:
//!
//! - [`RingBuffer<T>`] owns its storage (heap allocated, zero-initialized).
//! - [`RingBufferView<T>`] borrows externally owned storage, e.g. a named
//!   shared-memory arena mapped into several processes.
//!
//! Both assume a hard wrap: an access of `len` elements starting at cursor
//! `n` is only contiguous while `(n & mask) + len <= size`. Callers that
//! need a crossing region must split it into two accesses.

mod invariants;
mod ring;
mod view;

pub use ring::RingBuffer;
pub use view::RingBufferView;

use thiserror::Error;

/// Error types for ring construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// The requested size exponent would overflow addressing.
    #[error("size exponent {0} out of range")]
    SizeExpOutOfRange(u32),
    /// A view was constructed over a region of the wrong length.
    #[error("region length {actual} does not match 2^{size_exp} elements")]
    RegionSizeMismatch {
        /// The configured size exponent.
        size_exp: u32,
        /// The length of the supplied region in elements.
        actual: usize,
    },
}
