//! Cache-line alignment helper.
//!
//! [`CacheAligned<T>`] forces each element of an array onto its own cache
//! line so that adjacent atomics hammered by different threads (the
//! conflict-counter stripes) never share a line.

use std::ops::Deref;

/// Cache line size in bytes.
///
/// 64 bytes for x86-64 and AArch64. Over-aligning on platforms with
/// larger lines wastes a little memory but still prevents false sharing
/// on 64-byte platforms.
pub const CACHE_LINE_BYTES: usize = 64;

/// Wraps a value so it starts on a cache-line boundary and occupies a
/// whole number of cache lines.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Wrap `value` with cache-line alignment.
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwrap, returning the inner value.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::{CACHE_LINE_BYTES, CacheAligned};

    #[test]
    fn aligned_and_padded() {
        assert_eq!(std::mem::align_of::<CacheAligned<AtomicU64>>(), CACHE_LINE_BYTES);
        assert_eq!(std::mem::size_of::<CacheAligned<AtomicU64>>(), CACHE_LINE_BYTES);
    }

    #[test]
    fn array_elements_do_not_share_lines() {
        let stripes: [CacheAligned<AtomicU64>; 2] =
            [CacheAligned::new(AtomicU64::new(0)), CacheAligned::new(AtomicU64::new(0))];
        let a = std::ptr::from_ref(&stripes[0]) as usize;
        let b = std::ptr::from_ref(&stripes[1]) as usize;
        assert!(b - a >= CACHE_LINE_BYTES);
    }
}
