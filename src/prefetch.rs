//! Software prefetch hints used to overlap cuckoo slot fetches.
//!
//! Both candidate slots of a lookup are prefetched before the tag check so
//! the two (usually independent) cache misses are in flight at the same
//! time. A prefetch is a performance hint only; it never has a functional
//! effect and is safe to issue for any address.

/// Hint that `ptr` is about to be read; fetch it into all cache levels.
#[inline(always)]
pub(crate) fn prefetch_read<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: _mm_prefetch is a hint and never faults, even for
        // invalid addresses.
        unsafe {
            std::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), std::arch::x86_64::_MM_HINT_T0);
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: same as above; _prefetch never faults.
        unsafe {
            std::arch::aarch64::_prefetch(
                ptr.cast::<i8>(),
                std::arch::aarch64::_PREFETCH_READ,
                std::arch::aarch64::_PREFETCH_LOCALITY3,
            );
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = ptr;
    }
}
