use crate::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering;

pub(crate) const MARK_BIT: usize = 1;

/// A pointer and a logical-deletion mark packed into one atomic word.
///
/// The mark lives in the least significant bit of the pointer, which requires
/// the pointee to be aligned to at least 2 bytes. Every compare-and-swap is
/// on the full word, so a CAS that expects an unmarked value fails as soon as
/// the mark is set, no matter how stale the caller's view of the address is.
pub(crate) struct MarkPtr<T> {
    inner: AtomicPtr<T>,
}

impl<T> MarkPtr<T> {
    pub(crate) fn null() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Loads the address half, with the mark masked off.
    pub(crate) fn load_ptr(&self) -> *mut T {
        without_mark_bit(self.inner.load(Ordering::Acquire))
    }

    /// Loads the full word as an `(address, mark)` pair.
    pub(crate) fn load(&self) -> (*mut T, bool) {
        let raw = self.inner.load(Ordering::Acquire);
        (without_mark_bit(raw), raw as usize & MARK_BIT != 0)
    }

    /// Stores `ptr` unmarked.
    pub(crate) fn store(&self, ptr: *mut T) {
        debug_assert_eq!(ptr as usize & MARK_BIT, 0);
        self.inner.store(ptr, Ordering::Release);
    }

    /// Replaces `(expected, unmarked)` with `(new, unmarked)`.
    pub(crate) fn cas(&self, expected: *mut T, new: *mut T) -> bool {
        debug_assert_eq!(expected as usize & MARK_BIT, 0);
        debug_assert_eq!(new as usize & MARK_BIT, 0);
        self.inner
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Replaces `(expected, unmarked)` with `(new, marked)`.
    pub(crate) fn cas_mark(&self, expected: *mut T, new: *mut T) -> bool {
        debug_assert_eq!(expected as usize & MARK_BIT, 0);
        self.inner
            .compare_exchange(
                expected,
                with_mark_bit(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

// Helpers to set and unset the mark bit without losing pointer provenance.
// See https://github.com/rust-lang/miri/issues/1993 for why the int-to-ptr
// round trip has to thread the original pointer through.
pub(crate) fn with_mark_bit<T>(ptr: *mut T) -> *mut T {
    int_to_ptr_with_provenance(ptr as usize | MARK_BIT, ptr)
}

pub(crate) fn without_mark_bit<T>(ptr: *mut T) -> *mut T {
    int_to_ptr_with_provenance(ptr as usize & !MARK_BIT, ptr)
}

fn int_to_ptr_with_provenance<T>(addr: usize, prov: *mut T) -> *mut T {
    let ptr = prov.cast::<u8>();
    ptr.wrapping_add(addr.wrapping_sub(ptr as usize)).cast()
}
