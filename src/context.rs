use crate::domain::Domain;
use crate::sync::atomic::AtomicPtr;
use alloc::boxed::Box;
use core::sync::atomic::Ordering;

/// A per-thread handle onto a [`Domain`]: `S` reserved hazard-pointer slots
/// plus a bounded buffer of `R` retired pointers.
///
/// Publishing a pointer into one of the slots forbids the domain from
/// reclaiming it until the slot is cleared. The local buffer amortises
/// reclamation: a full scan of the domain's hazard pointers runs at most
/// once per `R` retirements.
///
/// A context is owned by exactly one thread. Other threads only ever read
/// its slots, through the domain's snapshot.
pub struct HazardContext<'domain, T, const S: usize, const R: usize> {
    domain: &'domain Domain<T>,
    slots: &'domain [AtomicPtr<u8>],
    deleted: [*mut T; R],
    del_index: usize,
}

// Safety: moving a context to another thread moves ownership of its retire
// buffer, whose `T`s may then be dropped there.
unsafe impl<T: Send, const S: usize, const R: usize> Send for HazardContext<'_, T, S, R> {}

impl<'domain, T, const S: usize, const R: usize> HazardContext<'domain, T, S, R> {
    pub fn new(domain: &'domain Domain<T>) -> Self {
        assert!(S > 0 && R > 0);
        let slots = domain.reserve(S);
        debug_assert_eq!(slots.len(), S);
        Self {
            domain,
            slots,
            deleted: [core::ptr::null_mut(); R],
            del_index: 0,
        }
    }

    /// Publishes `ptr` in slot `i`, protecting it from reclamation, and
    /// returns it.
    ///
    /// The store is a release; callers that go on to dereference the pointer
    /// must revalidate their source after a `SeqCst` fence, since the
    /// object may have been retired before the publication became visible.
    pub fn publish(&self, i: usize, ptr: *mut T) -> *mut T {
        self.slots[i].store(ptr.cast(), Ordering::Release);
        ptr
    }

    /// Clears slot `i`.
    pub fn clear(&self, i: usize) {
        self.slots[i].store(core::ptr::null_mut(), Ordering::Release);
    }

    /// The pointer currently published in slot `i`.
    pub fn at(&self, i: usize) -> *mut T {
        self.slots[i].load(Ordering::Relaxed).cast()
    }

    /// Hands `ptr` to this context for eventual destruction.
    ///
    /// When the local buffer fills up, [`reclaim`](Self::reclaim) runs
    /// automatically.
    ///
    /// # Safety
    ///
    /// 1. `ptr` came from `Box::into_raw` and has not been retired since.
    /// 2. `ptr` is unreachable for new readers; only threads that already
    ///    protect it may still dereference it.
    pub unsafe fn retire(&mut self, ptr: *mut T) {
        debug_assert!(self.del_index < R);
        self.deleted[self.del_index] = ptr;
        self.del_index += 1;
        if self.del_index == R {
            self.reclaim();
        }
    }

    /// Frees every locally retired object no hazard pointer protects, and
    /// compacts the survivors to the front of the buffer.
    ///
    /// If nothing could be freed from a full buffer, the whole buffer is
    /// handed to the domain's shared delete list instead.
    ///
    /// Returns the number of objects freed.
    pub fn reclaim(&mut self) -> usize {
        let snap = self.domain.snapshot();
        let mut kept = 0;
        let mut reclaimed = 0;
        for i in 0..self.del_index {
            let ptr = self.deleted[i];
            if snap.search(ptr.cast()) {
                self.deleted[kept] = ptr;
                kept += 1;
            } else {
                // Safety: the retire contract says ptr came from a Box and
                // is retired at most once; the snapshot proves no hazard
                // pointer protects it.
                drop(unsafe { Box::from_raw(ptr) });
                reclaimed += 1;
            }
        }
        for slot in &mut self.deleted[kept..self.del_index] {
            *slot = core::ptr::null_mut();
        }
        self.del_index = kept;

        if kept == R {
            // Every entry is still protected; let the domain try later.
            // Safety: entries satisfy the retire contract, forwarded here.
            unsafe { self.domain.retire_all(&mut self.deleted) };
            self.del_index = 0;
        }
        reclaimed
    }
}

impl<T, const S: usize, const R: usize> Drop for HazardContext<'_, T, S, R> {
    fn drop(&mut self) {
        // Release zeroes the slots as it returns them to the chunk.
        self.domain.release(self.slots);
        // Safety: buffered entries still satisfy the retire contract.
        unsafe {
            self.domain.retire_all(&mut self.deleted[..self.del_index]);
        }
        self.domain.collect();
    }
}
