use crate::chunk::HazardChunk;
use crate::snapshot::HazardSnapshot;
use crate::sync::atomic::AtomicPtr;
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::sync::atomic::Ordering;

/// One entry on the deferred-deletion list: an owned pointer awaiting proof
/// that no hazard pointer protects it.
struct RetireNode<T> {
    payload: *mut T,
    next: AtomicPtr<RetireNode<T>>,
}

/// Synchronization point between hazard pointers and the writers they guard
/// against.
///
/// A domain owns a growable pool of hazard-pointer slots (a chain of
/// [`HazardChunk`]s that is only ever prepended to, and freed only when the
/// domain drops) and a deferred-deletion list of retired pointers. Readers
/// reserve slots through a [`HazardContext`](crate::HazardContext) bound to
/// the domain; writers retire unlinked objects into it; [`collect`]
/// reclaims every retired object no published hazard pointer protects.
///
/// Each data structure instance is expected to own its domain. Protection is
/// only meaningful when readers and writers go through the same domain; the
/// `&'domain` borrow held by every context makes it impossible for a context
/// to outlive its domain.
///
/// [`collect`]: Domain::collect
pub struct Domain<T> {
    pools_head: AtomicPtr<HazardChunk>,
    delete_head: AtomicPtr<RetireNode<T>>,
    _retires: PhantomData<T>,
}

// Safety: retired `T`s may be dropped from whichever thread runs collect, so
// both handing the domain to another thread and sharing it require T: Send.
unsafe impl<T: Send> Send for Domain<T> {}
unsafe impl<T: Send> Sync for Domain<T> {}

impl<T> Default for Domain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Domain<T> {
    pub fn new() -> Self {
        Self {
            pools_head: AtomicPtr::new(core::ptr::null_mut()),
            delete_head: AtomicPtr::new(core::ptr::null_mut()),
            _retires: PhantomData,
        }
    }

    /// Reserves a sub-block of `blocklen` contiguous hazard-pointer slots.
    ///
    /// Walks the chunk chain and, if no chunk can satisfy the request,
    /// prepends a new chunk sized for `blocklen` and tries again; the loop
    /// terminates because a freshly published chunk has every sub-block
    /// free and at most one reservation can race us per free sub-block.
    pub(crate) fn reserve(&self, blocklen: usize) -> &[AtomicPtr<u8>] {
        loop {
            if let Some(block) = self.pools_reserve(blocklen) {
                return block;
            }
            self.pools_new(blocklen);
        }
    }

    fn pools_reserve(&self, blocklen: usize) -> Option<&[AtomicPtr<u8>]> {
        let mut p = self.pools_head.load(Ordering::Acquire);
        while !p.is_null() {
            // Safety: chunks are never deallocated before the domain, and the
            // returned slice borrows self, so it cannot outlive the chunk.
            let chunk = unsafe { &*p };
            if let Some(block) = chunk.reserve(blocklen) {
                return Some(block);
            }
            p = chunk.next.load(Ordering::Relaxed);
        }
        None
    }

    fn pools_new(&self, blocklen: usize) {
        let chunk = Box::into_raw(Box::new(HazardChunk::new(blocklen)));
        let mut head = self.pools_head.load(Ordering::Acquire);
        loop {
            // Safety: `chunk` is unpublished until the CAS below succeeds.
            unsafe { &*chunk }.next.store(head, Ordering::Relaxed);
            match self.pools_head.compare_exchange_weak(
                head,
                chunk,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
    }

    /// Releases a sub-block handed out by [`reserve`](Self::reserve).
    pub(crate) fn release(&self, block: &[AtomicPtr<u8>]) {
        let mut p = self.pools_head.load(Ordering::Acquire);
        while !p.is_null() {
            // Safety: chunks live until the domain drops.
            let chunk = unsafe { &*p };
            if chunk.release(block) {
                return;
            }
            p = chunk.next.load(Ordering::Relaxed);
        }
        debug_assert!(false, "released a block no chunk in this domain owns");
    }

    /// Defers the destruction of `ptr` until no hazard pointer protects it.
    ///
    /// # Safety
    ///
    /// 1. `ptr` came from `Box::into_raw` and has not been retired since.
    /// 2. `ptr` is unreachable for new readers; only threads that already
    ///    protect it may still dereference it.
    pub unsafe fn retire_ptr(&self, ptr: *mut T) {
        let node = Box::into_raw(Box::new(RetireNode {
            payload: ptr,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));
        self.push_retire_node(node);
    }

    /// Retires every non-null entry of `ptrs`, nulling the entries out.
    ///
    /// # Safety
    ///
    /// Same contract as [`retire_ptr`](Self::retire_ptr) for each non-null
    /// entry.
    pub unsafe fn retire_all(&self, ptrs: &mut [*mut T]) {
        for p in ptrs {
            if !p.is_null() {
                // Safety: forwarded from our caller.
                unsafe { self.retire_ptr(*p) };
                *p = core::ptr::null_mut();
            }
        }
    }

    fn push_retire_node(&self, node: *mut RetireNode<T>) {
        let mut head = self.delete_head.load(Ordering::Acquire);
        loop {
            // Safety: `node` is owned by us until the CAS publishes it.
            unsafe { &*node }.next.store(head, Ordering::Relaxed);
            match self.delete_head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
    }

    /// Frees every retired object that no published hazard pointer protects.
    ///
    /// Returns the number of objects reclaimed. Concurrent calls are safe:
    /// each swaps the shared list out and works on its own local list,
    /// pushing survivors back when done.
    pub fn collect(&self) -> usize {
        let mut local = self.delete_head.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if local.is_null() {
            return 0;
        }

        let snap = self.snapshot();
        let mut reclaimed = 0;
        while !local.is_null() {
            // Safety: the swap above gave us exclusive ownership of every
            // node on the local list.
            let next = unsafe { &*local }.next.load(Ordering::Relaxed);
            let payload = unsafe { &*local }.payload;
            if snap.search(payload.cast()) {
                // Still protected; hand it back to the shared list.
                self.push_retire_node(local);
            } else {
                // Safety: payload came from Box::into_raw (retire contract),
                // no hazard pointer protects it, and retire-at-most-once
                // means nothing else will free it.
                drop(unsafe { Box::from_raw(payload) });
                drop(unsafe { Box::from_raw(local) });
                reclaimed += 1;
            }
            local = next;
        }
        reclaimed
    }

    pub(crate) fn snapshot(&self) -> HazardSnapshot {
        HazardSnapshot::new(self.pools_head.load(Ordering::Acquire))
    }
}

impl<T> Drop for Domain<T> {
    fn drop(&mut self) {
        // Contexts borrow the domain, so none exist any more and no hazard
        // pointer is published: this collect drains the delete list.
        self.collect();
        debug_assert!(
            self.delete_head.load(Ordering::Relaxed).is_null(),
            "delete list not empty at domain drop"
        );

        let mut p = self.pools_head.load(Ordering::Relaxed);
        while !p.is_null() {
            // Safety: we have `&mut self`; nothing else can reach the chain.
            let chunk = unsafe { Box::from_raw(p) };
            debug_assert!(
                !chunk.has_reservations(),
                "chunk still has reservations at domain drop"
            );
            p = chunk.next.load(Ordering::Relaxed);
        }
    }
}
