use crate::chunk::HazardChunk;
use crate::mark::without_mark_bit;
use crate::sync::atomic;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

/// An immutable view of every hazard pointer published in a domain at one
/// moment in time.
///
/// The view over-approximates what is protected: a pointer published after
/// the copy began may be missed, but such a pointer can only reference an
/// object whose retirement had not yet been enqueued when it was published
/// (publication precedes dereference precedes any later retire), so the
/// missed pointer cannot refer to anything in the collect pass that built
/// this snapshot.
pub(crate) struct HazardSnapshot {
    ptrs: Vec<*mut u8>,
    begin: usize,
}

impl HazardSnapshot {
    /// Builds a snapshot from a chunk chain head loaded once by the caller.
    ///
    /// Chunks prepended after that load are of no interest: slots in them
    /// cannot protect anything already on the caller's retire list.
    pub(crate) fn new(head: *mut HazardChunk) -> Self {
        // Pair with the publish-side fence so every slot write that happened
        // before a retire is visible to the copy below.
        atomic::fence(Ordering::SeqCst);

        let mut size = 0;
        let mut p = head;
        while !p.is_null() {
            // Safety: chunks are never deallocated before their domain, and
            // the caller borrows the domain.
            let chunk = unsafe { &*p };
            size += chunk.count();
            p = chunk.next.load(Ordering::Relaxed);
        }

        let mut ptrs = Vec::with_capacity(size);
        let mut p = head;
        while !p.is_null() {
            // Safety: as above.
            let chunk = unsafe { &*p };
            chunk.copy_hazard_pointers(&mut ptrs);
            p = chunk.next.load(Ordering::Relaxed);
        }
        debug_assert_eq!(ptrs.len(), size);

        ptrs.sort_unstable();
        // Nulls sort to the front; skip them so membership tests never match
        // an empty slot. Clearing the mark bit maps x to x or x - 1, which
        // preserves the sort order.
        let begin = ptrs.partition_point(|p| p.is_null());
        for p in &mut ptrs[begin..] {
            *p = without_mark_bit(*p);
        }

        Self { ptrs, begin }
    }

    /// Whether any published hazard pointer protects `ptr`.
    pub(crate) fn search(&self, ptr: *mut u8) -> bool {
        self.ptrs[self.begin..].binary_search(&ptr).is_ok()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::mark::with_mark_bit;

    fn chunk_with(values: &[*mut u8]) -> HazardChunk {
        let chunk = HazardChunk::new(values.len());
        let block = chunk.reserve(values.len()).unwrap();
        for (slot, v) in block.iter().zip(values) {
            slot.store(*v, Ordering::Release);
        }
        chunk
    }

    #[test]
    fn empty_chain_contains_nothing() {
        let snap = HazardSnapshot::new(core::ptr::null_mut());
        assert!(!snap.search(0x40usize as *mut u8));
    }

    #[test]
    fn nulls_are_skipped() {
        let chunk = chunk_with(&[core::ptr::null_mut(), 0x40usize as *mut u8]);
        let snap = HazardSnapshot::new(&chunk as *const _ as *mut _);
        assert!(snap.search(0x40usize as *mut u8));
        assert!(!snap.search(core::ptr::null_mut()));
        assert!(!snap.search(0x80usize as *mut u8));
    }

    #[test]
    fn mark_bits_are_masked() {
        let marked = with_mark_bit(0x40usize as *mut u8);
        let chunk = chunk_with(&[marked]);
        let snap = HazardSnapshot::new(&chunk as *const _ as *mut _);
        assert!(snap.search(0x40usize as *mut u8));
    }

    #[test]
    fn walks_the_whole_chain() {
        let a = Box::into_raw(Box::new(chunk_with(&[0x40usize as *mut u8])));
        let b = Box::into_raw(Box::new(chunk_with(&[0x80usize as *mut u8])));
        unsafe { &*b }.next.store(a, Ordering::Relaxed);

        let snap = HazardSnapshot::new(b);
        assert!(snap.search(0x40usize as *mut u8));
        assert!(snap.search(0x80usize as *mut u8));
        assert!(!snap.search(0xc0usize as *mut u8));

        let _ = unsafe { Box::from_raw(a) };
        let _ = unsafe { Box::from_raw(b) };
    }
}
