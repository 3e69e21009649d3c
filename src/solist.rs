use crate::accessor::SolAccessor;
use crate::domain::Domain;
use crate::mark::MarkPtr;
use crate::sync::atomic::{AtomicPtr, AtomicU32};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

/// Hash values are 32 bits wide; clients hash their keys themselves and hand
/// the result in. Bit reversal is internal.
pub type Hash = u32;

pub(crate) type SoKey = u32;

/// Low bit of a split-order key: set on data nodes, clear on bucket dummies.
pub(crate) const DATA_BIT: SoKey = 1;

/// Split-order key of a data node.
///
/// Overwriting the low bit of the reversed hash halves the key space: hashes
/// `h` and `h ^ (1 << 31)` map to the same key and are treated as the same
/// entry. Storing the original hash alongside would lift that at one extra
/// word per node; this keeps the original behaviour.
pub(crate) fn node_key(h: Hash) -> SoKey {
    h.reverse_bits() | DATA_BIT
}

/// Split-order key of the bucket dummy for slot `slot`.
pub(crate) fn bucket_key(slot: u32) -> SoKey {
    slot.reverse_bits() & !DATA_BIT
}

/// A link in the split-ordered list: either a bucket dummy (stable entry
/// point for one hash slot, `payload` is `None`) or a data node.
///
/// The variants share one struct so that `next` edges, key ordering and the
/// mark-then-unlink protocol are uniform along the list; `key & DATA_BIT`
/// is the tag.
pub(crate) struct Bucket<T> {
    pub(crate) hashv: Hash,
    pub(crate) key: SoKey,
    pub(crate) next: MarkPtr<Bucket<T>>,
    pub(crate) payload: Option<T>,
}

impl<T> Bucket<T> {
    pub(crate) fn dummy(slot: u32) -> Self {
        Self {
            hashv: slot,
            key: bucket_key(slot),
            next: MarkPtr::null(),
            payload: None,
        }
    }

    pub(crate) fn data(hashv: Hash, payload: T) -> Self {
        Self {
            hashv,
            key: node_key(hashv),
            next: MarkPtr::null(),
            payload: Some(payload),
        }
    }

    pub(crate) fn is_node(&self) -> bool {
        self.key & DATA_BIT == DATA_BIT
    }
}

/// An immutable `(size, buckets)` pair.
///
/// Expansion swaps in a doubled copy and threads the superseded record onto
/// `prev`; superseded records are freed only when the list drops, so a
/// reader that loaded the table before an expansion keeps a consistent, if
/// under-bucketed, view. Bucket dummies never move, so traversal through an
/// old table stays correct.
pub(crate) struct Table<T> {
    pub(crate) size: u32,
    pub(crate) slots: Box<[AtomicPtr<Bucket<T>>]>,
    prev: *mut Table<T>,
}

impl<T> Table<T> {
    fn with_slots(size: u32, init: impl Fn(usize) -> *mut Bucket<T>) -> Self {
        let slots = (0..size as usize)
            .map(|i| AtomicPtr::new(init(i)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            size,
            slots,
            prev: core::ptr::null_mut(),
        }
    }
}

/// A lock-free hash set of 32-bit hash values with attached payloads,
/// realised as a single sorted linked list over bit-reversed keys.
///
/// Buckets are lazily created dummy nodes inside that list, so growing the
/// table never rehashes or moves an element; it only doubles the bucket
/// array and splits buckets by inserting more dummies.
///
/// All operations go through a per-thread [`accessor`](Self::accessor),
/// which carries the hazard pointers that make unlinked nodes safe to free.
/// The list owns its reclamation [`Domain`]; dropping the list frees every
/// node.
pub struct SoList<T> {
    table: AtomicPtr<Table<T>>,
    max_bucket_length: u32,
    n_items: AtomicU32,
    pub(crate) domain: Domain<Bucket<T>>,
}

// Safety: nodes are created by one thread, read by many and dropped by
// whichever thread reclaims them, so payloads cross threads both by
// reference and by value.
unsafe impl<T: Send> Send for SoList<T> {}
unsafe impl<T: Send + Sync> Sync for SoList<T> {}

const DEFAULT_MAX_BUCKET_LENGTH: u32 = 4;

impl<T> SoList<T> {
    /// Creates a list with `size` initial buckets and the default load bound.
    pub fn new(size: u32) -> Self {
        Self::with_bucket_length(size, DEFAULT_MAX_BUCKET_LENGTH)
    }

    /// Creates a list with `size` initial buckets that splits a bucket once
    /// more than `bucket_length` data nodes span it.
    pub fn with_bucket_length(size: u32, bucket_length: u32) -> Self {
        assert!(size > 0, "bucket count must be non-zero");
        assert!(bucket_length > 0, "bucket length must be non-zero");
        let head = Box::into_raw(Box::new(Bucket::dummy(0)));
        let table = Table::with_slots(size, |i| {
            if i == 0 {
                head
            } else {
                core::ptr::null_mut()
            }
        });
        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(table))),
            max_bucket_length: bucket_length,
            n_items: AtomicU32::new(0),
            domain: Domain::new(),
        }
    }

    /// A per-thread handle for operating on the list.
    pub fn accessor(&self) -> SolAccessor<'_, T> {
        SolAccessor::new(self)
    }

    /// Approximate number of elements.
    ///
    /// The counter is maintained with atomic adds and subs but is not
    /// linearisable against concurrent inserts and removes; it only feeds
    /// the expansion heuristic.
    pub fn len(&self) -> usize {
        self.n_items.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of buckets. Grows, never shrinks.
    pub fn capacity(&self) -> usize {
        self.table().size as usize
    }

    pub(crate) fn max_bucket_length(&self) -> u32 {
        self.max_bucket_length
    }

    pub(crate) fn table(&self) -> &Table<T> {
        // Safety: tables are freed only on drop, which cannot run while
        // anything borrows self.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    pub(crate) fn inc_items(&self) {
        self.n_items.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn dec_items(&self) {
        self.n_items.fetch_sub(1, Ordering::Release);
    }

    /// Doubles the bucket array if it still holds `curr_size` buckets.
    ///
    /// A no-op when another thread got there first. The old bucket pointers
    /// occupy the low half of the new array, the high half starts null and
    /// fills lazily.
    pub(crate) fn expand(&self, curr_size: u32) {
        let mut cur = self.table.load(Ordering::Acquire);
        loop {
            // Safety: tables live until drop.
            let t = unsafe { &*cur };
            if curr_size < t.size {
                return;
            }
            let Some(new_size) = t.size.checked_mul(2) else {
                return;
            };
            let old = &t.slots;
            let table = Box::into_raw(Box::new(Table::with_slots(new_size, |i| {
                if i < t.size as usize {
                    old[i].load(Ordering::Acquire)
                } else {
                    core::ptr::null_mut()
                }
            })));
            // Safety: unpublished until the CAS succeeds.
            unsafe { &mut *table }.prev = cur;
            match self
                .table
                .compare_exchange(cur, table, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(now) => {
                    // Safety: the CAS failed, so `table` never escaped.
                    drop(unsafe { Box::from_raw(table) });
                    cur = now;
                }
            }
        }
    }
}

impl<T> Drop for SoList<T> {
    fn drop(&mut self) {
        let newest = self.table.load(Ordering::Relaxed);
        // Safety: `&mut self` means no accessor is live; nothing else reaches
        // the nodes or the tables, and unlinked nodes sit on the domain's
        // delete list, not in this walk.
        unsafe {
            let mut cur = (*newest).slots[0].load(Ordering::Relaxed);
            while !cur.is_null() {
                let next = (*cur).next.load_ptr();
                drop(Box::from_raw(cur));
                cur = next;
            }
            let mut t = newest;
            while !t.is_null() {
                let prev = (*t).prev;
                drop(Box::from_raw(t));
                t = prev;
            }
        }
        // The domain field drops after this body and collects what remains.
    }
}
