use crate::context::HazardContext;
use crate::solist::{bucket_key, node_key, Bucket, Hash, SoKey, SoList, Table};
use crate::sync::atomic;
use alloc::boxed::Box;
use core::sync::atomic::Ordering;

const HP_PREV: usize = 0;
const HP_CUR: usize = 1;
const HP_NEXT: usize = 2;

/// A per-thread handle for operating on a [`SoList`].
///
/// The accessor owns three hazard-pointer slots, one for each leg of the
/// traversal cursor (`prev`, `cur`, `next`), plus a local retire buffer of
/// `R` pointers. Construct one per thread with [`SoList::accessor`]; the
/// accessor is `Send` but not `Sync`.
///
/// References returned by [`find`](Self::find) borrow the accessor mutably,
/// which keeps the protecting hazard pointer published until the borrow
/// ends. Dropping the accessor releases its slots and hands any pending
/// retirements back to the list's domain.
pub struct SolAccessor<'a, T, const R: usize = 32> {
    list: &'a SoList<T>,
    ctx: HazardContext<'a, Bucket<T>, 3, R>,
    prev: *mut Bucket<T>,
    cur: *mut Bucket<T>,
    next: *mut Bucket<T>,
    steps: u32,
}

// Safety: the accessor can move to another thread wholesale; its cursor
// pointers are only meaningful mid-operation and its retire buffer may drop
// `T`s wherever the accessor ends up.
unsafe impl<T: Send + Sync, const R: usize> Send for SolAccessor<'_, T, R> {}

impl<'a, T, const R: usize> SolAccessor<'a, T, R> {
    pub fn new(list: &'a SoList<T>) -> Self {
        Self {
            list,
            ctx: HazardContext::new(&list.domain),
            prev: core::ptr::null_mut(),
            cur: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            steps: 0,
        }
    }

    /// Inserts `payload` under `h`. Returns `false`, dropping `payload`, if
    /// an entry with the same split-order key already exists.
    ///
    /// A successful insert is linearised at the CAS that publishes the new
    /// node. Afterwards the accessor keeps walking the bucket to decide
    /// whether to split it or double the table.
    pub fn insert(&mut self, h: Hash, payload: T) -> bool {
        let nbuckets = self.list.table().size;
        let node = Box::into_raw(Box::new(Bucket::data(h, payload)));
        loop {
            if self.find_node(h) {
                // Safety: the node was never published.
                drop(unsafe { Box::from_raw(node) });
                self.zap();
                return false;
            }
            // Cover the new node before publication so the expansion walk
            // below never holds it unprotected. The prev slot is free for
            // that: nothing dereferences prev past this point.
            self.ctx.publish(HP_PREV, node);
            // Safety: the node is still exclusively ours.
            unsafe { &*node }.next.store(self.next);
            // Safety: cur is protected; the expected value is protected by
            // the next slot, so its address cannot have been reused.
            if unsafe { &*self.cur }.next.cas(self.next, node) {
                self.list.inc_items();
                break;
            }
        }
        // Rebase the cursor onto the new node for the expansion walk.
        self.cur = node;
        self.ctx.publish(HP_CUR, node);
        self.check_expand(h, nbuckets);
        self.zap();
        true
    }

    /// Removes the entry stored under `h`. Returns `false` if there is none.
    ///
    /// Removal is linearised at the CAS that sets the mark on the node's
    /// `next` word; the physical unlink may be finished by any traversal
    /// that passes by, and whichever thread wins the unlink retires the
    /// node through its own context.
    pub fn remove(&mut self, h: Hash) -> bool {
        let removed = loop {
            if !self.find_node(h) {
                break false;
            }
            // Safety: cur is protected; the found node is always a data
            // node, never a bucket dummy, since node keys are odd.
            let cur = unsafe { &*self.cur };
            if !cur.next.cas_mark(self.next, self.next) {
                continue;
            }
            self.list.dec_items();
            // Safety: prev is protected.
            let prev = unsafe { &*self.prev };
            if prev.next.cas(self.cur, self.next) {
                // Safety: the node is unlinked and only the unlink winner
                // retires it; it originated in Box::into_raw.
                unsafe { self.ctx.retire(self.cur) };
            } else {
                // Lost the unlink race; the helping pass inside find_node
                // finishes the job.
                self.find_node(h);
            }
            break true;
        };
        self.zap();
        removed
    }

    /// Looks up the entry stored under `h`.
    ///
    /// The returned reference keeps the node's hazard pointer published for
    /// as long as it lives, because every other accessor operation needs
    /// the `&mut self` back first.
    pub fn find(&mut self, h: Hash) -> Option<&T> {
        if self.find_node(h) {
            // Safety: cur is protected and stays protected while the
            // returned borrow is live.
            let node = unsafe { &*self.cur };
            node.payload.as_ref()
        } else {
            self.zap();
            None
        }
    }

    /// Clears this accessor's hazard pointers, ending all protection it
    /// currently provides.
    pub fn reset(&mut self) {
        self.zap();
    }

    /// Positions the cursor on the node with `h`'s split-order key.
    ///
    /// On `true`, `cur` is the matching data node and `next` its validated
    /// unmarked successor. On `false`, `cur` is the last node with a
    /// smaller key and `next` the validated successor with a greater one
    /// (or null), which is exactly the insertion point for the key.
    fn find_node(&mut self, h: Hash) -> bool {
        let list = self.list;
        let t = list.table();
        let slot = h % t.size;
        let head = self.bucket_head(t, slot);
        self.steps = 0;
        self.seek(head, node_key(h), true);
        // Safety: cur is protected, or is a never-reclaimed bucket dummy.
        unsafe { &*self.cur }.key == node_key(h)
    }

    /// Walks from `start` until `next` would pass `key`.
    ///
    /// `inclusive` advances over a node whose key equals `key` (used when
    /// looking the key up); otherwise the walk stops in front of it (used
    /// when choosing a dummy's insertion point).
    ///
    /// Each advance protects the node about to be visited and revalidates
    /// the link that produced it after a full fence; a node seen with its
    /// mark set is unlinked on sight and the walk restarts. On return,
    /// `prev`, `cur` and `next` are protected by their slots.
    fn seek(&mut self, start: *mut Bucket<T>, key: SoKey, inclusive: bool) {
        'retry: loop {
            self.prev = start;
            self.ctx.publish(HP_PREV, start);
            self.cur = start;
            self.ctx.publish(HP_CUR, start);
            loop {
                // Safety: cur is the start dummy (dummies are freed only by
                // the list's drop, which the borrow on `list` excludes) or
                // was protected and validated before we advanced onto it.
                let (next, cur_marked) = unsafe { &*self.cur }.next.load();
                if cur_marked {
                    // cur is logically deleted. Unlink it so the walk never
                    // returns a deleted node; the CAS fails if prev moved
                    // on or is itself marked, and the restart sorts it out.
                    // Safety: prev is protected.
                    let prev = unsafe { &*self.prev };
                    if prev.next.cas(self.cur, next) {
                        // Safety: only the unlink winner retires the node.
                        unsafe { self.ctx.retire(self.cur) };
                    }
                    continue 'retry;
                }
                self.next = next;
                if next.is_null() {
                    return;
                }
                self.ctx.publish(HP_NEXT, next);
                atomic::fence(Ordering::SeqCst);
                // Revalidate after the fence: if next is no longer cur's
                // unmarked successor it may have been retired before our
                // publication became visible to the reclaimer.
                // Safety: cur is still protected.
                let (reloaded, marked) = unsafe { &*self.cur }.next.load();
                if reloaded != next || marked {
                    continue 'retry;
                }
                // Safety: next is protected, and the reload proved it was
                // still reachable after the protection was visible.
                let next_key = unsafe { &*next }.key;
                if next_key > key || (!inclusive && next_key == key) {
                    return;
                }
                self.prev = self.cur;
                self.ctx.publish(HP_PREV, self.prev);
                self.cur = next;
                self.ctx.publish(HP_CUR, next);
                self.steps += 1;
            }
        }
    }

    /// Returns the dummy heading `slot`'s bucket, initialising it first if
    /// this is the first touch of that slot.
    fn bucket_head(&mut self, t: &Table<T>, slot: u32) -> *mut Bucket<T> {
        let head = t.slots[slot as usize].load(Ordering::Acquire);
        if !head.is_null() {
            return head;
        }
        self.initialise_bucket(t, slot);
        let head = t.slots[slot as usize].load(Ordering::Acquire);
        debug_assert!(!head.is_null());
        head
    }

    /// Links a dummy node for `slot` into the list and publishes it in the
    /// bucket array.
    ///
    /// Racing initialisers are resolved by the list itself: whoever links a
    /// dummy with the slot's key first wins, and everyone else adopts that
    /// node and drops their own allocation.
    fn initialise_bucket(&mut self, t: &Table<T>, slot: u32) {
        debug_assert!(slot < t.size);
        let cell = &t.slots[slot as usize];
        if !cell.load(Ordering::Acquire).is_null() {
            return;
        }
        let key = bucket_key(slot);
        let node = Box::into_raw(Box::new(Bucket::dummy(slot)));
        loop {
            if !cell.load(Ordering::Acquire).is_null() {
                // Someone else finished while we were positioning.
                // Safety: our node was never published.
                drop(unsafe { Box::from_raw(node) });
                break;
            }
            let start = self.parent_bucket(t, slot);
            self.seek(start, key, false);
            if !self.next.is_null() {
                // Safety: next is protected.
                if unsafe { &*self.next }.key == key {
                    // Another thread's dummy for this slot is already
                    // linked; point the slot at it.
                    cell.store(self.next, Ordering::Release);
                    // Safety: ours was never published.
                    drop(unsafe { Box::from_raw(node) });
                    break;
                }
            }
            // Safety: the node is still exclusively ours.
            unsafe { &*node }.next.store(self.next);
            // Safety: cur is protected; the expected successor is protected
            // by the next slot.
            if unsafe { &*self.cur }.next.cas(self.next, node) {
                cell.store(node, Ordering::Release);
                break;
            }
        }
        debug_assert!(!cell.load(Ordering::Acquire).is_null());
        // Safety: dummies are never reclaimed while the list is alive.
        debug_assert_eq!(unsafe { &*cell.load(Ordering::Acquire) }.key, key);
    }

    /// The closest initialised ancestor dummy to start a bucket insertion
    /// from.
    ///
    /// Ancestors are formed by clearing the top set bit of the slot index,
    /// so every ancestor's key precedes `slot`'s key in split order; slot 0
    /// is initialised at construction and ends every chain.
    fn parent_bucket(&self, t: &Table<T>, slot: u32) -> *mut Bucket<T> {
        let mut p = slot;
        while p != 0 {
            p &= !(1u32 << (31 - p.leading_zeros()));
            let b = t.slots[p as usize].load(Ordering::Acquire);
            if !b.is_null() {
                return b;
            }
        }
        t.slots[0].load(Ordering::Acquire)
    }

    /// Post-insert load check: walk the rest of the inserted node's bucket
    /// and split it, or double the table, when it has grown past the bound.
    ///
    /// The walk is a heuristic; any concurrent modification simply ends the
    /// count early.
    fn check_expand(&mut self, h: Hash, nbuckets: u32) {
        loop {
            // Safety: cur is protected throughout this walk.
            let (next, marked) = unsafe { &*self.cur }.next.load();
            if marked || next.is_null() {
                break;
            }
            self.next = next;
            self.ctx.publish(HP_NEXT, next);
            atomic::fence(Ordering::SeqCst);
            let (reloaded, remarked) = unsafe { &*self.cur }.next.load();
            if reloaded != next || remarked {
                break;
            }
            // Safety: next is protected and revalidated.
            if !unsafe { &*next }.is_node() {
                break;
            }
            self.cur = next;
            self.ctx.publish(HP_CUR, next);
            self.steps += 1;
        }

        let max = self.list.max_bucket_length();
        if self.steps <= max {
            return;
        }
        let list = self.list;
        let t = list.table();
        let slot = h % t.size;
        if self.steps >= max.saturating_mul(2) || list.len() as u32 >= max.saturating_mul(t.size) {
            list.expand(nbuckets);
            let t = list.table();
            if let Some(split) = slot.checked_add(nbuckets).filter(|s| *s < t.size) {
                self.initialise_bucket(t, split);
            }
        } else {
            // Split the bucket we inserted into; only effective when it was
            // not already split by an earlier expansion.
            if let Some(split) = slot.checked_add(nbuckets / 2).filter(|s| *s < t.size) {
                self.initialise_bucket(t, split);
            }
        }
    }

    fn zap(&mut self) {
        self.prev = core::ptr::null_mut();
        self.cur = core::ptr::null_mut();
        self.next = core::ptr::null_mut();
        self.ctx.clear(HP_PREV);
        self.ctx.clear(HP_CUR);
        self.ctx.clear(HP_NEXT);
    }
}
