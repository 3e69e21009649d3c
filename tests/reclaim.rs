use sohash::{Domain, HazardContext};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

struct CountDrops(Arc<AtomicUsize>);
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn collect_frees_retired_objects() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain: Domain<CountDrops> = Domain::new();

    for _ in 0..100 {
        let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
        unsafe { domain.retire_ptr(p) };
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert_eq!(domain.collect(), 100);
    assert_eq!(drops.load(Ordering::SeqCst), 100);
    assert_eq!(domain.collect(), 0);
}

#[test]
fn protected_object_outlives_retirement() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain: Domain<(usize, CountDrops)> = Domain::new();
    let ctx: HazardContext<'_, (usize, CountDrops), 3, 8> = HazardContext::new(&domain);

    let x = Box::into_raw(Box::new((42, CountDrops(Arc::clone(&drops)))));
    ctx.publish(0, x);

    // Safety: x came from a Box, is not reachable elsewhere, and is only
    // read below through the published hazard pointer.
    unsafe { domain.retire_ptr(x) };

    assert_eq!(domain.collect(), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    // The reader can still see the original contents.
    assert_eq!(unsafe { &*x }.0, 42);

    ctx.clear(0);
    assert_eq!(domain.collect(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn reader_protection_holds_across_threads() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain: Domain<(usize, CountDrops)> = Domain::new();
    let x = Box::into_raw(Box::new((42, CountDrops(Arc::clone(&drops)))));
    let x_addr = x as usize;
    let barrier = Barrier::new(2);

    std::thread::scope(|s| {
        s.spawn(|| {
            let ctx: HazardContext<'_, (usize, CountDrops), 3, 8> = HazardContext::new(&domain);
            let x = x_addr as *mut (usize, CountDrops);
            ctx.publish(0, x);
            barrier.wait(); // protected
            barrier.wait(); // writer retired and tried to collect
            // Re-read through the protected pointer: still the original.
            assert_eq!(unsafe { &*x }.0, 42);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            ctx.clear(0);
            barrier.wait(); // cleared
        });
        s.spawn(|| {
            barrier.wait(); // reader has published
            let x = x_addr as *mut (usize, CountDrops);
            // Safety: unlinked from the writer's point of view; the reader
            // holds a hazard pointer, which is exactly what retirement is
            // for.
            unsafe { domain.retire_ptr(x) };
            assert_eq!(domain.collect(), 0);
            barrier.wait();
            barrier.wait(); // reader has cleared
            assert_eq!(domain.collect(), 1);
        });
    });
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn producer_and_collector_free_everything_exactly_once() {
    const N: usize = 10_000;
    let drops = Arc::new(AtomicUsize::new(0));
    let domain: Domain<CountDrops> = Domain::new();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..N {
                let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
                // Safety: p is fresh and unreachable elsewhere.
                unsafe { domain.retire_ptr(p) };
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                domain.collect();
            }
        });
    });

    domain.collect();
    assert_eq!(drops.load(Ordering::SeqCst), N);
}

#[test]
fn retire_overflow_triggers_reclaim() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain: Domain<CountDrops> = Domain::new();
    let mut ctx: HazardContext<'_, CountDrops, 1, 2> = HazardContext::new(&domain);

    let a = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
    let b = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
    ctx.publish(0, a);
    // Safety: both pointers are fresh Boxes, retired once each.
    unsafe { ctx.retire(a) };
    unsafe { ctx.retire(b) };

    // The overflow reclaim freed b (unprotected) and kept a.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    ctx.clear(0);
    assert_eq!(ctx.reclaim(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn context_drop_hands_pending_retires_back() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain: Domain<CountDrops> = Domain::new();
    {
        let mut ctx: HazardContext<'_, CountDrops, 3, 64> = HazardContext::new(&domain);
        for _ in 0..5 {
            let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
            // Safety: fresh Box, retired once.
            unsafe { ctx.retire(p) };
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        // Dropping the context releases its slots, hands the buffer to the
        // domain and runs one collect.
    }
    assert_eq!(drops.load(Ordering::SeqCst), 5);
}

#[test]
fn domain_drop_reclaims_leftovers() {
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let domain: Domain<CountDrops> = Domain::new();
        for _ in 0..10 {
            let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
            // Safety: fresh Box, retired once.
            unsafe { domain.retire_ptr(p) };
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 10);
}
