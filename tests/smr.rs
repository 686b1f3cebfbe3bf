use std::sync::{atomic, mpsc};

use hazalloc::smr;

/// A free must be postponed for as long as another thread still holds a
/// hazardous reference, and run once that reference is gone
#[test]
fn free_waits_for_concurrent_reader() {
    static FREED: atomic::AtomicBool = atomic::AtomicBool::new(false);
    static TARGET: atomic::AtomicPtr<u64> = atomic::AtomicPtr::new(std::ptr::null_mut());

    unsafe fn mark_freed(ptr: *mut ()) {
        FREED.store(true, atomic::Ordering::SeqCst);
        drop(unsafe { Box::from_raw(ptr as *mut u64) });
    }

    smr::register_thread();

    let boxed = Box::into_raw(Box::new(0xfeed_u64));
    TARGET.store(boxed, atomic::Ordering::SeqCst);

    let (reader_ready, ready) = mpsc::channel();
    let (release_reader, release) = mpsc::channel::<()>();

    let reader = std::thread::spawn(move || {
        smr::register_thread();

        // The artificially delayed reader of the rotation scenario: grab a
        // hazardous reference and sit on it
        let ptr = smr::hazardous_load(&TARGET, 0);
        assert_eq!(0xfeed, unsafe { *ptr });

        reader_ready.send(()).unwrap();
        release.recv().unwrap();

        assert_eq!(0xfeed, unsafe { *ptr });
        smr::clear(0);
    });

    ready.recv().unwrap();

    // Unlink, then retire: the reader still publishes the pointer, so the
    // free has to be queued instead of running inline
    TARGET.store(std::ptr::null_mut(), atomic::Ordering::SeqCst);
    unsafe { smr::free_or_queue(boxed as *mut (), mark_freed) };

    assert!(!FREED.load(atomic::Ordering::SeqCst));
    smr::try_free_all();
    assert!(!FREED.load(atomic::Ordering::SeqCst));

    release_reader.send(()).unwrap();
    reader.join().unwrap();

    // With the hazard gone the next sweep may reclaim it
    for _ in 0..1_000 {
        if FREED.load(atomic::Ordering::SeqCst) {
            break;
        }
        smr::try_free_all();
        std::thread::yield_now();
    }
    assert!(FREED.load(atomic::Ordering::SeqCst));
}

/// Hammers the delayed-free buffer from four threads: every parked item
/// must run its reclaimer exactly once
#[test]
fn delayed_free_stress() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 12_800;
    const SLOTS: usize = 64;
    const BASE: usize = 0x10_0000;

    static FREES: [atomic::AtomicUsize; SLOTS] = {
        const ZERO: atomic::AtomicUsize = atomic::AtomicUsize::new(0);
        [ZERO; SLOTS]
    };

    unsafe fn count_free(ptr: *mut ()) {
        let slot = (ptr as usize - BASE) % SLOTS;
        FREES[slot].fetch_add(1, atomic::Ordering::SeqCst);
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            std::thread::spawn(move || {
                smr::register_thread();

                for iteration in 0..ITERATIONS {
                    let slot = iteration % SLOTS;
                    let ptr = (BASE + slot) as *mut ();

                    // Publishing the pointer ourselves forces the retire
                    // onto the delayed path
                    smr::set(2, ptr);
                    unsafe { smr::free_or_queue(ptr, count_free) };
                    smr::clear(2);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    smr::register_thread();
    let expected: usize = THREADS * ITERATIONS;
    for _ in 0..10_000 {
        let total: usize = FREES
            .iter()
            .map(|count| count.load(atomic::Ordering::SeqCst))
            .sum();
        if total == expected {
            break;
        }
        smr::try_free_all();
        std::thread::yield_now();
    }

    let total: usize = FREES
        .iter()
        .map(|count| count.load(atomic::Ordering::SeqCst))
        .sum();
    assert_eq!(expected, total);

    for count in FREES.iter() {
        assert_eq!(
            THREADS * (ITERATIONS / SLOTS),
            count.load(atomic::Ordering::SeqCst)
        );
    }
}

/// The buffer keeps track of how many retirements actually had to wait
#[test]
fn deferral_statistic_moves() {
    smr::register_thread();

    let before = smr::deferred_frees();

    let target = 0xdead_0000 as *mut ();
    smr::set(1, target);
    unsafe { smr::free_or_queue(target, noop_free) };
    smr::clear(1);

    assert!(smr::deferred_frees() > before);

    smr::try_free_all();
}

unsafe fn noop_free(_ptr: *mut ()) {}
