use std::sync::atomic;

use hazalloc::allocator::{free, Heap, SizeClass};
use hazalloc::smr;

fn leaked_heap(slot_size: usize) -> &'static Heap {
    let sc = Box::leak(Box::new(SizeClass::new(slot_size)));
    sc.init();
    Box::leak(Box::new(Heap::new(sc)))
}

#[test]
fn single_thread_churn() {
    const ITERATIONS: usize = 100_000;

    let heap = leaked_heap(64);

    for round in 0..ITERATIONS {
        let ptr = heap.alloc();

        unsafe { (ptr as *mut u64).write(round as u64) };
        assert_eq!(round as u64, unsafe { (ptr as *mut u64).read() });

        unsafe { free(ptr) };
    }

    smr::try_free_all();
    assert!(heap.check_consistency());
}

#[test]
fn concurrent_slots_are_distinct() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1_000;

    let heap = leaked_heap(64);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            std::thread::spawn(move || {
                smr::register_thread();

                let ptrs: Vec<_> = (0..PER_THREAD).map(|_| heap.alloc() as usize).collect();
                for ptr in ptrs.iter() {
                    // Slots are 64 bytes wide, overlap would show up as a
                    // torn stamp below
                    unsafe { ((*ptr) as *mut u64).write(*ptr as u64) };
                }
                ptrs
            })
        })
        .collect();

    let mut all: Vec<usize> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(total, all.len());

    for ptr in all.iter() {
        assert_eq!(*ptr as u64, unsafe { ((*ptr) as *mut u64).read() });
        unsafe { free((*ptr) as *mut u8) };
    }

    smr::try_free_all();
    assert!(heap.check_consistency());
}

#[test]
fn shared_table_stress() {
    const THREADS: usize = 4;
    const ENTRIES: usize = 32;
    const ITERATIONS: usize = 200_000;
    const STRIDES: [usize; THREADS] = [1, 3, 5, 7];

    let heap = leaked_heap(1024);
    let entries: &'static Vec<atomic::AtomicPtr<u8>> = Box::leak(Box::new(
        (0..ENTRIES)
            .map(|_| atomic::AtomicPtr::new(std::ptr::null_mut()))
            .collect(),
    ));

    let handles: Vec<_> = STRIDES
        .iter()
        .map(|stride| {
            let increment = *stride;
            std::thread::spawn(move || {
                smr::register_thread();

                let mut index = 0;
                for _ in 0..ITERATIONS {
                    loop {
                        let entry = &entries[index];
                        let current = entry.load(atomic::Ordering::SeqCst);

                        if !current.is_null() {
                            if entry
                                .compare_exchange(
                                    current,
                                    std::ptr::null_mut(),
                                    atomic::Ordering::SeqCst,
                                    atomic::Ordering::SeqCst,
                                )
                                .is_err()
                            {
                                continue;
                            }

                            // Whoever parked the pointer stamped it with
                            // its table index
                            assert_eq!((index as u32) << 10, unsafe {
                                (current as *mut u32).read()
                            });
                            unsafe { (current as *mut u32).write(u32::MAX) };
                            unsafe { free(current) };
                        } else {
                            let fresh = heap.alloc();
                            unsafe { (fresh as *mut u32).write((index as u32) << 10) };

                            if entry
                                .compare_exchange(
                                    std::ptr::null_mut(),
                                    fresh,
                                    atomic::Ordering::SeqCst,
                                    atomic::Ordering::SeqCst,
                                )
                                .is_err()
                            {
                                unsafe { (fresh as *mut u32).write(u32::MAX) };
                                unsafe { free(fresh) };
                                continue;
                            }
                        }

                        break;
                    }

                    index += increment;
                    while index >= ENTRIES {
                        index -= ENTRIES;
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Drain what the threads left parked in the table
    for (index, entry) in entries.iter().enumerate() {
        let remaining = entry.swap(std::ptr::null_mut(), atomic::Ordering::SeqCst);
        if !remaining.is_null() {
            assert_eq!((index as u32) << 10, unsafe {
                (remaining as *mut u32).read()
            });
            unsafe { free(remaining) };
        }
    }

    smr::try_free_all();
    assert!(heap.check_consistency());
}

#[test]
fn randomized_churn_stays_consistent() {
    use rand::Rng;

    const ITERATIONS: usize = 20_000;

    let heap = leaked_heap(128);
    let mut rng = rand::thread_rng();
    let mut live: Vec<*mut u8> = Vec::new();

    for _ in 0..ITERATIONS {
        if live.is_empty() || rng.gen_bool(0.55) {
            let ptr = heap.alloc();
            unsafe { (ptr as *mut u64).write(ptr as u64) };
            live.push(ptr);
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            assert_eq!(victim as u64, unsafe { (victim as *mut u64).read() });
            unsafe { free(victim) };
        }
    }

    assert!(heap.check_consistency());

    for ptr in live {
        unsafe { free(ptr) };
    }

    smr::try_free_all();
    assert!(heap.check_consistency());
}

#[test]
fn large_slots_come_from_the_os() {
    let heap = leaked_heap(32 * 1024);

    let ptr = heap.alloc();
    unsafe { ptr.write_bytes(0x77, 32 * 1024) };
    assert_eq!(0x77, unsafe { ptr.add(32 * 1024 - 1).read() });
    unsafe { heap.free(ptr) };

    assert!(heap.check_consistency());
}
